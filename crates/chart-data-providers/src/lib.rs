//! Upstream candle sources and the aggregator that stitches them together.

pub mod adapter;
pub mod aggregator;
pub mod binance;
pub mod bybit;
pub mod error;
mod http;
pub mod pacifica;
pub mod source;

pub use aggregator::{AggregateError, AggregatedCandles, Aggregator};
pub use error::SourceError;
pub use source::{CandleSource, SourceConfig};
