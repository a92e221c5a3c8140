pub mod candle;
pub mod coverage;
pub mod error;
pub mod interval;
pub mod schema;
pub mod wire;
