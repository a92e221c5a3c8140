use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartDataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Invalid range: start {start} must be before end {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("Unknown interval '{0}'. Expected one of: 1m, 3m, 5m, 15m, 30m, 1h, 2h, 4h, 8h, 12h, 1d")]
    UnknownInterval(String),

    #[error("Unknown provider '{0}'. Expected one of: pacifica, binance, bybit")]
    UnknownProvider(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}
