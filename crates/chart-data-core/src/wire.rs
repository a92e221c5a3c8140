use serde::{Deserialize, Serialize};

use crate::candle::Candle;
use crate::interval::Interval;

/// JSON envelope returned to chart clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleResponse {
    pub success: bool,
    pub data: Vec<Candle>,
    pub meta: ResponseMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub symbol: String,
    pub interval: Interval,
    pub start_time: i64,
    pub end_time: i64,
    pub count: usize,
}

impl CandleResponse {
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        start_time: i64,
        end_time: i64,
        data: Vec<Candle>,
    ) -> Self {
        let count = data.len();
        Self {
            success: true,
            data,
            meta: ResponseMeta {
                symbol: symbol.into(),
                interval,
                start_time,
                end_time,
                count,
            },
        }
    }
}
