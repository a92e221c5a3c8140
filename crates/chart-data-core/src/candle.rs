use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar, normalized from whichever provider supplied it.
///
/// Serializes as `{t, o, h, l, c, v}` with `t` an integer millisecond open time
/// and the prices/volume as JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Inclusive open time, milliseconds since the Unix epoch.
    pub t: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub o: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub h: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub l: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub c: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub v: Decimal,
}

impl Candle {
    /// Open time as a UTC datetime, or `None` if `t` is out of chrono's range.
    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn serializes_as_short_keys_with_numbers() {
        let candle = Candle {
            t: 1_736_942_400_000,
            o: dec!(150.12),
            h: dec!(151.5),
            l: dec!(149),
            c: dec!(150.99),
            v: dec!(1000),
        };

        let json = serde_json::to_value(&candle).unwrap();
        assert_eq!(json["t"], serde_json::json!(1_736_942_400_000_i64));
        assert_eq!(json["o"], serde_json::json!(150.12));
        assert_eq!(json["h"], serde_json::json!(151.5));
        assert_eq!(json["l"], serde_json::json!(149.0));
        assert_eq!(json["v"], serde_json::json!(1000.0));
    }

    #[test]
    fn open_time_converts_millis() {
        let candle = Candle {
            t: 1_736_942_400_000,
            o: dec!(1),
            h: dec!(1),
            l: dec!(1),
            c: dec!(1),
            v: dec!(0),
        };
        assert_eq!(
            candle.open_time().unwrap().to_rfc3339(),
            "2025-01-15T12:00:00+00:00"
        );
    }
}
