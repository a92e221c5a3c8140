use std::fmt;
use std::str::FromStr;

use chart_data_core::candle::Candle;
use chart_data_core::coverage::ProviderId;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::SourceError;

/// Converts one provider's raw kline shape into a [`Candle`].
///
/// Implementations are pure: no network, no clock. `adapt_many` returns
/// candles in ascending open-time order regardless of how the provider
/// ordered them.
pub trait KlineAdapter {
    type Raw: fmt::Debug;

    const PROVIDER: ProviderId;

    /// Set when the provider returns newest bars first.
    const NEWEST_FIRST: bool = false;

    fn adapt(raw: &Self::Raw) -> Result<Candle, SourceError>;

    fn adapt_many(raws: &[Self::Raw]) -> Result<Vec<Candle>, SourceError> {
        let mut candles = raws
            .iter()
            .map(Self::adapt)
            .collect::<Result<Vec<_>, _>>()?;
        if Self::NEWEST_FIRST {
            candles.reverse();
        }
        Ok(candles)
    }
}

/// Text form of a JSON scalar, accepting both `"1.5"` and `1.5`.
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn parse_decimal(
    provider: ProviderId,
    raw: &impl fmt::Debug,
    field: &str,
    text: &str,
) -> Result<Decimal, SourceError> {
    let trimmed = text.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|e| {
            SourceError::malformed(provider, format!("{raw:?}"), format!("invalid {field} '{text}': {e}"))
        })
}

pub(crate) fn parse_volume(
    provider: ProviderId,
    raw: &impl fmt::Debug,
    text: &str,
) -> Result<Decimal, SourceError> {
    let volume = parse_decimal(provider, raw, "volume", text)?;
    if volume.is_sign_negative() && !volume.is_zero() {
        return Err(SourceError::malformed(
            provider,
            format!("{raw:?}"),
            format!("negative volume {volume}"),
        ));
    }
    Ok(volume)
}

pub(crate) fn parse_open_time(
    provider: ProviderId,
    raw: &impl fmt::Debug,
    value: &Value,
) -> Result<i64, SourceError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        SourceError::malformed(provider, format!("{raw:?}"), format!("invalid open time {value}"))
    })
}

/// Adapt an array-shaped kline whose first six columns are
/// `[openTime, open, high, low, close, volume, ...]`.
pub(crate) fn adapt_array_row(
    provider: ProviderId,
    row: &[Value],
    raw: &impl fmt::Debug,
) -> Result<Candle, SourceError> {
    if row.len() < 6 {
        return Err(SourceError::malformed(
            provider,
            format!("{raw:?}"),
            format!("expected at least 6 columns, got {}", row.len()),
        ));
    }

    let text = |index: usize, field: &str| {
        scalar_text(&row[index]).ok_or_else(|| {
            SourceError::malformed(
                provider,
                format!("{raw:?}"),
                format!("{field} is not a string or number"),
            )
        })
    };

    Ok(Candle {
        t: parse_open_time(provider, raw, &row[0])?,
        o: parse_decimal(provider, raw, "open", &text(1, "open")?)?,
        h: parse_decimal(provider, raw, "high", &text(2, "high")?)?,
        l: parse_decimal(provider, raw, "low", &text(3, "low")?)?,
        c: parse_decimal(provider, raw, "close", &text(4, "close")?)?,
        v: parse_volume(provider, raw, &text(5, "volume")?)?,
    })
}
