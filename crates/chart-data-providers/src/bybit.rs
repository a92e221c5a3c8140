use async_trait::async_trait;
use chart_data_core::candle::Candle;
use chart_data_core::coverage::ProviderId;
use chart_data_core::interval::Interval;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::adapter::{KlineAdapter, adapt_array_row};
use crate::error::{SourceError, UnavailableCause};
use crate::http::get_json;
use crate::source::{CandleSource, SourceConfig, usdt_pair};

/// One Bybit v5 kline row, all strings:
/// `["startTime", "open", "high", "low", "close", "volume", "turnover"]`
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct BybitKline(pub Vec<Value>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse {
    ret_code: i64,
    ret_msg: String,
    result: Option<BybitResult>,
}

#[derive(Debug, Deserialize)]
struct BybitResult {
    #[serde(default)]
    list: Vec<BybitKline>,
}

pub struct BybitAdapter;

impl KlineAdapter for BybitAdapter {
    type Raw = BybitKline;

    const PROVIDER: ProviderId = ProviderId::Bybit;

    // Bybit lists newest bars first; reversing is required for the ascending
    // invariant.
    const NEWEST_FIRST: bool = true;

    fn adapt(raw: &BybitKline) -> Result<Candle, SourceError> {
        adapt_array_row(Self::PROVIDER, &raw.0, raw)
    }
}

/// Bybit interval codes. Bybit has no 8h bar.
pub fn bybit_interval(interval: Interval) -> Option<&'static str> {
    match interval {
        Interval::M1 => Some("1"),
        Interval::M3 => Some("3"),
        Interval::M5 => Some("5"),
        Interval::M15 => Some("15"),
        Interval::M30 => Some("30"),
        Interval::H1 => Some("60"),
        Interval::H2 => Some("120"),
        Interval::H4 => Some("240"),
        Interval::H8 => None,
        Interval::H12 => Some("720"),
        Interval::D1 => Some("D"),
    }
}

fn parse_response(body: BybitResponse) -> Result<Vec<Candle>, SourceError> {
    if body.ret_code != 0 {
        return Err(SourceError::unavailable(
            ProviderId::Bybit,
            UnavailableCause::Api {
                status: 200,
                message: format!("retCode {}: {}", body.ret_code, body.ret_msg),
            },
        ));
    }
    let result = body.result.ok_or_else(|| {
        SourceError::unavailable(
            ProviderId::Bybit,
            UnavailableCause::Decode("missing result".into()),
        )
    })?;
    BybitAdapter::adapt_many(&result.list)
}

/// Bybit linear perpetuals, a historical source.
pub struct BybitSource {
    client: Client,
    config: SourceConfig,
}

impl BybitSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        Ok(Self {
            client: config.build_client(ProviderId::Bybit)?,
            config,
        })
    }
}

#[async_trait]
impl CandleSource for BybitSource {
    fn id(&self) -> ProviderId {
        ProviderId::Bybit
    }

    fn page_limit(&self) -> usize {
        self.config.page_limit
    }

    fn max_pages(&self) -> usize {
        self.config.max_pages
    }

    async fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, SourceError> {
        let code = bybit_interval(interval).ok_or_else(|| {
            SourceError::unavailable(
                ProviderId::Bybit,
                UnavailableCause::UnsupportedInterval(interval),
            )
        })?;

        let request = self
            .client
            .get(format!("{}/v5/market/kline", self.config.base_url))
            .query(&[
                ("category", "linear".to_string()),
                ("symbol", usdt_pair(symbol)),
                ("interval", code.to_string()),
                ("start", start_ms.to_string()),
                ("end", (end_ms - 1).to_string()),
                ("limit", self.config.page_limit.to_string()),
            ]);

        let body: BybitResponse = get_json(ProviderId::Bybit, request).await?;
        parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const NEWEST_FIRST: &str = r#"{
        "retCode": 0,
        "retMsg": "OK",
        "result": {
            "category": "linear",
            "symbol": "BTCUSDT",
            "list": [
                ["1670616000000", "17071", "17073", "17027", "17055.5", "268611", "15.74462667"],
                ["1670612400000", "17086.5", "17088", "16978", "17071", "6356", "0.37288385"],
                ["1670608800000", "17086.5", "17093", "17071", "17086.5", "4541", "0.26573386"]
            ]
        },
        "retExtInfo": {},
        "time": 1672025956592
    }"#;

    #[test]
    fn newest_first_input_is_reversed() {
        let body: BybitResponse = serde_json::from_str(NEWEST_FIRST).unwrap();
        let raw_times: Vec<String> = body
            .result
            .as_ref()
            .unwrap()
            .list
            .iter()
            .map(|k| k.0[0].as_str().unwrap().to_string())
            .collect();

        let candles = parse_response(body).unwrap();
        let times: Vec<String> = candles.iter().map(|c| c.t.to_string()).collect();

        let mut expected = raw_times;
        expected.reverse();
        assert_eq!(times, expected);
        assert!(candles.windows(2).all(|w| w[0].t < w[1].t));
    }

    #[test]
    fn string_open_time_and_prices_are_parsed() {
        let body: BybitResponse = serde_json::from_str(NEWEST_FIRST).unwrap();
        let candles = parse_response(body).unwrap();

        assert_eq!(candles[0].t, 1_670_608_800_000);
        assert_eq!(candles[0].o, dec!(17086.5));
        assert_eq!(candles[0].h, dec!(17093));
        assert_eq!(candles[0].v, dec!(4541));
        assert_eq!(candles[2].c, dec!(17055.5));
    }

    #[test]
    fn non_zero_ret_code_is_unavailable() {
        let body: BybitResponse = serde_json::from_str(
            r#"{"retCode": 10001, "retMsg": "params error: symbol invalid", "result": {}}"#,
        )
        .unwrap();

        match parse_response(body).unwrap_err() {
            SourceError::SourceUnavailable {
                provider: ProviderId::Bybit,
                cause: UnavailableCause::Api { message, .. },
            } => assert!(message.contains("10001")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bad_open_time_is_malformed() {
        let body: BybitResponse = serde_json::from_str(
            r#"{"retCode": 0, "retMsg": "OK", "result": {"list": [["yesterday", "1", "1", "1", "1", "1", "1"]]}}"#,
        )
        .unwrap();
        assert!(parse_response(body).unwrap_err().is_malformed());
    }

    #[test]
    fn interval_codes() {
        assert_eq!(bybit_interval(Interval::H1), Some("60"));
        assert_eq!(bybit_interval(Interval::D1), Some("D"));
        assert_eq!(bybit_interval(Interval::H8), None);
    }
}
