use async_trait::async_trait;
use chart_data_core::candle::Candle;
use chart_data_core::coverage::ProviderId;
use chart_data_core::interval::Interval;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::adapter::{KlineAdapter, parse_decimal, parse_volume, scalar_text};
use crate::error::{SourceError, UnavailableCause};
use crate::http::get_json;
use crate::source::{CandleSource, SourceConfig};

/// One bar from the Pacifica kline endpoint.
///
/// Prices arrive as decimal strings today; plain JSON numbers are accepted too.
#[derive(Debug, Clone, Deserialize)]
pub struct PacificaKline {
    /// Open time (ms)
    pub t: i64,
    /// Close time (ms)
    #[serde(rename = "T", default)]
    pub close_time: Option<i64>,
    #[serde(default)]
    pub s: Option<String>,
    #[serde(default)]
    pub i: Option<String>,
    pub o: Value,
    pub h: Value,
    pub l: Value,
    pub c: Value,
    pub v: Value,
    /// Trade count
    #[serde(default)]
    pub n: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PacificaResponse {
    success: bool,
    data: Option<Vec<Value>>,
    error: Option<String>,
}

pub struct PacificaAdapter;

impl KlineAdapter for PacificaAdapter {
    type Raw = PacificaKline;

    const PROVIDER: ProviderId = ProviderId::Pacifica;

    fn adapt(raw: &PacificaKline) -> Result<Candle, SourceError> {
        let text = |value: &Value, field: &str| {
            scalar_text(value).ok_or_else(|| {
                SourceError::malformed(
                    Self::PROVIDER,
                    format!("{raw:?}"),
                    format!("{field} is not a string or number"),
                )
            })
        };

        Ok(Candle {
            t: raw.t,
            o: parse_decimal(Self::PROVIDER, raw, "open", &text(&raw.o, "open")?)?,
            h: parse_decimal(Self::PROVIDER, raw, "high", &text(&raw.h, "high")?)?,
            l: parse_decimal(Self::PROVIDER, raw, "low", &text(&raw.l, "low")?)?,
            c: parse_decimal(Self::PROVIDER, raw, "close", &text(&raw.c, "close")?)?,
            v: parse_volume(Self::PROVIDER, raw, &text(&raw.v, "volume")?)?,
        })
    }
}

/// Decode each record separately so a bad record is reported as malformed
/// data rather than an undecodable page.
fn decode_records(records: Vec<Value>) -> Result<Vec<PacificaKline>, SourceError> {
    records
        .into_iter()
        .map(|record| {
            serde_json::from_value::<PacificaKline>(record.clone()).map_err(|e| {
                SourceError::malformed(ProviderId::Pacifica, record.to_string(), e.to_string())
            })
        })
        .collect()
}

fn parse_response(body: PacificaResponse) -> Result<Vec<Candle>, SourceError> {
    if !body.success {
        return Err(SourceError::unavailable(
            ProviderId::Pacifica,
            UnavailableCause::Api {
                status: 200,
                message: body.error.unwrap_or_else(|| "success=false".into()),
            },
        ));
    }
    let records = body.data.ok_or_else(|| {
        SourceError::unavailable(
            ProviderId::Pacifica,
            UnavailableCause::Decode("missing data".into()),
        )
    })?;
    PacificaAdapter::adapt_many(&decode_records(records)?)
}

/// Pacifica, the primary venue. Ascending bars, canonical interval names.
pub struct PacificaSource {
    client: Client,
    config: SourceConfig,
}

impl PacificaSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        Ok(Self {
            client: config.build_client(ProviderId::Pacifica)?,
            config,
        })
    }
}

#[async_trait]
impl CandleSource for PacificaSource {
    fn id(&self) -> ProviderId {
        ProviderId::Pacifica
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
        let request = self
            .client
            .get(format!("{}/api/v1/kline", self.config.base_url))
            .query(&[
                ("symbol", symbol.trim().to_uppercase()),
                ("interval", interval.as_str().to_string()),
                ("start_time", start_ms.to_string()),
                ("end_time", (end_ms - 1).to_string()),
            ]);

        let body: PacificaResponse = get_json(ProviderId::Pacifica, request).await?;
        parse_response(body)
    }
}
