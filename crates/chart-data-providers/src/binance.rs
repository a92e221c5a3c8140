use async_trait::async_trait;
use chart_data_core::candle::Candle;
use chart_data_core::coverage::ProviderId;
use chart_data_core::interval::Interval;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::adapter::{KlineAdapter, adapt_array_row};
use crate::error::SourceError;
use crate::http::get_json;
use crate::source::{CandleSource, SourceConfig, usdt_pair};

/// One Binance kline row:
/// `[openTime, "open", "high", "low", "close", "volume", closeTime, "quoteVolume",
///   trades, "takerBuyBase", "takerBuyQuote", "ignore"]`
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct BinanceKline(pub Vec<Value>);

pub struct BinanceAdapter;

impl KlineAdapter for BinanceAdapter {
    type Raw = BinanceKline;

    const PROVIDER: ProviderId = ProviderId::Binance;

    fn adapt(raw: &BinanceKline) -> Result<Candle, SourceError> {
        adapt_array_row(Self::PROVIDER, &raw.0, raw)
    }
}

/// Binance USDT-margined perpetuals, the older historical source.
pub struct BinanceSource {
    client: Client,
    config: SourceConfig,
}

impl BinanceSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        Ok(Self {
            client: config.build_client(ProviderId::Binance)?,
            config,
        })
    }
}

#[async_trait]
impl CandleSource for BinanceSource {
    fn id(&self) -> ProviderId {
        ProviderId::Binance
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
        // Binance uses the canonical interval names.
        let request = self
            .client
            .get(format!("{}/fapi/v1/klines", self.config.base_url))
            .query(&[
                ("symbol", usdt_pair(symbol)),
                ("interval", interval.as_str().to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", (end_ms - 1).to_string()),
                ("limit", self.config.page_limit.to_string()),
            ]);

        let rows: Vec<BinanceKline> = get_json(ProviderId::Binance, request).await?;
        BinanceAdapter::adapt_many(&rows)
    }
}
