use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chart_data_core::candle::Candle;
use chart_data_core::coverage::ProviderId;
use chart_data_core::interval::Interval;
use tracing::{debug, warn};

use crate::error::{SourceError, UnavailableCause};

pub const DEFAULT_PAGE_LIMIT: usize = 1000;
pub const DEFAULT_MAX_PAGES: usize = 50;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for one source client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Bars requested per page.
    pub page_limit: usize,
    /// Ceiling on pages per fetch, bounding worst-case latency.
    pub max_pages: usize,
}

impl SourceConfig {
    pub fn for_provider(provider: ProviderId) -> Self {
        let base_url = match provider {
            ProviderId::Pacifica => "https://api.pacifica.fi",
            ProviderId::Binance => "https://fapi.binance.com",
            ProviderId::Bybit => "https://api.bybit.com",
        };
        Self {
            base_url: base_url.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            page_limit: DEFAULT_PAGE_LIMIT,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Defaults overridden by `{PROVIDER}_BASE_URL`,
    /// `CHART_DATA_REQUEST_TIMEOUT_SECS` and `CHART_DATA_MAX_PAGES`.
    pub fn from_env(provider: ProviderId) -> Result<Self, SourceError> {
        Self::from_lookup(provider, |key| std::env::var(key).ok())
    }

    /// Same as [`SourceConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(
        provider: ProviderId,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SourceError> {
        let mut config = Self::for_provider(provider);
        let url_key = format!("{}_BASE_URL", provider.as_str().to_uppercase());
        if let Some(url) = lookup(&url_key) {
            config.base_url = url;
        }
        if let Some(secs) = parse_var::<u64>(provider, "CHART_DATA_REQUEST_TIMEOUT_SECS", &lookup)? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(pages) = parse_var::<usize>(provider, "CHART_DATA_MAX_PAGES", &lookup)? {
            config.max_pages = pages;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub(crate) fn build_client(&self, provider: ProviderId) -> Result<reqwest::Client, SourceError> {
        reqwest::Client::builder()
            .user_agent(concat!("chart-data/", env!("CARGO_PKG_VERSION")))
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| SourceError::Config {
                provider,
                message: format!("failed to build HTTP client: {e}"),
            })
    }
}

pub(crate) fn parse_var<T>(
    provider: ProviderId,
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>, SourceError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map(Some).map_err(|e| SourceError::Config {
            provider,
            message: format!("{key}='{value}': {e}"),
        }),
        None => Ok(None),
    }
}

/// `BTC` -> `BTCUSDT`; symbols already quoted in USDT pass through.
pub(crate) fn usdt_pair(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.ends_with("USDT") {
        upper
    } else {
        format!("{upper}USDT")
    }
}

/// Network client for one upstream provider.
#[async_trait]
pub trait CandleSource: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Maximum bars one upstream request may return.
    fn page_limit(&self) -> usize {
        DEFAULT_PAGE_LIMIT
    }

    fn max_pages(&self) -> usize {
        DEFAULT_MAX_PAGES
    }

    /// One upstream request for bars opening in `[start_ms, end_ms)`.
    /// The window never spans more than `page_limit()` bars.
    async fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, SourceError>;

    /// Fetch every bar opening in `[start_ms, end_ms)`, paging forward from
    /// `start_ms`. Returns candles sorted by open time; an entirely empty
    /// result is reported as unavailable.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, SourceError> {
        let step = interval.duration_ms();
        let window = step.saturating_mul(self.page_limit().max(1) as i64);
        let mut cursor = start_ms;
        let mut pages = 0;
        let mut candles: Vec<Candle> = Vec::new();

        while cursor < end_ms {
            if pages >= self.max_pages() {
                warn!(
                    "{}: {symbol} {interval}: page ceiling of {} reached at {cursor}, returning partial range",
                    self.id(),
                    self.max_pages()
                );
                break;
            }

            let page_end = cursor.saturating_add(window).min(end_ms);
            let page = self.fetch_page(symbol, interval, cursor, page_end).await?;
            pages += 1;

            let in_window: Vec<Candle> = page
                .into_iter()
                .filter(|c| c.t >= cursor && c.t < page_end)
                .collect();
            debug!(
                "{}: {symbol} {interval}: page {pages} [{cursor}, {page_end}) -> {} candle(s)",
                self.id(),
                in_window.len()
            );

            // An empty window means no bars there, not the end of the data.
            cursor = match in_window.iter().map(|c| c.t).max() {
                Some(last) => last + step,
                None => page_end,
            };
            candles.extend(in_window);
        }

        if candles.is_empty() {
            return Err(SourceError::unavailable(
                self.id(),
                UnavailableCause::EmptyPayload {
                    start: start_ms,
                    end: end_ms,
                },
            ));
        }

        candles.sort_by_key(|c| c.t);
        candles.dedup_by_key(|c| c.t);
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use rust_decimal_macros::dec;

    const HOUR: i64 = 3_600_000;

    fn bar(t: i64) -> Candle {
        Candle {
            t,
            o: dec!(1),
            h: dec!(2),
            l: dec!(0.5),
            c: dec!(1.5),
            v: dec!(10),
        }
    }

    /// Serves hourly bars at the given open times and records each page window.
    struct PagedSource {
        bars: Vec<i64>,
        page_limit: usize,
        max_pages: usize,
        /// Bars beyond this many per page are dropped, like a provider with a
        /// smaller cap than requested.
        serve_at_most: usize,
        windows: Mutex<Vec<(i64, i64)>>,
    }

    impl PagedSource {
        fn new(bars: Vec<i64>, page_limit: usize) -> Self {
            Self {
                bars,
                page_limit,
                max_pages: DEFAULT_MAX_PAGES,
                serve_at_most: usize::MAX,
                windows: Mutex::new(Vec::new()),
            }
        }

        fn windows(&self) -> Vec<(i64, i64)> {
            self.windows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CandleSource for PagedSource {
        fn id(&self) -> ProviderId {
            ProviderId::Binance
        }

        fn page_limit(&self) -> usize {
            self.page_limit
        }

        fn max_pages(&self) -> usize {
            self.max_pages
        }

        async fn fetch_page(
            &self,
            _symbol: &str,
            _interval: Interval,
            start_ms: i64,
            end_ms: i64,
        ) -> Result<Vec<Candle>, SourceError> {
            self.windows.lock().unwrap().push((start_ms, end_ms));
            // Inclusive end, as the real APIs behave.
            Ok(self
                .bars
                .iter()
                .filter(|&&t| t >= start_ms && t <= end_ms)
                .take(self.serve_at_most)
                .map(|&t| bar(t))
                .collect())
        }
    }

    #[tokio::test]
    async fn pages_are_bounded_by_page_limit() {
        let bars: Vec<i64> = (0..10).map(|i| i * HOUR).collect();
        let source = PagedSource::new(bars, 4);

        let candles = source
            .fetch_candles("BTC", Interval::H1, 0, 10 * HOUR)
            .await
            .unwrap();

        assert_eq!(candles.len(), 10);
        assert_eq!(
            source.windows(),
            vec![(0, 4 * HOUR), (4 * HOUR, 8 * HOUR), (8 * HOUR, 10 * HOUR)]
        );
    }

    #[tokio::test]
    async fn end_is_exclusive_even_when_provider_end_is_inclusive() {
        let bars: Vec<i64> = (0..5).map(|i| i * HOUR).collect();
        let source = PagedSource::new(bars, 1000);

        let candles = source
            .fetch_candles("BTC", Interval::H1, HOUR, 3 * HOUR)
            .await
            .unwrap();

        let times: Vec<i64> = candles.iter().map(|c| c.t).collect();
        assert_eq!(times, vec![HOUR, 2 * HOUR]);
    }

    #[tokio::test]
    async fn short_pages_resume_after_last_bar() {
        let bars: Vec<i64> = (0..6).map(|i| i * HOUR).collect();
        let mut source = PagedSource::new(bars, 1000);
        source.serve_at_most = 2;

        let candles = source
            .fetch_candles("BTC", Interval::H1, 0, 6 * HOUR)
            .await
            .unwrap();

        assert_eq!(candles.len(), 6);
        assert_eq!(
            source.windows(),
            vec![(0, 6 * HOUR), (2 * HOUR, 6 * HOUR), (4 * HOUR, 6 * HOUR)]
        );
    }

    #[tokio::test]
    async fn empty_window_advances_instead_of_stopping() {
        // Listing starts at hour 5: the first page window is empty.
        let bars: Vec<i64> = (5..8).map(|i| i * HOUR).collect();
        let source = PagedSource::new(bars, 3);

        let candles = source
            .fetch_candles("BTC", Interval::H1, 0, 8 * HOUR)
            .await
            .unwrap();

        let times: Vec<i64> = candles.iter().map(|c| c.t).collect();
        assert_eq!(times, vec![5 * HOUR, 6 * HOUR, 7 * HOUR]);
        assert_eq!(source.windows()[0], (0, 3 * HOUR));
    }

    #[tokio::test]
    async fn page_ceiling_returns_partial_range() {
        let bars: Vec<i64> = (0..10).map(|i| i * HOUR).collect();
        let mut source = PagedSource::new(bars, 2);
        source.max_pages = 2;

        let candles = source
            .fetch_candles("BTC", Interval::H1, 0, 10 * HOUR)
            .await
            .unwrap();

        assert_eq!(candles.len(), 4);
        assert_eq!(source.windows().len(), 2);
    }

    #[tokio::test]
    async fn no_bars_at_all_is_empty_payload() {
        let source = PagedSource::new(Vec::new(), 1000);
        let err = source
            .fetch_candles("BTC", Interval::H1, 0, 3 * HOUR)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SourceError::SourceUnavailable {
                provider: ProviderId::Binance,
                cause: UnavailableCause::EmptyPayload { start: 0, .. },
            }
        ));
    }

    #[test]
    fn usdt_pairs() {
        assert_eq!(usdt_pair("BTC"), "BTCUSDT");
        assert_eq!(usdt_pair("eth"), "ETHUSDT");
        assert_eq!(usdt_pair("SOLUSDT"), "SOLUSDT");
    }

    #[test]
    fn default_configs() {
        let config = SourceConfig::for_provider(ProviderId::Bybit);
        assert_eq!(config.base_url, "https://api.bybit.com");
        assert_eq!(config.page_limit, DEFAULT_PAGE_LIMIT);

        let config = config.with_base_url("http://127.0.0.1:9");
        assert_eq!(config.base_url, "http://127.0.0.1:9");
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = SourceConfig::from_lookup(ProviderId::Pacifica, vars(&[])).unwrap();
        assert_eq!(config, SourceConfig::for_provider(ProviderId::Pacifica));
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.max_pages, DEFAULT_MAX_PAGES);
    }

    #[test]
    fn variables_override_defaults() {
        let lookup = vars(&[
            ("PACIFICA_BASE_URL", "http://localhost:8080"),
            ("BINANCE_BASE_URL", "http://localhost:9090"),
            ("CHART_DATA_REQUEST_TIMEOUT_SECS", "3"),
            ("CHART_DATA_MAX_PAGES", " 7 "),
        ]);

        let pacifica = SourceConfig::from_lookup(ProviderId::Pacifica, &lookup).unwrap();
        assert_eq!(pacifica.base_url, "http://localhost:8080");
        assert_eq!(pacifica.request_timeout, Duration::from_secs(3));
        assert_eq!(pacifica.max_pages, 7);
        assert_eq!(pacifica.page_limit, DEFAULT_PAGE_LIMIT);

        let bybit = SourceConfig::from_lookup(ProviderId::Bybit, &lookup).unwrap();
        assert_eq!(bybit.base_url, "https://api.bybit.com");
        assert_eq!(bybit.max_pages, 7);
    }

    #[test]
    fn non_numeric_variable_is_config_error() {
        let err = SourceConfig::from_lookup(
            ProviderId::Bybit,
            vars(&[("CHART_DATA_MAX_PAGES", "many")]),
        )
        .unwrap_err();

        match err {
            SourceError::Config { provider, message } => {
                assert_eq!(provider, ProviderId::Bybit);
                assert!(message.contains("CHART_DATA_MAX_PAGES='many'"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(
            SourceConfig::from_lookup(
                ProviderId::Binance,
                vars(&[("CHART_DATA_REQUEST_TIMEOUT_SECS", "-1")]),
            )
            .is_err()
        );
    }
}
