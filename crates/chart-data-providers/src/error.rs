use chart_data_core::coverage::ProviderId;
use chart_data_core::interval::Interval;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{provider}: malformed record {record}: {reason}")]
    MalformedUpstreamData {
        provider: ProviderId,
        record: String,
        reason: String,
    },

    #[error("{provider} unavailable: {cause}")]
    SourceUnavailable {
        provider: ProviderId,
        cause: UnavailableCause,
    },

    #[error("{provider} configuration error: {message}")]
    Config {
        provider: ProviderId,
        message: String,
    },
}

/// Why a source could not deliver candles.
#[derive(Debug, Error)]
pub enum UnavailableCause {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("undecodable payload: {0}")]
    Decode(String),

    #[error("empty payload for {start}..{end}")]
    EmptyPayload { start: i64, end: i64 },

    #[error("interval {0} is not offered")]
    UnsupportedInterval(Interval),
}

impl SourceError {
    pub fn malformed(
        provider: ProviderId,
        record: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedUpstreamData {
            provider,
            record: record.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(provider: ProviderId, cause: impl Into<UnavailableCause>) -> Self {
        Self::SourceUnavailable {
            provider,
            cause: cause.into(),
        }
    }

    pub fn provider(&self) -> ProviderId {
        match self {
            Self::MalformedUpstreamData { provider, .. }
            | Self::SourceUnavailable { provider, .. }
            | Self::Config { provider, .. } => *provider,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedUpstreamData { .. })
    }
}
