use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChartDataError;

/// Upstream market-data providers the aggregator can stitch together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Pacifica,
    Binance,
    Bybit,
}

impl ProviderId {
    pub const fn as_str(self) -> &'static str {
        match self {
            ProviderId::Pacifica => "pacifica",
            ProviderId::Binance => "binance",
            ProviderId::Bybit => "bybit",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ChartDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pacifica" => Ok(ProviderId::Pacifica),
            "binance" => Ok(ProviderId::Binance),
            "bybit" => Ok(ProviderId::Bybit),
            _ => Err(ChartDataError::UnknownProvider(s.to_string())),
        }
    }
}

/// Reliability tier. Earlier variants are more reliable and win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Primary,
    Secondary,
    Tertiary,
}

// 2025-06-09T00:00:00Z
const PACIFICA_EARLIEST_MS: i64 = 1_749_427_200_000;
// 2019-09-08T00:00:00Z
const BINANCE_EARLIEST_MS: i64 = 1_567_900_800_000;
// 2020-03-25T00:00:00Z
const BYBIT_EARLIEST_MS: i64 = 1_585_094_400_000;

/// Static coverage fact about one provider: it has data from
/// `earliest_available` (ms epoch) up to the present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderWindow {
    pub provider: ProviderId,
    pub earliest_available: i64,
    pub reliability: Reliability,
}

impl ProviderWindow {
    pub fn new(provider: ProviderId, earliest: DateTime<Utc>, reliability: Reliability) -> Self {
        Self {
            provider,
            earliest_available: earliest.timestamp_millis(),
            reliability,
        }
    }

    /// The production coverage table.
    ///
    /// | provider | earliest available | reliability |
    /// |----------|--------------------|-------------|
    /// | pacifica | 2025-06-09         | primary     |
    /// | bybit    | 2020-03-25         | tertiary    |
    /// | binance  | 2019-09-08         | secondary   |
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                provider: ProviderId::Pacifica,
                earliest_available: PACIFICA_EARLIEST_MS,
                reliability: Reliability::Primary,
            },
            Self {
                provider: ProviderId::Binance,
                earliest_available: BINANCE_EARLIEST_MS,
                reliability: Reliability::Secondary,
            },
            Self {
                provider: ProviderId::Bybit,
                earliest_available: BYBIT_EARLIEST_MS,
                reliability: Reliability::Tertiary,
            },
        ]
    }

    pub fn earliest_available_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.earliest_available)
    }
}

/// A contiguous sub-range `[start, end)` owned by exactly one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub provider: ProviderId,
    pub start: i64,
    pub end: i64,
}

impl Segment {
    pub fn range(&self) -> Range<i64> {
        self.start..self.end
    }
}

/// Output of [`plan_sources`]: ascending, contiguous, non-overlapping segments
/// plus whatever prefix of the request no provider covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoveragePlan {
    pub segments: Vec<Segment>,
    pub unavailable: Option<Range<i64>>,
}

impl CoveragePlan {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segment boundaries shared by two adjacent segments.
    pub fn seams(&self) -> Vec<i64> {
        self.segments
            .windows(2)
            .map(|pair| pair[0].end)
            .collect()
    }
}

/// Windows sorted by preference: most recent `earliest_available` first,
/// ties broken by reliability.
pub fn by_preference(windows: &[ProviderWindow]) -> Vec<ProviderWindow> {
    let mut sorted = windows.to_vec();
    sorted.sort_by(|a, b| {
        b.earliest_available
            .cmp(&a.earliest_available)
            .then(a.reliability.cmp(&b.reliability))
    });
    sorted
}

/// Position of `provider` in preference order (0 = most preferred).
/// Unknown providers sort last.
pub fn preference_rank(provider: ProviderId, windows: &[ProviderWindow]) -> usize {
    by_preference(windows)
        .iter()
        .position(|w| w.provider == provider)
        .unwrap_or(usize::MAX)
}

/// Partition `[start_ms, end_ms)` among providers.
///
/// Walks providers from most recent to oldest; each claims everything from its
/// `earliest_available` up to where the previous claim began. Whatever remains
/// before the oldest provider is reported as `unavailable`.
pub fn plan_sources(
    start_ms: i64,
    end_ms: i64,
    windows: &[ProviderWindow],
) -> Result<CoveragePlan, ChartDataError> {
    if start_ms >= end_ms {
        return Err(ChartDataError::InvalidRange {
            start: start_ms,
            end: end_ms,
        });
    }

    let mut segments = Vec::new();
    let mut cursor_end = end_ms;

    for window in by_preference(windows) {
        if cursor_end <= start_ms {
            break;
        }
        if window.earliest_available >= cursor_end {
            continue;
        }
        let seg_start = window.earliest_available.max(start_ms);
        segments.push(Segment {
            provider: window.provider,
            start: seg_start,
            end: cursor_end,
        });
        cursor_end = seg_start;
    }

    segments.reverse();
    let unavailable = (cursor_end > start_ms).then_some(start_ms..cursor_end);

    Ok(CoveragePlan {
        segments,
        unavailable,
    })
}

/// Alternative providers for a failed segment, in preference order, each
/// clipped to the part of the segment it actually covers.
pub fn fallbacks_for(segment: &Segment, windows: &[ProviderWindow]) -> Vec<Segment> {
    by_preference(windows)
        .into_iter()
        .filter(|w| w.provider != segment.provider)
        .filter_map(|w| {
            let start = w.earliest_available.max(segment.start);
            (start < segment.end).then_some(Segment {
                provider: w.provider,
                start,
                end: segment.end,
            })
        })
        .collect()
}
