use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chart_data_core::candle::Candle;
use chart_data_core::coverage::{
    ProviderId, ProviderWindow, Segment, fallbacks_for, plan_sources, preference_rank,
};
use chart_data_core::interval::Interval;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::binance::BinanceSource;
use crate::bybit::BybitSource;
use crate::error::SourceError;
use crate::pacifica::PacificaSource;
use crate::source::{CandleSource, SourceConfig, parse_var};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Invalid range: start {start} must be before end {end}")]
    InvalidRange { start: i64, end: i64 },

    /// Every segment failed and every failure was malformed upstream data.
    #[error(transparent)]
    Source(SourceError),

    #[error("All sources failed: {}", summarize(.0))]
    AllSourcesFailed(Vec<SourceError>),

    #[error("Deadline of {budget:?} exceeded before any segment was served")]
    DeadlineExceeded { budget: Duration },
}

fn summarize(errors: &[SourceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reduce the failures of a request that produced no data into one error.
pub fn collapse_failures(
    mut failures: Vec<SourceError>,
    timed_out: bool,
    budget: Duration,
) -> AggregateError {
    if timed_out {
        return AggregateError::DeadlineExceeded { budget };
    }
    if !failures.is_empty() && failures.iter().all(SourceError::is_malformed) {
        return AggregateError::Source(failures.swap_remove(0));
    }
    AggregateError::AllSourcesFailed(failures)
}

/// How one planned segment ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentStatus {
    Served { provider: ProviderId, candles: usize },
    Missing { attempts: usize, timed_out: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub segment: Segment,
    pub status: SegmentStatus,
}

/// Spacing between two consecutive candles that is not exactly one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Open time of the candle before the gap.
    pub after: i64,
    /// Open time of the candle after the gap.
    pub before: i64,
    pub missing_bars: i64,
    /// The missing bars span a provider hand-off or cover a whole segment
    /// no provider could serve. A hole inside one segment is internal even
    /// when it ends right at a seam.
    pub at_seam: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregatedCandles {
    pub candles: Vec<Candle>,
    pub segments: Vec<SegmentOutcome>,
    pub gaps: Vec<Gap>,
    /// Leading part of the request no provider covers.
    pub unavailable: Option<Range<i64>>,
}

struct SegmentFetch {
    outcome: SegmentOutcome,
    candles: Vec<Candle>,
    errors: Vec<SourceError>,
}

fn utc(ts: i64) -> String {
    DateTime::from_timestamp_millis(ts).map_or_else(|| ts.to_string(), |d| d.to_rfc3339())
}

fn system_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stitches candles from several [`CandleSource`]s into one ordered series.
///
/// Built once at startup and shared (`Arc<Aggregator>`) with request handlers.
pub struct Aggregator {
    sources: HashMap<ProviderId, Arc<dyn CandleSource>>,
    windows: Vec<ProviderWindow>,
    deadline: Duration,
    clock: fn() -> i64,
}

pub struct AggregatorBuilder {
    sources: Vec<Arc<dyn CandleSource>>,
    windows: Vec<ProviderWindow>,
    deadline: Duration,
    clock: fn() -> i64,
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            windows: ProviderWindow::defaults(),
            deadline: DEFAULT_DEADLINE,
            clock: system_now_ms,
        }
    }
}

impl AggregatorBuilder {
    pub fn with_source(mut self, source: impl CandleSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    pub fn with_shared_source(mut self, source: Arc<dyn CandleSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Replace the coverage table (defaults to [`ProviderWindow::defaults`]).
    pub fn windows(mut self, windows: Vec<ProviderWindow>) -> Self {
        self.windows = windows;
        self
    }

    /// Total time budget per request, fallbacks included.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Milliseconds-since-epoch clock used to find the live edge.
    pub fn clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Aggregator {
        let sources: HashMap<ProviderId, Arc<dyn CandleSource>> =
            self.sources.into_iter().map(|s| (s.id(), s)).collect();

        let windows: Vec<ProviderWindow> = self
            .windows
            .into_iter()
            .filter(|w| {
                let wired = sources.contains_key(&w.provider);
                if !wired {
                    warn!("no source configured for {}, dropping its coverage window", w.provider);
                }
                wired
            })
            .collect();

        Aggregator {
            sources,
            windows,
            deadline: self.deadline,
            clock: self.clock,
        }
    }
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::default()
    }

    /// Production wiring: Pacifica, Binance and Bybit with the default coverage
    /// table, each source configured from the environment. The request budget
    /// can be overridden with `CHART_DATA_DEADLINE_SECS`.
    pub fn from_env() -> Result<Self, SourceError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Aggregator::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SourceError> {
        let config = |provider| SourceConfig::from_lookup(provider, &lookup);
        let mut builder = Self::builder()
            .with_source(PacificaSource::new(config(ProviderId::Pacifica)?)?)
            .with_source(BinanceSource::new(config(ProviderId::Binance)?)?)
            .with_source(BybitSource::new(config(ProviderId::Bybit)?)?);

        let deadline = parse_var::<u64>(ProviderId::Pacifica, "CHART_DATA_DEADLINE_SECS", &lookup)?;
        if let Some(secs) = deadline {
            builder = builder.deadline(Duration::from_secs(secs));
        }
        Ok(builder.build())
    }

    /// Total time budget per request.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn windows(&self) -> &[ProviderWindow] {
        &self.windows
    }

    /// Earliest moment any configured provider has data for, or `None` when
    /// no provider is configured.
    pub fn get_earliest_available_date(&self) -> Option<DateTime<Utc>> {
        self.windows
            .iter()
            .map(|w| w.earliest_available)
            .min()
            .and_then(DateTime::from_timestamp_millis)
    }

    /// Candles for `[start_ms, end_ms)`, ascending and free of duplicates.
    ///
    /// Returns an empty vec when nothing in the range is covered (e.g. a range
    /// in the future). Fails only on an invalid range or when every planned
    /// segment failed.
    pub async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, AggregateError> {
        Ok(self
            .get_candles_with_report(symbol, interval, start_ms, end_ms)
            .await?
            .candles)
    }

    /// Like [`Aggregator::get_candles`], also returning which provider served
    /// each segment and the gaps found in the merged series.
    pub async fn get_candles_with_report(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<AggregatedCandles, AggregateError> {
        if start_ms >= end_ms {
            return Err(AggregateError::InvalidRange {
                start: start_ms,
                end: end_ms,
            });
        }

        // Bars opening after the current one do not exist yet.
        let live_edge = interval.align_down((self.clock)()) + interval.duration_ms();
        if start_ms >= live_edge {
            debug!(
                "{symbol} {interval}: {} is past the live edge, nothing to fetch",
                utc(start_ms)
            );
            return Ok(AggregatedCandles::default());
        }
        let end_ms = end_ms.min(live_edge);

        let plan = plan_sources(start_ms, end_ms, &self.windows).map_err(|_| {
            AggregateError::InvalidRange {
                start: start_ms,
                end: end_ms,
            }
        })?;
        if let Some(range) = &plan.unavailable {
            info!(
                "{symbol} {interval}: no provider covers {} to {}",
                utc(range.start),
                utc(range.end)
            );
        }
        if plan.is_empty() {
            return Ok(AggregatedCandles {
                unavailable: plan.unavailable,
                ..AggregatedCandles::default()
            });
        }
        debug!(
            "{symbol} {interval}: {} segment(s): {:?}",
            plan.segments.len(),
            plan.segments
        );

        let deadline = Instant::now() + self.deadline;
        let fetches = join_all(
            plan.segments
                .iter()
                .map(|segment| self.fetch_segment(symbol, interval, *segment, deadline)),
        )
        .await;

        let mut outcomes = Vec::with_capacity(fetches.len());
        let mut failures = Vec::new();
        let mut tagged: Vec<(usize, Candle)> = Vec::new();
        let mut timed_out = false;

        for fetch in fetches {
            match fetch.outcome.status {
                SegmentStatus::Served { provider, .. } => {
                    let rank = preference_rank(provider, &self.windows);
                    tagged.extend(fetch.candles.into_iter().map(|c| (rank, c)));
                }
                SegmentStatus::Missing {
                    timed_out: segment_timed_out,
                    ..
                } => {
                    timed_out |= segment_timed_out;
                }
            }
            failures.extend(fetch.errors);
            outcomes.push(fetch.outcome);
        }

        let served_any = outcomes
            .iter()
            .any(|o| matches!(o.status, SegmentStatus::Served { .. }));
        if !served_any {
            warn!(
                "{symbol} {interval}: every segment of {} to {} failed",
                utc(start_ms),
                utc(end_ms)
            );
            return Err(collapse_failures(failures, timed_out, self.deadline));
        }

        let candles = merge(tagged, start_ms..end_ms);
        let segments: Vec<Segment> = outcomes.iter().map(|o| o.segment).collect();
        let gaps = detect_gaps(&candles, interval, &segments);
        for gap in &gaps {
            if gap.at_seam {
                info!(
                    "{symbol} {interval}: {} bar(s) missing at a provider seam between {} and {}",
                    gap.missing_bars,
                    utc(gap.after),
                    utc(gap.before)
                );
            } else {
                warn!(
                    "{symbol} {interval}: {} bar(s) missing between {} and {}",
                    gap.missing_bars,
                    utc(gap.after),
                    utc(gap.before)
                );
            }
        }

        info!(
            "{symbol} {interval}: {} of {} candle(s) from {} segment(s), {} gap(s)",
            candles.len(),
            interval.expected_bars(start_ms, end_ms),
            outcomes.len(),
            gaps.len()
        );

        Ok(AggregatedCandles {
            candles,
            segments: outcomes,
            gaps,
            unavailable: plan.unavailable,
        })
    }

    /// Fetch one segment from its owner, then from each fallback in turn,
    /// all within the request deadline.
    async fn fetch_segment(
        &self,
        symbol: &str,
        interval: Interval,
        segment: Segment,
        deadline: Instant,
    ) -> SegmentFetch {
        let mut attempts = vec![segment];
        attempts.extend(fallbacks_for(&segment, &self.windows));

        let mut errors = Vec::new();
        let chain = async {
            for attempt in &attempts {
                let Some(source) = self.sources.get(&attempt.provider) else {
                    continue;
                };
                match source
                    .fetch_candles(symbol, interval, attempt.start, attempt.end)
                    .await
                {
                    Ok(candles) => {
                        if attempt.provider != segment.provider {
                            info!(
                                "{symbol} {interval}: {} served {} to {} in place of {}",
                                attempt.provider,
                                utc(attempt.start),
                                utc(attempt.end),
                                segment.provider
                            );
                        }
                        return Some((attempt.provider, candles));
                    }
                    Err(e) => {
                        warn!(
                            "{symbol} {interval}: {} failed for {} to {}: {e}",
                            attempt.provider,
                            utc(attempt.start),
                            utc(attempt.end)
                        );
                        errors.push(e);
                    }
                }
            }
            None
        };
        let result = tokio::time::timeout_at(deadline, chain).await;

        match result {
            Ok(Some((provider, candles))) => SegmentFetch {
                outcome: SegmentOutcome {
                    segment,
                    status: SegmentStatus::Served {
                        provider,
                        candles: candles.len(),
                    },
                },
                candles,
                errors,
            },
            Ok(None) => SegmentFetch {
                outcome: SegmentOutcome {
                    segment,
                    status: SegmentStatus::Missing {
                        attempts: errors.len(),
                        timed_out: false,
                    },
                },
                candles: Vec::new(),
                errors,
            },
            Err(_) => {
                warn!(
                    "{symbol} {interval}: deadline hit while fetching {} to {}",
                    utc(segment.start),
                    utc(segment.end)
                );
                SegmentFetch {
                    outcome: SegmentOutcome {
                        segment,
                        status: SegmentStatus::Missing {
                            attempts: errors.len() + 1,
                            timed_out: true,
                        },
                    },
                    candles: Vec::new(),
                    errors,
                }
            }
        }
    }
}

/// Sort by open time and drop duplicate timestamps, keeping the candle from
/// the preferred provider (lowest rank). Bars opening outside `range` are
/// discarded.
fn merge(mut tagged: Vec<(usize, Candle)>, range: Range<i64>) -> Vec<Candle> {
    tagged.retain(|(_, c)| range.contains(&c.t));
    tagged.sort_by(|a, b| a.1.t.cmp(&b.1.t).then(a.0.cmp(&b.0)));
    let before = tagged.len();
    tagged.dedup_by_key(|(_, c)| c.t);
    if tagged.len() != before {
        debug!("dropped {} duplicate candle(s) at seams", before - tagged.len());
    }
    tagged.into_iter().map(|(_, c)| c).collect()
}

/// Report every adjacent pair not spaced exactly one interval apart.
fn detect_gaps(candles: &[Candle], interval: Interval, segments: &[Segment]) -> Vec<Gap> {
    let step = interval.duration_ms();
    candles
        .windows(2)
        .filter_map(|pair| {
            let (after, before) = (pair[0].t, pair[1].t);
            debug_assert!(before > after, "merged candles must be strictly ascending");
            if before - after == step {
                return None;
            }
            // Open times of the first and last missing bar.
            let (first, last) = (after + step, before - step);
            let at_seam = segments.iter().any(|seg| {
                let splits_hole = seg.start > first && seg.start <= last;
                let swallowed = seg.start > after && seg.end <= before;
                splits_hole || swallowed
            });
            Some(Gap {
                after,
                before,
                missing_bars: (before - after) / step - 1,
                at_seam,
            })
        })
        .collect()
}
