use std::path::PathBuf;

use anyhow::{Context, Result};
use chart_data_core::coverage::{ProviderWindow, plan_sources};
use chart_data_core::interval::Interval;
use chart_data_core::schema::write_parquet;
use chart_data_core::wire::CandleResponse;
use chart_data_providers::aggregator::{AggregatedCandles, Aggregator, SegmentStatus};
use chrono::{DateTime, NaiveDate};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "chart-data",
    about = "Fetch OHLCV candles stitched from Pacifica, Binance and Bybit"
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch candles and print them as a chart response
    Candles {
        /// Base asset symbol
        #[arg(short, long, default_value = "BTC")]
        symbol: String,

        /// Bar interval: 1m, 3m, 5m, 15m, 30m, 1h, 2h, 4h, 8h, 12h, 1d
        #[arg(short, long, default_value = "1h")]
        interval: Interval,

        /// Start time, inclusive (epoch ms, RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        start: i64,

        /// End time, exclusive (epoch ms, RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        end: i64,

        /// Also write the candles to this Parquet file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print which provider served each segment and any gaps (stderr)
        #[arg(long)]
        report: bool,
    },

    /// Show how a range would be split among providers
    Plan {
        #[arg(long, value_parser = parse_time)]
        start: i64,

        #[arg(long, value_parser = parse_time)]
        end: i64,
    },

    /// Show the earliest date any provider has data for
    Earliest,
}

/// Accepts epoch milliseconds, RFC 3339, or a UTC calendar date.
fn parse_time(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis());
    }
    Err(format!(
        "invalid time '{s}': expected epoch ms, RFC 3339 or YYYY-MM-DD"
    ))
}

fn fmt_ms(ts: i64) -> String {
    DateTime::from_timestamp_millis(ts).map_or_else(|| ts.to_string(), |d| d.to_rfc3339())
}

/// Request checks the HTTP route performs before reaching the aggregator.
fn validate_request(symbol: &str, start: i64, end: i64) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!("invalid symbol: '{symbol}'");
    }
    if start < 0 {
        anyhow::bail!("start must not be negative, got {start}");
    }
    if start >= end {
        anyhow::bail!(
            "start ({}) must be before end ({})",
            fmt_ms(start),
            fmt_ms(end)
        );
    }
    Ok(symbol)
}

fn print_report(report: &AggregatedCandles) {
    if let Some(range) = &report.unavailable {
        eprintln!(
            "unavailable: {} to {} (before every provider)",
            fmt_ms(range.start),
            fmt_ms(range.end)
        );
    }
    for outcome in &report.segments {
        let seg = &outcome.segment;
        let status = match &outcome.status {
            SegmentStatus::Served { provider, candles } if *provider == seg.provider => {
                format!("{candles} candle(s)")
            }
            SegmentStatus::Served { provider, candles } => {
                format!("{candles} candle(s) via fallback {provider}")
            }
            SegmentStatus::Missing { attempts, timed_out } => {
                let why = if *timed_out { ", deadline hit" } else { "" };
                format!("MISSING after {attempts} attempt(s){why}")
            }
        };
        eprintln!(
            "{:<8} {} to {}: {status}",
            seg.provider,
            fmt_ms(seg.start),
            fmt_ms(seg.end)
        );
    }
    if report.gaps.is_empty() {
        eprintln!("No gaps.");
    }
    for gap in &report.gaps {
        let kind = if gap.at_seam { "seam" } else { "internal" };
        eprintln!(
            "gap ({kind}): {} bar(s) between {} and {}",
            gap.missing_bars,
            fmt_ms(gap.after),
            fmt_ms(gap.before)
        );
    }
}

async fn cmd_candles(
    symbol: &str,
    interval: Interval,
    start: i64,
    end: i64,
    output: Option<&PathBuf>,
    report: bool,
) -> Result<()> {
    let symbol = validate_request(symbol, start, end)?;
    let aggregator = Aggregator::from_env().context("failed to configure candle sources")?;

    let result = aggregator
        .get_candles_with_report(&symbol, interval, start, end)
        .await
        .with_context(|| {
            format!(
                "failed to fetch {symbol} {interval} from {} to {}",
                fmt_ms(start),
                fmt_ms(end)
            )
        })?;

    if let Some(path) = output {
        write_parquet(path, &result.candles)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("{symbol}: wrote {} candle(s) to {}", result.candles.len(), path.display());
    }
    if report {
        print_report(&result);
    }

    let response = CandleResponse::new(symbol, interval, start, end, result.candles);
    println!(
        "{}",
        serde_json::to_string(&response).context("failed to serialize response")?
    );
    Ok(())
}

fn cmd_plan(start: i64, end: i64) -> Result<()> {
    let plan = plan_sources(start, end, &ProviderWindow::defaults())
        .context("failed to plan coverage")?;

    if let Some(range) = &plan.unavailable {
        println!("unavailable  {} to {}", fmt_ms(range.start), fmt_ms(range.end));
    }
    if plan.is_empty() {
        println!("No provider covers this range.");
        return Ok(());
    }
    for seg in &plan.segments {
        println!(
            "{:<12} {} to {}",
            seg.provider.as_str(),
            fmt_ms(seg.start),
            fmt_ms(seg.end)
        );
    }
    Ok(())
}

fn cmd_earliest() -> Result<()> {
    let aggregator = Aggregator::from_env().context("failed to configure candle sources")?;
    match aggregator.get_earliest_available_date() {
        Some(date) => println!("{}", date.to_rfc3339()),
        None => println!("No providers configured."),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match &cli.command {
        Commands::Candles {
            symbol,
            interval,
            start,
            end,
            output,
            report,
        } => {
            cmd_candles(symbol, *interval, *start, *end, output.as_ref(), *report).await?;
        }
        Commands::Plan { start, end } => {
            cmd_plan(*start, *end)?;
        }
        Commands::Earliest => {
            cmd_earliest()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parse_candles_args() {
        let cli = Cli::try_parse_from([
            "chart-data",
            "candles",
            "-s",
            "eth",
            "-i",
            "4h",
            "--start",
            "2025-01-01",
            "--end",
            "1735862400000",
            "-o",
            "eth.parquet",
            "--report",
        ])
        .unwrap();

        match cli.command {
            Commands::Candles {
                symbol,
                interval,
                start,
                end,
                output,
                report,
            } => {
                assert_eq!(symbol, "eth");
                assert_eq!(interval, Interval::H4);
                assert_eq!(start, 1_735_689_600_000);
                assert_eq!(end, 1_735_862_400_000);
                assert_eq!(output, Some(PathBuf::from("eth.parquet")));
                assert!(report);
            }
            _ => panic!("expected Candles command"),
        }
    }

    #[test]
    fn parse_candles_defaults() {
        let cli = Cli::try_parse_from([
            "chart-data",
            "candles",
            "--start",
            "2025-06-09T00:00:00Z",
            "--end",
            "2025-06-10T00:00:00+02:00",
        ])
        .unwrap();

        match cli.command {
            Commands::Candles {
                symbol,
                interval,
                start,
                end,
                output,
                report,
            } => {
                assert_eq!(symbol, "BTC");
                assert_eq!(interval, Interval::H1);
                assert_eq!(start, 1_749_427_200_000);
                assert_eq!(end, 1_749_506_400_000);
                assert!(output.is_none());
                assert!(!report);
            }
            _ => panic!("expected Candles command"),
        }
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let result = Cli::try_parse_from([
            "chart-data",
            "candles",
            "-i",
            "7m",
            "--start",
            "0",
            "--end",
            "1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn bad_time_is_rejected() {
        let result = Cli::try_parse_from(["chart-data", "plan", "--start", "yesterday", "--end", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_plan_and_earliest() {
        let cli = Cli::try_parse_from([
            "chart-data",
            "plan",
            "--start",
            "2019-01-01",
            "--end",
            "2025-07-01",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan { start, end } => assert!(start < end),
            _ => panic!("expected Plan command"),
        }

        let cli = Cli::try_parse_from(["chart-data", "--log-level", "debug", "earliest"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Earliest));
    }

    #[test]
    fn time_formats() {
        assert_eq!(parse_time("0"), Ok(0));
        assert_eq!(parse_time(" 1700000000000 "), Ok(1_700_000_000_000));
        assert_eq!(parse_time("1970-01-02"), Ok(86_400_000));
        assert_eq!(parse_time("1970-01-01T00:00:01.500Z"), Ok(1_500));
        assert!(parse_time("2025-13-01").is_err());
        assert!(parse_time("").is_err());
    }

    #[test]
    fn request_validation() {
        assert_eq!(validate_request(" btc ", 0, 1).unwrap(), "BTC");
        assert!(validate_request("BTC", 5, 5).is_err());
        assert!(validate_request("BTC", 6, 5).is_err());
        assert!(validate_request("BTC", -1, 5).is_err());
        assert!(validate_request("", 0, 5).is_err());
        assert!(validate_request("BTC/USDT", 0, 5).is_err());
    }

    #[test]
    fn plan_runs_for_default_windows() {
        assert!(cmd_plan(0, 1_000).is_ok());
        assert!(cmd_plan(1_000, 0).is_err());
    }
}
