//! metric-runner: evaluate metric bundles for stored events and persist them.
//!
//! Usage:
//!   cargo run -p metric-runner -- --tickers AAPL MSFT --from 2024-01-01
//!   cargo run -p metric-runner -- --fair-value --overwrite
//!   cargo run -p metric-runner -- --override AAPL:price=187.5 --tickers AAPL

use anyhow::{bail, Context};
use chrono::NaiveDate;
use metric_engine::MetricEngine;
use metric_orchestrator::{BatchRequest, BatchRunner, ResultStore, RunnerConfig};
use polygon_client::PolygonClient;
use std::collections::BTreeMap;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metric_runner=info,metric_orchestrator=info,polygon_client=warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = RunnerConfig::from_env();
    if let Some(path) = flag_value(&args, "--config") {
        config.metric_config_path = path.to_string();
    }
    if let Some(url) = flag_value(&args, "--db") {
        config.database_url = url.to_string();
    }
    if let Some(n) = flag_value(&args, "--concurrency") {
        config.concurrency = n.parse().with_context(|| format!("invalid --concurrency {}", n))?;
    }

    let request = BatchRequest {
        tickers: flag_list(&args, "--tickers").map(|ts| ts.iter().map(|t| t.to_uppercase()).collect()),
        from: flag_date(&args, "--from")?,
        to: flag_date(&args, "--to")?,
        overwrite: args.iter().any(|a| a == "--overwrite"),
        include_fair_value: args.iter().any(|a| a == "--fair-value"),
        overrides: parse_overrides(&args)?,
    };

    let engine = MetricEngine::from_path(&config.metric_config_path)
        .with_context(|| format!("loading metric configuration {}", config.metric_config_path))?;
    tracing::info!(
        "Loaded {} metrics, {} api calls from {}",
        engine.registry().len(),
        engine.registry().api_calls().count(),
        config.metric_config_path
    );

    let polygon = PolygonClient::new(config.polygon.clone(), engine.registry().api_calls());
    if !polygon.has_api_key() {
        tracing::warn!("POLYGON_API_KEY not set, every provider call will return no data");
    }

    let store = ResultStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    tracing::info!(
        "metric-runner: db={}, concurrency={}, overwrite={}, fair_value={}",
        config.database_url,
        config.concurrency,
        request.overwrite,
        request.include_fair_value
    );

    let mut runner = BatchRunner::new(Arc::new(engine), Arc::new(polygon), store)
        .with_concurrency(config.concurrency)
        .with_history_days(config.history_days);
    if let Some(band) = config.neutral_band {
        runner = runner.with_neutral_band(band)?;
    }

    let summary = runner.run_batch(request).await?;
    tracing::info!(
        "Summary: processed={} quantitative ok/fail={}/{} qualitative ok/fail={}/{} skipped={} tickers_failed={}",
        summary.processed,
        summary.quantitative_success,
        summary.quantitative_fail,
        summary.qualitative_success,
        summary.qualitative_fail,
        summary.skipped,
        summary.tickers_failed
    );
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn flag_list(args: &[String], flag: &str) -> Option<Vec<String>> {
    let idx = args.iter().position(|a| a == flag)?;
    let values: Vec<String> = args[idx + 1..]
        .iter()
        .take_while(|a| !a.starts_with("--"))
        .cloned()
        .collect();
    (!values.is_empty()).then_some(values)
}

fn flag_date(args: &[String], flag: &str) -> anyhow::Result<Option<NaiveDate>> {
    flag_value(args, flag)
        .map(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").with_context(|| format!("invalid {} {}", flag, v)))
        .transpose()
}

/// `--override TICKER:metric=value`, repeatable
fn parse_overrides(args: &[String]) -> anyhow::Result<BTreeMap<String, BTreeMap<String, f64>>> {
    let mut overrides: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for (i, _) in args.iter().enumerate().filter(|(_, a)| *a == "--override") {
        let Some(raw) = args.get(i + 1) else {
            bail!("--override needs TICKER:metric=value");
        };
        let (ticker, assignment) = raw
            .split_once(':')
            .with_context(|| format!("invalid override {}", raw))?;
        let (metric, value) = assignment
            .split_once('=')
            .with_context(|| format!("invalid override {}", raw))?;
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("invalid override value in {}", raw))?;
        overrides
            .entry(ticker.trim().to_uppercase())
            .or_default()
            .insert(metric.trim().to_string(), value);
    }
    Ok(overrides)
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  metric-runner [--tickers AAPL MSFT ...] [--from YYYY-MM-DD] [--to YYYY-MM-DD]");
    eprintln!("");
    eprintln!("Options:");
    eprintln!("  --overwrite               Recompute events that already have a result");
    eprintln!("  --fair-value              Add sector valuation to the quantitative bundle");
    eprintln!("  --override T:metric=v     Use v for metric of ticker T instead of evaluating it");
    eprintln!("  --config PATH             Metric configuration (default: $METRIC_CONFIG_PATH or metrics.json)");
    eprintln!("  --db URL                  SQLite URL (default: $DATABASE_URL)");
    eprintln!("  --concurrency N           Max parallel tickers (default: $BATCH_CONCURRENCY or 8)");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("metric-runner")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_ticker_list_stops_at_next_flag() {
        let a = args("--tickers AAPL msft --overwrite");
        assert_eq!(flag_list(&a, "--tickers"), Some(vec!["AAPL".to_string(), "msft".to_string()]));
        assert_eq!(flag_list(&args("--tickers --overwrite"), "--tickers"), None);
    }

    #[test]
    fn test_dates() {
        let a = args("--from 2024-01-31");
        assert_eq!(flag_date(&a, "--from").unwrap(), NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(flag_date(&a, "--to").unwrap(), None);
        assert!(flag_date(&args("--from 31/01/2024"), "--from").is_err());
    }

    #[test]
    fn test_overrides() {
        let a = args("--override aapl:price=187.5 --override AAPL:shares=10 --override MSFT:price=400");
        let overrides = parse_overrides(&a).unwrap();
        assert_eq!(overrides["AAPL"]["price"], 187.5);
        assert_eq!(overrides["AAPL"]["shares"], 10.0);
        assert_eq!(overrides["MSFT"].len(), 1);

        assert!(parse_overrides(&args("--override AAPL-price")).is_err());
        assert!(parse_overrides(&args("--override AAPL:price=abc")).is_err());
        assert!(parse_overrides(&args("--override")).is_err());
    }
}
