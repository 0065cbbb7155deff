//! Batch entry point
//!
//! One task per ticker, bounded by a semaphore. Raw responses live in one
//! batch-scoped cache per ticker, shared read-only between the ticker's own
//! events and every target that lists it as a peer, so each distinct call is
//! issued once per ticker per run.

use crate::store::{ResultStore, StoredResult};
use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use futures_util::future::join_all;
use metric_engine::{EngineOutput, EvaluationPlan, MetricEngine, QUALITATIVE_PREFIX, QUANTITATIVE_PREFIX};
use metrics_core::{CallParams, DomainResult, EventRecord, EventSource, PriceTargetRecord, ProviderClient};
use polygon_client::{BatchCache, TickerCache};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use valuation_engine::{summarize, ConsensusTargetSummary, SectorValuationEngine, TickerMetrics, ValuationOutcome};

#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    /// All tickers with events when `None`
    pub tickers: Option<Vec<String>>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub overwrite: bool,
    pub include_fair_value: bool,
    /// Externally supplied metric values per ticker
    pub overrides: BTreeMap<String, BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub quantitative_success: usize,
    pub quantitative_fail: usize,
    pub qualitative_success: usize,
    pub qualitative_fail: usize,
    pub skipped: usize,
    pub tickers_failed: usize,
}

impl BatchSummary {
    pub fn merge(&mut self, other: &BatchSummary) {
        self.processed += other.processed;
        self.quantitative_success += other.quantitative_success;
        self.quantitative_fail += other.quantitative_fail;
        self.qualitative_success += other.qualitative_success;
        self.qualitative_fail += other.qualitative_fail;
        self.skipped += other.skipped;
        self.tickers_failed += other.tickers_failed;
    }

    /// A ticker whose task failed before any event was handled
    fn ticker_failed(&mut self, events: usize) {
        self.tickers_failed += 1;
        self.processed += events;
        self.quantitative_fail += events;
        self.qualitative_fail += events;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantitativeBundle {
    pub domains: BTreeMap<String, DomainResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valuation: Option<ValuationOutcome>,
}

impl QuantitativeBundle {
    fn has_values(&self) -> bool {
        self.domains.values().any(|d| d.resolved_count() > 0)
            || self.valuation.as_ref().and_then(|v| v.fair_value).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitativeBundle {
    pub domains: BTreeMap<String, DomainResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusTargetSummary>,
}

impl QualitativeBundle {
    fn has_values(&self) -> bool {
        self.domains.values().any(|d| d.resolved_count() > 0) || self.consensus.is_some()
    }
}

pub struct BatchRunner {
    engine: Arc<MetricEngine>,
    provider: Arc<dyn ProviderClient>,
    store: ResultStore,
    valuation: Option<SectorValuationEngine>,
    concurrency: usize,
    history_days: i64,
}

impl BatchRunner {
    pub fn new(engine: Arc<MetricEngine>, provider: Arc<dyn ProviderClient>, store: ResultStore) -> Self {
        let valuation = engine.valuation().cloned().map(SectorValuationEngine::new);
        Self {
            engine,
            provider,
            store,
            valuation,
            concurrency: crate::config::DEFAULT_CONCURRENCY,
            history_days: crate::config::DEFAULT_HISTORY_DAYS,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_history_days(mut self, days: i64) -> Self {
        self.history_days = days.max(0);
        self
    }

    /// Replace the configured neutral band; it must be finite and non-negative.
    pub fn with_neutral_band(mut self, band: f64) -> Result<Self> {
        if !band.is_finite() || band < 0.0 {
            bail!("neutral band must be a non-negative number, got {}", band);
        }
        self.valuation = self.valuation.map(|v| {
            let mut config = v.config().clone();
            config.neutral_band = band;
            SectorValuationEngine::new(config)
        });
        Ok(self)
    }

    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchSummary> {
        let mut domains: BTreeSet<String> = self.engine.quantitative_domains();
        domains.extend(self.engine.qualitative_domains());

        let valuation = match (&self.valuation, request.include_fair_value) {
            (Some(v), true) => {
                domains.insert(v.config().domain.clone());
                let peer_plan = self.engine.plan([v.config().domain.clone()])?;
                Some((v.clone(), peer_plan))
            }
            (None, true) => {
                tracing::warn!("Fair value requested but no valuation is configured, skipping it");
                None
            }
            _ => None,
        };
        let target_plan = self.engine.plan(domains)?;

        let events = self
            .store
            .list_events(request.tickers.as_deref(), request.from, request.to)
            .await?;
        let mut by_ticker: BTreeMap<String, Vec<EventRecord>> = BTreeMap::new();
        for event in events {
            by_ticker.entry(event.ticker.clone()).or_default().push(event);
        }

        let mut window = CallParams::new();
        let dates = by_ticker.values().flatten().map(|e| e.event_date);
        if let (Some(first), Some(last)) = (dates.clone().min(), dates.max()) {
            let from = first - Duration::days(self.history_days);
            window.insert("from".to_string(), from.format("%Y-%m-%d").to_string());
            window.insert("to".to_string(), last.format("%Y-%m-%d").to_string());
        }

        let mut overrides: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (ticker, values) in &request.overrides {
            overrides
                .entry(normalize_ticker(ticker))
                .or_default()
                .extend(values.iter().map(|(k, v)| (k.clone(), *v)));
        }

        let total = by_ticker.len();
        tracing::info!(
            "Batch: {} tickers, {} calls per ticker, overwrite={}, fair_value={}",
            total,
            target_plan.required_calls.len(),
            request.overwrite,
            valuation.is_some()
        );

        let job = Arc::new(TickerJob {
            engine: Arc::clone(&self.engine),
            provider: Arc::clone(&self.provider),
            store: self.store.clone(),
            caches: BatchCache::new(window),
            targets: by_ticker.keys().cloned().collect(),
            target_plan,
            valuation,
            overrides,
            request,
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(total);
        for (ticker, events) in by_ticker {
            let job = Arc::clone(&job);
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let event_count = events.len();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire().await.context("worker pool closed")?;
                let result = job.process_ticker(&ticker, &events).await;
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;

                match &result {
                    Ok(s) => tracing::info!(
                        "[{}/{}] {} => {} events ({} skipped)",
                        done,
                        total,
                        ticker,
                        s.processed,
                        s.skipped
                    ),
                    Err(e) => tracing::warn!("[{}/{}] {} failed: {:#}", done, total, ticker, e),
                }
                result
            });
            handles.push((event_count, handle));
        }

        let mut summary = BatchSummary::default();
        for (event_count, handle) in handles {
            match handle.await {
                Ok(Ok(s)) => summary.merge(&s),
                Ok(Err(_)) => summary.ticker_failed(event_count),
                Err(e) => {
                    tracing::warn!("Ticker task aborted: {}", e);
                    summary.ticker_failed(event_count);
                }
            }
        }

        tracing::info!("Fetched raw responses for {} tickers", job.caches.tickers().len());
        tracing::info!(
            "Done! {} processed, quantitative {}/{} ok, qualitative {}/{} ok, {} skipped, {} tickers failed",
            summary.processed,
            summary.quantitative_success,
            summary.quantitative_success + summary.quantitative_fail,
            summary.qualitative_success,
            summary.qualitative_success + summary.qualitative_fail,
            summary.skipped,
            summary.tickers_failed
        );
        Ok(summary)
    }
}

/// Shared, read-only state of one batch run
struct TickerJob {
    engine: Arc<MetricEngine>,
    provider: Arc<dyn ProviderClient>,
    store: ResultStore,
    caches: BatchCache,
    /// Tickers with events in this run
    targets: BTreeSet<String>,
    target_plan: EvaluationPlan,
    valuation: Option<(SectorValuationEngine, EvaluationPlan)>,
    /// Keyed by upper-cased ticker
    overrides: BTreeMap<String, BTreeMap<String, f64>>,
    request: BatchRequest,
}

impl TickerJob {
    /// Targets fetch their full plan; peer-only tickers fetch the valuation
    /// plan. The set is fixed per ticker so the first fetch serves every use.
    fn calls_for(&self, ticker: &str) -> &BTreeSet<String> {
        match &self.valuation {
            Some((_, peer_plan)) if !self.targets.contains(ticker) => &peer_plan.required_calls,
            _ => &self.target_plan.required_calls,
        }
    }

    async fn responses(&self, ticker: &str) -> Arc<TickerCache> {
        self.caches
            .get(ticker, self.calls_for(ticker), self.provider.as_ref())
            .await
    }

    fn overrides(&self, ticker: &str) -> BTreeMap<String, f64> {
        self.overrides
            .get(&normalize_ticker(ticker))
            .cloned()
            .unwrap_or_default()
    }

    async fn process_ticker(&self, ticker: &str, events: &[EventRecord]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();

        let mut pending: Vec<&EventRecord> = Vec::with_capacity(events.len());
        for event in events {
            if !self.request.overwrite && self.store.result_exists(event).await? {
                summary.skipped += 1;
            } else {
                pending.push(event);
            }
        }
        if pending.is_empty() {
            return Ok(summary);
        }

        let cache = self.responses(ticker).await;

        let analyst_history = if pending.iter().any(|e| e.source == EventSource::Consensus) {
            self.store
                .analyst_targets(ticker)
                .await
                .with_context(|| format!("loading analyst targets for {}", ticker))?
        } else {
            Vec::new()
        };

        let mut peer_caches: Vec<Arc<TickerCache>> = Vec::new();
        if self.valuation.is_some() {
            let peers = self
                .store
                .peers(ticker)
                .await
                .with_context(|| format!("loading peers for {}", ticker))?;
            peer_caches = join_all(peers.iter().map(|peer| self.responses(peer))).await;
        }

        let overrides = self.overrides(ticker);
        for event in pending {
            summary.processed += 1;
            let output = self.engine.evaluate(
                &self.target_plan,
                ticker,
                event.event_date,
                cache.responses(),
                &overrides,
            );

            let valuation = self
                .valuation
                .as_ref()
                .map(|(engine, peer_plan)| self.value_event(engine, peer_plan, event, &output, &peer_caches));

            let quantitative = QuantitativeBundle {
                domains: output.bundle(QUANTITATIVE_PREFIX),
                valuation,
            };
            let qualitative = QualitativeBundle {
                domains: output.bundle(QUALITATIVE_PREFIX),
                consensus: consensus_for(event, &analyst_history),
            };

            let quant_ok = quantitative.has_values();
            let qual_ok = qualitative.has_values();
            let valuation = quantitative.valuation.as_ref();
            let stored = StoredResult {
                value_quantitative: if quant_ok { serialize(&quantitative, event) } else { None },
                value_qualitative: if qual_ok { serialize(&qualitative, event) } else { None },
                position: valuation.and_then(|v| v.position).map(|p| p.as_str().to_string()),
                disparity: valuation.and_then(|v| v.disparity),
            };

            let saved = match self.store.save_result(event, &stored).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("{} {} {}: saving result failed: {}", ticker, event.event_date, event.source_id, e);
                    false
                }
            };

            if saved && stored.value_quantitative.is_some() {
                summary.quantitative_success += 1;
            } else {
                summary.quantitative_fail += 1;
            }
            if saved && stored.value_qualitative.is_some() {
                summary.qualitative_success += 1;
            } else {
                summary.qualitative_fail += 1;
            }
        }

        Ok(summary)
    }

    fn value_event(
        &self,
        engine: &SectorValuationEngine,
        peer_plan: &EvaluationPlan,
        event: &EventRecord,
        target: &EngineOutput,
        peer_caches: &[Arc<TickerCache>],
    ) -> ValuationOutcome {
        let peers: Vec<TickerMetrics> = peer_caches
            .iter()
            .map(|peer| {
                let out = self.engine.evaluate(
                    peer_plan,
                    peer.ticker(),
                    event.event_date,
                    peer.responses(),
                    &self.overrides(peer.ticker()),
                );
                valuation_inputs(engine, peer.ticker(), &out)
            })
            .collect();
        engine.value(event, &valuation_inputs(engine, &event.ticker, target), &peers)
    }
}

fn valuation_inputs(engine: &SectorValuationEngine, ticker: &str, output: &EngineOutput) -> TickerMetrics {
    let config = engine.config();
    config
        .ratios
        .iter()
        .flat_map(|r| [&r.ratio_metric, &r.fundamental_metric])
        .chain(std::iter::once(&config.price_metric))
        .fold(TickerMetrics::new(ticker), |acc, id| acc.with(id, output.scalar(id)))
}

fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

fn consensus_for(event: &EventRecord, history: &[PriceTargetRecord]) -> Option<ConsensusTargetSummary> {
    match event.source {
        EventSource::Consensus => summarize(history, event.event_date),
        _ => None,
    }
}

fn serialize<T: Serialize>(bundle: &T, event: &EventRecord) -> Option<String> {
    match serde_json::to_string(bundle) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!("{} {}: cannot serialize bundle: {}", event.ticker, event.event_date, e);
            None
        }
    }
}
