//! Raw response caches scoped to one batch run.
//!
//! Every event of a ticker reads from the same cache, so each distinct call
//! reaches the provider at most once however many events the ticker has and
//! however many targets list it as a peer.

use futures_util::future::join_all;
use metrics_core::{CallParams, ProviderClient, RawResponses};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub fetched: usize,
    pub empty: usize,
    pub failed: usize,
    /// Calls already attempted earlier in this cache's lifetime
    pub reused: usize,
}

pub struct TickerCache {
    ticker: String,
    params: CallParams,
    responses: RawResponses,
    attempted: BTreeSet<String>,
}

impl TickerCache {
    /// `params` must hold the substitution values for this ticker (`ticker`,
    /// `from`, `to`).
    pub fn new(ticker: impl Into<String>, params: CallParams) -> Self {
        Self {
            ticker: ticker.into(),
            params,
            responses: RawResponses::new(),
            attempted: BTreeSet::new(),
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    /// Fetch every call in `calls` not attempted yet. Failures are logged and
    /// cached as "no data" so they are not retried by later events.
    pub async fn prefetch(&mut self, provider: &dyn ProviderClient, calls: &BTreeSet<String>) -> PrefetchReport {
        let mut report = PrefetchReport::default();
        let pending: Vec<&String> = calls
            .iter()
            .filter(|c| {
                let seen = self.attempted.contains(*c);
                if seen {
                    report.reused += 1;
                }
                !seen
            })
            .collect();

        let params = &self.params;
        let results = join_all(pending.iter().map(|call_id| async move {
            (call_id.to_string(), provider.fetch(call_id, params).await)
        }))
        .await;

        for (call_id, result) in results {
            match result {
                Ok(Some(body)) => {
                    report.fetched += 1;
                    self.responses.insert(call_id.clone(), body);
                }
                Ok(None) => report.empty += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("{}: {} failed, treating as no data: {}", self.ticker, call_id, e);
                }
            }
            self.attempted.insert(call_id);
        }
        report
    }

    pub fn responses(&self) -> &RawResponses {
        &self.responses
    }

    pub fn was_attempted(&self, call_id: &str) -> bool {
        self.attempted.contains(call_id)
    }
}

/// One lazily prefetched [`TickerCache`] per ticker for a whole batch run.
///
/// The first task asking for a ticker fetches it; concurrent askers wait for
/// that fetch. Once built a cache is only read, never mutated.
pub struct BatchCache {
    window: CallParams,
    slots: Mutex<BTreeMap<String, Arc<OnceCell<Arc<TickerCache>>>>>,
}

impl BatchCache {
    /// `window` holds the parameters shared by every ticker (`from`, `to`).
    pub fn new(window: CallParams) -> Self {
        Self {
            window,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    fn slot(&self, ticker: &str) -> Arc<OnceCell<Arc<TickerCache>>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(ticker.to_string()).or_default())
    }

    /// Responses of `ticker`, fetching `calls` on first use. Callers must pass
    /// the same call set for a given ticker; later sets are ignored.
    pub async fn get(
        &self,
        ticker: &str,
        calls: &BTreeSet<String>,
        provider: &dyn ProviderClient,
    ) -> Arc<TickerCache> {
        let slot = self.slot(ticker);
        let cache = slot
            .get_or_init(|| async {
                let mut params = self.window.clone();
                params.insert("ticker".to_string(), ticker.to_string());
                let mut cache = TickerCache::new(ticker, params);
                let report = cache.prefetch(provider, calls).await;
                tracing::debug!(
                    "{}: {} fetched, {} empty, {} failed",
                    ticker,
                    report.fetched,
                    report.empty,
                    report.failed
                );
                Arc::new(cache)
            })
            .await;
        Arc::clone(cache)
    }

    /// Tickers requested so far
    pub fn tickers(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.keys().cloned().collect()
    }
}
