//! Trailing-window statistics over analyst price targets.

use chrono::{Duration, NaiveDate};
use metrics_core::stats::{mean, round_dp};
use metrics_core::PriceTargetRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStat {
    pub count: usize,
    /// Mean price target, 2 decimal places; absent for an empty window
    pub average: Option<f64>,
}

impl WindowStat {
    fn from_targets(targets: &[f64]) -> Self {
        Self {
            count: targets.len(),
            average: mean(targets).map(|v| round_dp(v, 2)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusTargetSummary {
    pub reference_date: NaiveDate,
    pub last_30d: WindowStat,
    pub last_90d: WindowStat,
    pub last_365d: WindowStat,
    pub all_time: WindowStat,
    pub publishers: BTreeSet<String>,
}

/// Summarize `records` as seen on `reference_date`. Records dated after it
/// are ignored; `None` when nothing qualifies.
pub fn summarize(records: &[PriceTargetRecord], reference_date: NaiveDate) -> Option<ConsensusTargetSummary> {
    let visible: Vec<&PriceTargetRecord> = records
        .iter()
        .filter(|r| r.date <= reference_date && r.price_target.is_finite())
        .collect();
    if visible.is_empty() {
        return None;
    }

    let window = |days: i64| {
        let start = reference_date - Duration::days(days);
        let targets: Vec<f64> = visible
            .iter()
            .filter(|r| r.date >= start)
            .map(|r| r.price_target)
            .collect();
        WindowStat::from_targets(&targets)
    };
    let all: Vec<f64> = visible.iter().map(|r| r.price_target).collect();

    Some(ConsensusTargetSummary {
        reference_date,
        last_30d: window(30),
        last_90d: window(90),
        last_365d: window(365),
        all_time: WindowStat::from_targets(&all),
        publishers: visible
            .iter()
            .filter_map(|r| r.publisher.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect(),
    })
}
