//! Sector-relative valuation
//!
//! Peer ratios are averaged per ratio metric, multiplied by the ticker's own
//! fundamental to get a fair value, and the current price is classified
//! against it.

use chrono::NaiveDate;
use metrics_core::stats::{finite, mean};
use metrics_core::{EventRecord, ValuationConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mean of one ratio across the peers that produced a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorAverage {
    pub ratio_metric: String,
    pub value: Option<f64>,
    /// Peers that contributed a non-null value
    pub peer_count: usize,
}

impl SectorAverage {
    pub fn from_peers(ratio_metric: &str, peer_values: &[Option<f64>]) -> Self {
        let values: Vec<f64> = peer_values.iter().filter_map(|v| v.and_then(finite)).collect();
        Self {
            ratio_metric: ratio_metric.to_string(),
            value: mean(&values),
            peer_count: values.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    /// Price below fair value
    Long,
    /// Price above fair value
    Short,
    Neutral,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Long => "long",
            Position::Short => "short",
            Position::Neutral => "neutral",
        }
    }

    /// Classify `price` against `fair_value`. Prices within `neutral_band`
    /// (relative to price) of fair value are neutral.
    pub fn classify(fair_value: Option<f64>, price: Option<f64>, neutral_band: f64) -> Option<Self> {
        let gap = disparity(fair_value, price)?;
        if gap.abs() <= neutral_band {
            Some(Position::Neutral)
        } else if gap > 0.0 {
            Some(Position::Long)
        } else {
            Some(Position::Short)
        }
    }
}

/// `(fair_value - price) / price`; null without a positive price
pub fn disparity(fair_value: Option<f64>, price: Option<f64>) -> Option<f64> {
    let fv = fair_value?;
    let price = price.filter(|p| *p > 0.0)?;
    finite((fv - price) / price)
}

/// Non-null valuation-domain values of one ticker at one event date
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickerMetrics {
    pub ticker: String,
    pub values: BTreeMap<String, f64>,
}

impl TickerMetrics {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, metric_id: &str, value: Option<f64>) -> Self {
        if let Some(v) = value.and_then(finite) {
            self.values.insert(metric_id.to_string(), v);
        }
        self
    }

    pub fn get(&self, metric_id: &str) -> Option<f64> {
        self.values.get(metric_id).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioFairValue {
    pub sector_average: SectorAverage,
    pub fundamental_metric: String,
    pub fundamental: Option<f64>,
    pub fair_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationOutcome {
    pub ticker: String,
    pub event_date: NaiveDate,
    pub ratios: Vec<RatioFairValue>,
    pub fair_value: Option<f64>,
    pub price: Option<f64>,
    pub position: Option<Position>,
    pub disparity: Option<f64>,
}

/// Pure and synchronous; never looks at what kind of event triggered it.
#[derive(Debug, Clone)]
pub struct SectorValuationEngine {
    config: ValuationConfig,
}

impl SectorValuationEngine {
    pub fn new(config: ValuationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValuationConfig {
        &self.config
    }

    pub fn sector_averages(&self, peers: &[TickerMetrics]) -> Vec<SectorAverage> {
        self.config
            .ratios
            .iter()
            .map(|r| {
                let values: Vec<Option<f64>> = peers.iter().map(|p| p.get(&r.ratio_metric)).collect();
                SectorAverage::from_peers(&r.ratio_metric, &values)
            })
            .collect()
    }

    /// `target` must not appear among `peers`; a peer entry with the target's
    /// ticker is ignored.
    pub fn value(&self, event: &EventRecord, target: &TickerMetrics, peers: &[TickerMetrics]) -> ValuationOutcome {
        let peers: Vec<TickerMetrics> = peers
            .iter()
            .filter(|p| !p.ticker.eq_ignore_ascii_case(&target.ticker))
            .cloned()
            .collect();

        let ratios: Vec<RatioFairValue> = self
            .config
            .ratios
            .iter()
            .zip(self.sector_averages(&peers))
            .map(|(pairing, sector_average)| {
                let fundamental = target.get(&pairing.fundamental_metric);
                let fair_value = match (sector_average.value, fundamental) {
                    (Some(avg), Some(f)) if f > 0.0 => finite(avg * f),
                    _ => None,
                };
                if sector_average.value.is_none() {
                    tracing::debug!(
                        "{} {}: no peer produced {}",
                        target.ticker,
                        event.event_date,
                        pairing.ratio_metric
                    );
                }
                RatioFairValue {
                    sector_average,
                    fundamental_metric: pairing.fundamental_metric.clone(),
                    fundamental,
                    fair_value,
                }
            })
            .collect();

        let fair_values: Vec<f64> = ratios.iter().filter_map(|r| r.fair_value).collect();
        let fair_value = mean(&fair_values);
        let price = target.get(&self.config.price_metric);

        ValuationOutcome {
            ticker: target.ticker.clone(),
            event_date: event.event_date,
            fair_value,
            price,
            position: Position::classify(fair_value, price, self.config.neutral_band),
            disparity: disparity(fair_value, price),
            ratios,
        }
    }
}
