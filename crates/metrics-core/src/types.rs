use crate::definitions::SourceKind;
use crate::values::MetricValue;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per raw provider call: which dates fed the metric and what was applied to them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceSummary {
    pub api_call_id: String,
    /// Most recent consumed dates, capped to a short preview
    pub date_preview: Vec<NaiveDate>,
    /// Number of distinct dates consumed in total
    pub date_count: usize,
    pub transforms: Vec<String>,
    /// Snapshot call: only its latest value at the event date was used
    pub single_date: bool,
}

/// Compact, auditable derivation of one computed metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceSummary {
    pub source_kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default)]
    pub externally_supplied: bool,
    pub sources: Vec<RawSourceSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcType {
    Snapshot,
    Series,
    Mixed,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateInfo {
    pub calc_type: CalcType,
    pub date_range: Option<DateRange>,
    pub count: usize,
    pub per_metric: BTreeMap<String, ProvenanceSummary>,
}

/// Values and provenance of every metric in one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResult {
    pub values: BTreeMap<String, Option<MetricValue>>,
    pub date_info: DateInfo,
}

impl DomainResult {
    /// Scalar view of a metric in this domain
    pub fn scalar(&self, metric_id: &str) -> Option<f64> {
        self.values
            .get(metric_id)
            .and_then(|v| v.as_ref())
            .and_then(|v| v.as_scalar())
    }

    pub fn resolved_count(&self) -> usize {
        self.values.values().filter(|v| v.is_some()).count()
    }
}

/// What triggered a calculation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Consensus,
    Earnings,
    Other(String),
}

impl EventSource {
    pub fn as_str(&self) -> &str {
        match self {
            EventSource::Consensus => "consensus",
            EventSource::Earnings => "earnings",
            EventSource::Other(s) => s.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "consensus" => EventSource::Consensus,
            "earnings" => EventSource::Earnings,
            other => EventSource::Other(other.to_string()),
        }
    }
}

/// One (ticker, date, source, source id) occurrence results are keyed by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRecord {
    pub ticker: String,
    pub event_date: NaiveDate,
    pub source: EventSource,
    pub source_id: String,
}

/// Individual analyst price target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTargetRecord {
    pub price_target: f64,
    pub publisher: Option<String>,
    pub date: NaiveDate,
}
