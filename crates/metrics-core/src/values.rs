use crate::definitions::ValueShape;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One dated observation of a series, most recent first within a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: Option<NaiveDate>,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(date: Option<NaiveDate>, value: f64) -> Self {
        Self { date, value }
    }
}

/// A list element paired with its predecessor (e.g. current vs previous target)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadPair {
    pub date: Option<NaiveDate>,
    pub current: f64,
    pub previous: f64,
}

/// Resolved value of a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Series(Vec<SeriesPoint>),
    Pairs(Vec<LeadPair>),
}

impl MetricValue {
    pub fn shape(&self) -> ValueShape {
        match self {
            MetricValue::Scalar(_) => ValueShape::Scalar,
            MetricValue::Series(_) => ValueShape::Series,
            MetricValue::Pairs(_) => ValueShape::Pairs,
        }
    }

    /// Scalar view used by expressions and valuation: a series contributes its
    /// most recent point, pairs have no scalar view.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Series(points) => points.first().map(|p| p.value),
            MetricValue::Pairs(_) => None,
        }
    }
}

/// Raw provider responses for one ticker, keyed by api call id.
/// A call that was attempted but produced nothing is simply absent.
#[derive(Debug, Clone, Default)]
pub struct RawResponses {
    responses: HashMap<String, serde_json::Value>,
}

impl RawResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call_id: impl Into<String>, body: serde_json::Value) {
        self.responses.insert(call_id.into(), body);
    }

    pub fn get(&self, call_id: &str) -> Option<&serde_json::Value> {
        self.responses.get(call_id)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}
