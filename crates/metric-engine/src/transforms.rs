//! Aggregation transforms
//!
//! Declarations (shape contract + params schema) live in the
//! [`TransformRegistry`]; every declaration must map onto one of the built-in
//! [`TransformKind`] implementations or the registry refuses to load.

use chrono::NaiveDate;
use metrics_core::stats::{finite, mean, relative_change};
use metrics_core::{
    ConfigError, LeadPair, MetricValue, ParamSpec, SeriesPoint, TransformDefinition, ValueShape,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TransformError {
    #[error("{transform} expects a {expected:?} input, got {actual:?}")]
    TypeMismatch {
        transform: String,
        expected: ValueShape,
        actual: ValueShape,
    },
}

/// Built-in implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// Sum of the most recent N quarters (default 4)
    Ttm,
    /// Latest vs 4 periods prior
    Yoy,
    /// Latest vs 1 period prior
    Qoq,
    /// Mean of the most recent N quarters (default 2)
    AvgFromQuarter,
    /// Consecutive (current, previous) pairs
    LeadPairFromList,
    /// Most recent point
    Latest,
}

impl TransformKind {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "ttm" => Some(TransformKind::Ttm),
            "yoy" => Some(TransformKind::Yoy),
            "qoq" => Some(TransformKind::Qoq),
            "avgFromQuarter" => Some(TransformKind::AvgFromQuarter),
            "leadPairFromList" => Some(TransformKind::LeadPairFromList),
            "latest" => Some(TransformKind::Latest),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            TransformKind::Ttm => "ttm",
            TransformKind::Yoy => "yoy",
            TransformKind::Qoq => "qoq",
            TransformKind::AvgFromQuarter => "avgFromQuarter",
            TransformKind::LeadPairFromList => "leadPairFromList",
            TransformKind::Latest => "latest",
        }
    }

    fn declaration(&self) -> TransformDefinition {
        let (output_kind, params_schema, description) = match self {
            TransformKind::Ttm => (
                ValueShape::Scalar,
                BTreeMap::from([("quarters".to_string(), ParamSpec::integer(Some(1.0), Some(8.0)))]),
                "Trailing sum of the most recent quarters",
            ),
            TransformKind::Yoy => (ValueShape::Scalar, BTreeMap::new(), "Change vs four periods prior"),
            TransformKind::Qoq => (ValueShape::Scalar, BTreeMap::new(), "Change vs the prior period"),
            TransformKind::AvgFromQuarter => (
                ValueShape::Scalar,
                BTreeMap::from([("quarters".to_string(), ParamSpec::integer(Some(2.0), Some(8.0)))]),
                "Mean of the most recent quarters",
            ),
            TransformKind::LeadPairFromList => (
                ValueShape::Pairs,
                BTreeMap::from([("limit".to_string(), ParamSpec::integer(Some(1.0), None))]),
                "Pairs each element with its predecessor",
            ),
            TransformKind::Latest => (ValueShape::Scalar, BTreeMap::new(), "Most recent point"),
        };
        TransformDefinition {
            id: self.id().to_string(),
            input_kind: ValueShape::Series,
            output_kind,
            params_schema,
            description: Some(description.to_string()),
        }
    }

    const ALL: [TransformKind; 6] = [
        TransformKind::Ttm,
        TransformKind::Yoy,
        TransformKind::Qoq,
        TransformKind::AvgFromQuarter,
        TransformKind::LeadPairFromList,
        TransformKind::Latest,
    ];
}

/// A transform with its validated parameters, bound to one metric
#[derive(Debug, Clone, PartialEq)]
pub struct BoundTransform {
    pub kind: TransformKind,
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Output of one transform application
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub value: Option<MetricValue>,
    /// Dates of the base observations actually used
    pub consumed: Vec<NaiveDate>,
}

impl TransformOutput {
    fn empty() -> Self {
        Self {
            value: None,
            consumed: Vec::new(),
        }
    }

    fn scalar(value: Option<f64>, used: &[SeriesPoint]) -> Self {
        match value.and_then(finite) {
            Some(v) => Self {
                value: Some(MetricValue::Scalar(v)),
                consumed: used.iter().filter_map(|p| p.date).collect(),
            },
            None => Self::empty(),
        }
    }
}

impl BoundTransform {
    fn usize_param(&self, name: &str, default: usize) -> usize {
        self.params
            .get(name)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    /// Apply to a base value. Missing history yields an empty output; a
    /// non-series input is a type mismatch.
    pub fn apply(&self, base: &MetricValue) -> Result<TransformOutput, TransformError> {
        let points = match base {
            MetricValue::Series(points) => points.as_slice(),
            other => {
                return Err(TransformError::TypeMismatch {
                    transform: self.kind.id().to_string(),
                    expected: ValueShape::Series,
                    actual: other.shape(),
                })
            }
        };

        let output = match self.kind {
            TransformKind::Ttm => {
                let n = self.usize_param("quarters", 4);
                if points.len() < n {
                    TransformOutput::empty()
                } else {
                    let used = &points[..n];
                    TransformOutput::scalar(Some(used.iter().map(|p| p.value).sum()), used)
                }
            }
            TransformKind::Yoy => change_over(points, 4),
            TransformKind::Qoq => change_over(points, 1),
            TransformKind::AvgFromQuarter => {
                let n = self.usize_param("quarters", 2);
                if points.len() < n {
                    TransformOutput::empty()
                } else {
                    let used = &points[..n];
                    let values: Vec<f64> = used.iter().map(|p| p.value).collect();
                    TransformOutput::scalar(mean(&values), used)
                }
            }
            TransformKind::LeadPairFromList => {
                let mut pairs: Vec<LeadPair> = points
                    .windows(2)
                    .map(|w| LeadPair {
                        date: w[0].date,
                        current: w[0].value,
                        previous: w[1].value,
                    })
                    .collect();
                if let Some(limit) = self.params.get("limit").and_then(|v| v.as_u64()) {
                    pairs.truncate(limit as usize);
                }
                if pairs.is_empty() {
                    TransformOutput::empty()
                } else {
                    let used = &points[..pairs.len() + 1];
                    TransformOutput {
                        value: Some(MetricValue::Pairs(pairs)),
                        consumed: used.iter().filter_map(|p| p.date).collect(),
                    }
                }
            }
            TransformKind::Latest => match points.first() {
                Some(p) => TransformOutput::scalar(Some(p.value), std::slice::from_ref(p)),
                None => TransformOutput::empty(),
            },
        };
        Ok(output)
    }
}

fn change_over(points: &[SeriesPoint], lag: usize) -> TransformOutput {
    if points.len() <= lag {
        return TransformOutput::empty();
    }
    let used = [points[0].clone(), points[lag].clone()];
    TransformOutput::scalar(relative_change(points[0].value, points[lag].value), &used)
}

/// Immutable set of declared aggregation kinds
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    definitions: BTreeMap<String, TransformDefinition>,
}

impl TransformRegistry {
    /// Declarations for every built-in implementation
    pub fn builtin() -> Self {
        Self {
            definitions: TransformKind::ALL
                .iter()
                .map(|k| (k.id().to_string(), k.declaration()))
                .collect(),
        }
    }

    /// Load stored declarations, rejecting duplicates and kinds without an implementation.
    pub fn from_definitions(defs: Vec<TransformDefinition>) -> Result<Self, ConfigError> {
        let mut definitions = BTreeMap::new();
        for def in defs {
            let Some(kind) = TransformKind::from_id(&def.id) else {
                return Err(ConfigError::UnimplementedTransform(def.id));
            };
            let builtin = kind.declaration();
            if def.input_kind != builtin.input_kind || def.output_kind != builtin.output_kind {
                return Err(ConfigError::UnimplementedTransform(format!(
                    "{} ({:?}->{:?})",
                    def.id, def.input_kind, def.output_kind
                )));
            }
            if definitions.contains_key(&def.id) {
                return Err(ConfigError::DuplicateId {
                    kind: "transform",
                    id: def.id,
                });
            }
            definitions.insert(def.id.clone(), def);
        }
        Ok(Self { definitions })
    }

    pub fn get(&self, id: &str) -> Option<&TransformDefinition> {
        self.definitions.get(id)
    }

    /// Resolve a metric's aggregation kind and params into a [`BoundTransform`].
    pub fn bind(
        &self,
        metric_id: &str,
        kind_id: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<BoundTransform, ConfigError> {
        let (Some(def), Some(kind)) = (self.definitions.get(kind_id), TransformKind::from_id(kind_id)) else {
            return Err(ConfigError::UnknownTransform {
                metric: metric_id.to_string(),
                transform: kind_id.to_string(),
            });
        };

        let malformed = |detail: String| ConfigError::MalformedParams {
            metric: metric_id.to_string(),
            transform: kind_id.to_string(),
            detail,
        };

        for (name, value) in params {
            let spec = def
                .params_schema
                .get(name)
                .ok_or_else(|| malformed(format!("unknown parameter {}", name)))?;
            spec.check(value).map_err(|e| malformed(format!("{}: {}", name, e)))?;
        }
        for (name, spec) in &def.params_schema {
            if spec.required && !params.contains_key(name) {
                return Err(malformed(format!("missing required parameter {}", name)));
            }
        }

        Ok(BoundTransform {
            kind,
            params: params.clone(),
        })
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quarters(values: &[f64]) -> MetricValue {
        MetricValue::Series(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap() - chrono::Duration::days(91 * i as i64);
                    SeriesPoint::new(Some(date), *v)
                })
                .collect(),
        )
    }

    fn bind(kind: &str, params: serde_json::Value) -> BoundTransform {
        let params = params
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        TransformRegistry::builtin().bind("m", kind, &params).unwrap()
    }

    #[test]
    fn test_ttm_sums_four_quarters() {
        let out = bind("ttm", json!({})).apply(&quarters(&[1.0, 2.0, 3.0, 4.0, 100.0])).unwrap();
        assert_eq!(out.value, Some(MetricValue::Scalar(10.0)));
        assert_eq!(out.consumed.len(), 4);
    }

    #[test]
    fn test_ttm_needs_four_quarters() {
        let ttm = bind("ttm", json!({}));
        for k in 0..4 {
            let values: Vec<f64> = (0..k).map(|i| i as f64 + 1.0).collect();
            let out = ttm.apply(&quarters(&values)).unwrap();
            assert_eq!(out.value, None, "k = {}", k);
        }
    }

    #[test]
    fn test_yoy_and_qoq() {
        let series = quarters(&[120.0, 115.0, 110.0, 105.0, 100.0]);
        let yoy = bind("yoy", json!({})).apply(&series).unwrap();
        assert_eq!(yoy.value, Some(MetricValue::Scalar(0.2)));

        let qoq = bind("qoq", json!({})).apply(&quarters(&[110.0, 100.0])).unwrap();
        match qoq.value {
            Some(MetricValue::Scalar(v)) => assert!((v - 0.1).abs() < 1e-12),
            other => panic!("unexpected {:?}", other),
        }

        let short = bind("yoy", json!({})).apply(&quarters(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(short.value, None);
    }

    #[test]
    fn test_change_on_scalar_is_type_mismatch() {
        let err = bind("yoy", json!({})).apply(&MetricValue::Scalar(3.0)).unwrap_err();
        assert!(matches!(err, TransformError::TypeMismatch { .. }));
    }

    #[test]
    fn test_avg_from_quarter() {
        let out = bind("avgFromQuarter", json!({"quarters": 3}))
            .apply(&quarters(&[30.0, 20.0, 10.0, 0.0]))
            .unwrap();
        assert_eq!(out.value, Some(MetricValue::Scalar(20.0)));
    }

    #[test]
    fn test_lead_pairs() {
        let out = bind("leadPairFromList", json!({"limit": 2}))
            .apply(&quarters(&[3.0, 2.0, 1.0, 0.5]))
            .unwrap();
        match out.value {
            Some(MetricValue::Pairs(pairs)) => {
                assert_eq!(pairs.len(), 2);
                assert_eq!((pairs[0].current, pairs[0].previous), (3.0, 2.0));
                assert_eq!((pairs[1].current, pairs[1].previous), (2.0, 1.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out.consumed.len(), 3);
    }

    #[test]
    fn test_bind_rejects_bad_params() {
        let registry = TransformRegistry::builtin();
        let bad = BTreeMap::from([("quarters".to_string(), json!(0))]);
        assert!(matches!(
            registry.bind("m", "ttm", &bad),
            Err(ConfigError::MalformedParams { .. })
        ));

        let unknown = BTreeMap::from([("window".to_string(), json!(3))]);
        assert!(registry.bind("m", "ttm", &unknown).is_err());

        assert!(matches!(
            registry.bind("m", "median", &BTreeMap::new()),
            Err(ConfigError::UnknownTransform { .. })
        ));
    }

    #[test]
    fn test_unimplemented_declaration_rejected() {
        let def = TransformDefinition {
            id: "ewma".to_string(),
            input_kind: ValueShape::Series,
            output_kind: ValueShape::Scalar,
            params_schema: BTreeMap::new(),
            description: None,
        };
        assert!(matches!(
            TransformRegistry::from_definitions(vec![def]),
            Err(ConfigError::UnimplementedTransform(_))
        ));
    }
}
