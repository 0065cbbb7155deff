//! Metric, transform and api-call definitions as they arrive from the
//! configuration store, plus the validated forms the engine works with.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a metric obtains its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ApiField,
    Aggregation,
    Expression,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ApiField => "api_field",
            SourceKind::Aggregation => "aggregation",
            SourceKind::Expression => "expression",
        }
    }
}

/// Validated sourcing strategy. Exactly one variant per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source_kind", rename_all = "snake_case")]
pub enum MetricSource {
    ApiField {
        api_call_id: String,
        response_key: String,
    },
    Aggregation {
        base_metric_id: String,
        aggregation_kind: String,
        #[serde(default)]
        aggregation_params: BTreeMap<String, serde_json::Value>,
    },
    Expression {
        expression: String,
    },
}

impl MetricSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            MetricSource::ApiField { .. } => SourceKind::ApiField,
            MetricSource::Aggregation { .. } => SourceKind::Aggregation,
            MetricSource::Expression { .. } => SourceKind::Expression,
        }
    }
}

/// A named, derivable quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    /// Grouping tag, e.g. `quantitative-valuation`, `qualitative-analyst`, `internal`
    pub domain: String,
    #[serde(flatten)]
    pub source: MetricSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Metric record exactly as stored: a kind tag plus loosely populated fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    pub domain: String,
    pub source_kind: Option<SourceKind>,
    #[serde(default)]
    pub api_call_id: Option<String>,
    #[serde(default)]
    pub response_key: Option<String>,
    #[serde(default)]
    pub base_metric_id: Option<String>,
    #[serde(default)]
    pub aggregation_kind: Option<String>,
    #[serde(default)]
    pub aggregation_params: Option<serde_json::Value>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn non_empty(field: &Option<String>) -> bool {
    field.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

impl TryFrom<MetricRecord> for MetricDefinition {
    type Error = ConfigError;

    fn try_from(record: MetricRecord) -> Result<Self, Self::Error> {
        let mismatch = |kind: &str, detail: &str| ConfigError::SourceMismatch {
            metric: record.id.clone(),
            kind: kind.to_string(),
            detail: detail.to_string(),
        };

        let Some(kind) = record.source_kind else {
            return Err(mismatch("<missing>", "source_kind is required"));
        };

        let has_api = non_empty(&record.api_call_id) || non_empty(&record.response_key);
        let has_agg = non_empty(&record.base_metric_id)
            || non_empty(&record.aggregation_kind)
            || record.aggregation_params.is_some();
        let has_expr = non_empty(&record.expression);

        let source = match kind {
            SourceKind::ApiField => {
                if has_agg || has_expr {
                    return Err(mismatch(kind.as_str(), "aggregation or expression fields are populated"));
                }
                match (&record.api_call_id, &record.response_key) {
                    (Some(call), Some(key)) if !call.trim().is_empty() && !key.trim().is_empty() => {
                        MetricSource::ApiField {
                            api_call_id: call.trim().to_string(),
                            response_key: key.trim().to_string(),
                        }
                    }
                    _ => return Err(mismatch(kind.as_str(), "api_call_id and response_key are required")),
                }
            }
            SourceKind::Aggregation => {
                if has_api || has_expr {
                    return Err(mismatch(kind.as_str(), "api or expression fields are populated"));
                }
                let (Some(base), Some(agg)) = (&record.base_metric_id, &record.aggregation_kind) else {
                    return Err(mismatch(kind.as_str(), "base_metric_id and aggregation_kind are required"));
                };
                if base.trim().is_empty() || agg.trim().is_empty() {
                    return Err(mismatch(kind.as_str(), "base_metric_id and aggregation_kind are required"));
                }
                let params = match &record.aggregation_params {
                    None | Some(serde_json::Value::Null) => BTreeMap::new(),
                    Some(serde_json::Value::Object(map)) => {
                        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    }
                    Some(_) => {
                        return Err(ConfigError::MalformedParams {
                            metric: record.id.clone(),
                            transform: agg.clone(),
                            detail: "aggregation_params must be an object".to_string(),
                        })
                    }
                };
                MetricSource::Aggregation {
                    base_metric_id: base.trim().to_string(),
                    aggregation_kind: agg.trim().to_string(),
                    aggregation_params: params,
                }
            }
            SourceKind::Expression => {
                if has_api || has_agg {
                    return Err(mismatch(kind.as_str(), "api or aggregation fields are populated"));
                }
                match &record.expression {
                    Some(expr) if !expr.trim().is_empty() => MetricSource::Expression {
                        expression: expr.trim().to_string(),
                    },
                    _ => return Err(mismatch(kind.as_str(), "expression is required")),
                }
            }
        };

        Ok(MetricDefinition {
            id: record.id,
            domain: record.domain,
            source,
            description: record.description,
        })
    }
}

/// Shape of a metric value, used for transform input/output contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueShape {
    Scalar,
    Series,
    Pairs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Integer,
    Number,
    Boolean,
    String,
}

/// Schema entry for one transform parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ParamSpec {
    pub fn integer(min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            param_type: ParamType::Integer,
            required: false,
            min,
            max,
        }
    }

    /// Check one supplied value against this declaration.
    pub fn check(&self, value: &serde_json::Value) -> Result<(), String> {
        let numeric = match self.param_type {
            ParamType::Integer => match value.as_i64() {
                Some(v) => Some(v as f64),
                None => return Err(format!("expected integer, got {}", value)),
            },
            ParamType::Number => match value.as_f64() {
                Some(v) => Some(v),
                None => return Err(format!("expected number, got {}", value)),
            },
            ParamType::Boolean => {
                if !value.is_boolean() {
                    return Err(format!("expected boolean, got {}", value));
                }
                None
            }
            ParamType::String => {
                if !value.is_string() {
                    return Err(format!("expected string, got {}", value));
                }
                None
            }
        };

        if let Some(v) = numeric {
            if let Some(min) = self.min {
                if v < min {
                    return Err(format!("{} is below minimum {}", v, min));
                }
            }
            if let Some(max) = self.max {
                if v > max {
                    return Err(format!("{} is above maximum {}", v, max));
                }
            }
        }
        Ok(())
    }
}

/// Declared aggregation kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformDefinition {
    pub id: String,
    pub input_kind: ValueShape,
    pub output_kind: ValueShape,
    #[serde(default)]
    pub params_schema: BTreeMap<String, ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One upstream call a metric can read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallDefinition {
    pub id: String,
    /// Path relative to the provider base url; `{ticker}`, `{from}` and `{to}` are substituted
    pub endpoint: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Dot path to the rows inside the response body
    #[serde(default)]
    pub results_key: Option<String>,
    /// Row field holding the period date (ISO date string or epoch millis)
    #[serde(default)]
    pub date_field: Option<String>,
    /// Snapshot calls only ever contribute their latest row at the event date
    #[serde(default)]
    pub single_date: bool,
}

/// Pairs a sector ratio with the ticker fundamental it multiplies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioPairing {
    pub ratio_metric: String,
    pub fundamental_metric: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationConfig {
    /// Domain evaluated for the target and every peer
    #[serde(default = "default_valuation_domain")]
    pub domain: String,
    pub ratios: Vec<RatioPairing>,
    pub price_metric: String,
    /// Relative band around parity classified as neutral
    #[serde(default)]
    pub neutral_band: f64,
}

fn default_valuation_domain() -> String {
    "quantitative-valuation".to_string()
}

/// The whole configuration document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricConfig {
    #[serde(default)]
    pub api_calls: Vec<ApiCallDefinition>,
    /// Falls back to the built-in declarations when absent
    #[serde(default)]
    pub transforms: Option<Vec<TransformDefinition>>,
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
    #[serde(default)]
    pub valuation: Option<ValuationConfig>,
}

impl MetricConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}
