use crate::expression::Expr;
use crate::transforms::{BoundTransform, TransformRegistry};
use metrics_core::{ApiCallDefinition, ConfigError, MetricDefinition, MetricRecord, MetricSource};
use std::collections::{BTreeMap, BTreeSet};

/// A metric whose references have all been checked and whose formula or
/// transform has been prepared for evaluation.
#[derive(Debug, Clone)]
pub enum CompiledSource {
    ApiField {
        call: ApiCallDefinition,
        response_key: String,
    },
    Aggregation {
        base_metric_id: String,
        transform: BoundTransform,
    },
    Expression {
        formula: String,
        expr: Expr,
    },
}

#[derive(Debug, Clone)]
pub struct CompiledMetric {
    pub definition: MetricDefinition,
    pub compiled: CompiledSource,
}

impl CompiledMetric {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn domain(&self) -> &str {
        &self.definition.domain
    }

    /// Metric ids this metric reads from
    pub fn dependencies(&self) -> BTreeSet<String> {
        match &self.compiled {
            CompiledSource::ApiField { .. } => BTreeSet::new(),
            CompiledSource::Aggregation { base_metric_id, .. } => BTreeSet::from([base_metric_id.clone()]),
            CompiledSource::Expression { expr, .. } => expr.references(),
        }
    }
}

/// Read-only set of metric definitions, validated once at load
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, CompiledMetric>,
    api_calls: BTreeMap<String, ApiCallDefinition>,
}

impl MetricRegistry {
    /// Validate raw records against the api-call and transform registries.
    pub fn load(
        api_calls: Vec<ApiCallDefinition>,
        records: Vec<MetricRecord>,
        transforms: &TransformRegistry,
    ) -> Result<Self, ConfigError> {
        let mut calls = BTreeMap::new();
        for call in api_calls {
            if calls.contains_key(&call.id) {
                return Err(ConfigError::DuplicateId {
                    kind: "api call",
                    id: call.id,
                });
            }
            calls.insert(call.id.clone(), call);
        }

        let mut definitions = BTreeMap::new();
        for record in records {
            let def = MetricDefinition::try_from(record)?;
            if definitions.contains_key(&def.id) {
                return Err(ConfigError::DuplicateId {
                    kind: "metric",
                    id: def.id,
                });
            }
            definitions.insert(def.id.clone(), def);
        }

        let mut metrics = BTreeMap::new();
        for (id, def) in &definitions {
            let compiled = match &def.source {
                MetricSource::ApiField {
                    api_call_id,
                    response_key,
                } => {
                    let call = calls.get(api_call_id).ok_or_else(|| ConfigError::UnknownApiCall {
                        metric: id.clone(),
                        call: api_call_id.clone(),
                    })?;
                    CompiledSource::ApiField {
                        call: call.clone(),
                        response_key: response_key.clone(),
                    }
                }
                MetricSource::Aggregation {
                    base_metric_id,
                    aggregation_kind,
                    aggregation_params,
                } => {
                    if !definitions.contains_key(base_metric_id) {
                        return Err(ConfigError::UnknownMetric {
                            metric: id.clone(),
                            target: base_metric_id.clone(),
                        });
                    }
                    CompiledSource::Aggregation {
                        base_metric_id: base_metric_id.clone(),
                        transform: transforms.bind(id, aggregation_kind, aggregation_params)?,
                    }
                }
                MetricSource::Expression { expression } => {
                    let expr = Expr::parse(expression).map_err(|e| ConfigError::ExpressionParse {
                        metric: id.clone(),
                        detail: e.to_string(),
                    })?;
                    if let Some(ident) = expr.references().into_iter().find(|r| !definitions.contains_key(r)) {
                        return Err(ConfigError::UnknownIdentifier {
                            metric: id.clone(),
                            ident,
                        });
                    }
                    CompiledSource::Expression {
                        formula: expression.clone(),
                        expr,
                    }
                }
            };
            metrics.insert(
                id.clone(),
                CompiledMetric {
                    definition: def.clone(),
                    compiled,
                },
            );
        }

        Ok(Self {
            metrics,
            api_calls: calls,
        })
    }

    pub fn get(&self, id: &str) -> Option<&CompiledMetric> {
        self.metrics.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.metrics.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledMetric> {
        self.metrics.values()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn api_calls(&self) -> impl Iterator<Item = &ApiCallDefinition> {
        self.api_calls.values()
    }

    /// Every distinct domain tag, sorted
    pub fn domains(&self) -> BTreeSet<String> {
        self.metrics.values().map(|m| m.domain().to_string()).collect()
    }

    pub fn domains_with_prefix(&self, prefix: &str) -> BTreeSet<String> {
        self.domains().into_iter().filter(|d| d.starts_with(prefix)).collect()
    }

    pub fn metrics_in_domain<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a CompiledMetric> + 'a {
        self.metrics.values().filter(move |m| m.domain() == domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_core::SourceKind;

    fn api(id: &str, call: &str, key: &str) -> MetricRecord {
        MetricRecord {
            id: id.to_string(),
            domain: "internal".to_string(),
            source_kind: Some(SourceKind::ApiField),
            api_call_id: Some(call.to_string()),
            response_key: Some(key.to_string()),
            ..Default::default()
        }
    }

    fn expr(id: &str, formula: &str) -> MetricRecord {
        MetricRecord {
            id: id.to_string(),
            domain: "quantitative-valuation".to_string(),
            source_kind: Some(SourceKind::Expression),
            expression: Some(formula.to_string()),
            ..Default::default()
        }
    }

    fn calls() -> Vec<ApiCallDefinition> {
        vec![ApiCallDefinition {
            id: "financials".to_string(),
            endpoint: "/vX/reference/financials".to_string(),
            query: BTreeMap::new(),
            results_key: Some("results".to_string()),
            date_field: Some("end_date".to_string()),
            single_date: false,
        }]
    }

    #[test]
    fn test_load_valid_registry() {
        let registry = MetricRegistry::load(
            calls(),
            vec![api("eps", "financials", "eps"), expr("double_eps", "eps * 2")],
            &TransformRegistry::builtin(),
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("double_eps").unwrap().dependencies(),
            BTreeSet::from(["eps".to_string()])
        );
        assert_eq!(
            registry.domains_with_prefix("quantitative-"),
            BTreeSet::from(["quantitative-valuation".to_string()])
        );
    }

    #[test]
    fn test_unknown_identifier_rejected_at_load() {
        let err = MetricRegistry::load(
            calls(),
            vec![api("eps", "financials", "eps"), expr("pe", "price / eps")],
            &TransformRegistry::builtin(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownIdentifier { ref ident, .. } if ident == "price"));
    }

    #[test]
    fn test_unknown_api_call_rejected() {
        let err = MetricRegistry::load(calls(), vec![api("eps", "quotes", "eps")], &TransformRegistry::builtin())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownApiCall { .. }));
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let record = MetricRecord {
            id: "eps_median".to_string(),
            domain: "internal".to_string(),
            source_kind: Some(SourceKind::Aggregation),
            base_metric_id: Some("eps".to_string()),
            aggregation_kind: Some("median".to_string()),
            ..Default::default()
        };
        let err = MetricRegistry::load(
            calls(),
            vec![api("eps", "financials", "eps"), record],
            &TransformRegistry::builtin(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTransform { .. }));
    }

    #[test]
    fn test_duplicate_metric_rejected() {
        let err = MetricRegistry::load(
            calls(),
            vec![api("eps", "financials", "eps"), api("eps", "financials", "eps")],
            &TransformRegistry::builtin(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateId { .. }));
    }

    #[test]
    fn test_malformed_expression_rejected() {
        let err = MetricRegistry::load(
            calls(),
            vec![api("eps", "financials", "eps"), expr("bad", "eps *")],
            &TransformRegistry::builtin(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ExpressionParse { .. }));
    }
}
