use crate::evaluator::{EvaluationContext, Evaluator};
use crate::graph::{DependencyGraph, EvaluationPlan};
use crate::registry::MetricRegistry;
use crate::transforms::TransformRegistry;
use chrono::NaiveDate;
use metrics_core::{ConfigError, DomainResult, MetricConfig, MetricValue, RawResponses, ValuationConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const QUANTITATIVE_PREFIX: &str = "quantitative-";
pub const QUALITATIVE_PREFIX: &str = "qualitative-";

/// Results of evaluating one plan for one (ticker, event date)
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub domains: BTreeMap<String, DomainResult>,
    /// Every metric in the plan, including dependencies outside the
    /// requested domains
    pub values: BTreeMap<String, Option<MetricValue>>,
}

impl EngineOutput {
    pub fn scalar(&self, metric_id: &str) -> Option<f64> {
        self.values
            .get(metric_id)
            .and_then(|v| v.as_ref())
            .and_then(|v| v.as_scalar())
    }

    /// Domain results whose tag starts with `prefix`
    pub fn bundle(&self, prefix: &str) -> BTreeMap<String, DomainResult> {
        self.domains
            .iter()
            .filter(|(d, _)| d.starts_with(prefix))
            .map(|(d, r)| (d.clone(), r.clone()))
            .collect()
    }
}

/// Loaded, validated metric configuration. Read-only once built and safe to
/// share across concurrent evaluations.
#[derive(Debug, Clone)]
pub struct MetricEngine {
    transforms: TransformRegistry,
    registry: MetricRegistry,
    graph: DependencyGraph,
    valuation: Option<ValuationConfig>,
}

impl MetricEngine {
    pub fn from_config(config: MetricConfig) -> Result<Self, ConfigError> {
        let transforms = match config.transforms {
            Some(defs) => TransformRegistry::from_definitions(defs)?,
            None => TransformRegistry::builtin(),
        };
        let registry = MetricRegistry::load(config.api_calls, config.metrics, &transforms)?;
        let graph = DependencyGraph::build(&registry)?;

        let engine = Self {
            transforms,
            registry,
            graph,
            valuation: config.valuation,
        };
        engine.check_valuation()?;
        Ok(engine)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_config(MetricConfig::from_path(path)?)
    }

    /// Every metric the valuation engine reads must be produced by the
    /// valuation domain's plan, since peers evaluate only that plan.
    fn check_valuation(&self) -> Result<(), ConfigError> {
        let Some(valuation) = &self.valuation else {
            return Ok(());
        };
        if valuation.ratios.is_empty() {
            return Err(ConfigError::Valuation("no ratios configured".to_string()));
        }
        if !valuation.neutral_band.is_finite() || valuation.neutral_band < 0.0 {
            return Err(ConfigError::Valuation(format!(
                "neutral band must be a non-negative number, got {}",
                valuation.neutral_band
            )));
        }

        let plan = self
            .graph
            .plan(&self.registry, &BTreeSet::from([valuation.domain.clone()]))?;
        let referenced = valuation
            .ratios
            .iter()
            .flat_map(|r| [&r.ratio_metric, &r.fundamental_metric])
            .chain(std::iter::once(&valuation.price_metric));
        for metric in referenced {
            if !self.registry.contains(metric) {
                return Err(ConfigError::Valuation(format!("unknown metric '{}'", metric)));
            }
            if !plan.contains(metric) {
                return Err(ConfigError::Valuation(format!(
                    "'{}' is not reachable from domain '{}'",
                    metric, valuation.domain
                )));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn valuation(&self) -> Option<&ValuationConfig> {
        self.valuation.as_ref()
    }

    pub fn quantitative_domains(&self) -> BTreeSet<String> {
        self.registry.domains_with_prefix(QUANTITATIVE_PREFIX)
    }

    pub fn qualitative_domains(&self) -> BTreeSet<String> {
        self.registry.domains_with_prefix(QUALITATIVE_PREFIX)
    }

    pub fn plan<I, S>(&self, domains: I) -> Result<EvaluationPlan, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let domains: BTreeSet<String> = domains.into_iter().map(Into::into).collect();
        self.graph.plan(&self.registry, &domains)
    }

    /// Provider calls needed to evaluate `domains`
    pub fn required_calls<I, S>(&self, domains: I) -> Result<BTreeSet<String>, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.plan(domains)?.required_calls)
    }

    pub fn evaluate(
        &self,
        plan: &EvaluationPlan,
        ticker: &str,
        event_date: NaiveDate,
        responses: &RawResponses,
        overrides: &BTreeMap<String, f64>,
    ) -> EngineOutput {
        let evaluator = Evaluator::new(&self.registry);
        let mut ctx = EvaluationContext::new(ticker, event_date, responses).with_overrides(overrides.clone());
        evaluator.run(&mut ctx, plan);

        let domains = plan
            .domains
            .iter()
            .map(|d| (d.clone(), evaluator.domain_result(&ctx, d)))
            .collect();
        EngineOutput {
            domains,
            values: ctx.into_values(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONFIG: &str = r#"{
        "api_calls": [
            {"id": "financials", "endpoint": "/vX/reference/financials",
             "query": {"ticker": "{ticker}", "timeframe": "quarterly"},
             "results_key": "results", "date_field": "end_date"},
            {"id": "prev_close", "endpoint": "/v2/aggs/ticker/{ticker}/prev",
             "results_key": "results", "single_date": true}
        ],
        "metrics": [
            {"id": "eps", "domain": "internal", "source_kind": "api_field",
             "api_call_id": "financials", "response_key": "eps"},
            {"id": "price", "domain": "internal", "source_kind": "api_field",
             "api_call_id": "prev_close", "response_key": "c"},
            {"id": "eps_ttm", "domain": "quantitative-valuation", "source_kind": "aggregation",
             "base_metric_id": "eps", "aggregation_kind": "ttm", "aggregation_params": {"quarters": 4}},
            {"id": "pe_ratio", "domain": "quantitative-valuation", "source_kind": "expression",
             "expression": "price / eps_ttm"},
            {"id": "eps_change", "domain": "qualitative-trend", "source_kind": "aggregation",
             "base_metric_id": "eps", "aggregation_kind": "qoq"}
        ],
        "valuation": {"ratios": [{"ratio_metric": "pe_ratio", "fundamental_metric": "eps_ttm"}],
                      "price_metric": "price"}
    }"#;

    #[test]
    fn test_from_config_and_evaluate() {
        let engine = MetricEngine::from_config(MetricConfig::from_json(CONFIG).unwrap()).unwrap();
        assert_eq!(engine.quantitative_domains().len(), 1);
        assert_eq!(engine.qualitative_domains().len(), 1);

        let plan = engine.plan(["quantitative-valuation"]).unwrap();
        assert_eq!(
            plan.required_calls,
            BTreeSet::from(["financials".to_string(), "prev_close".to_string()])
        );

        let mut raw = RawResponses::new();
        raw.insert(
            "financials",
            json!({"results": [
                {"end_date": "2024-12-31", "eps": 2.0},
                {"end_date": "2024-09-30", "eps": 1.0},
                {"end_date": "2024-06-30", "eps": 1.0},
                {"end_date": "2024-03-31", "eps": 1.0}
            ]}),
        );
        raw.insert("prev_close", json!({"results": [{"c": 100.0}]}));

        let out = engine.evaluate(
            &plan,
            "MSFT",
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            &raw,
            &BTreeMap::new(),
        );
        assert_eq!(out.scalar("pe_ratio"), Some(20.0));
        assert_eq!(out.scalar("price"), Some(100.0));
        assert_eq!(out.bundle(QUANTITATIVE_PREFIX).len(), 1);
        assert!(out.bundle(QUALITATIVE_PREFIX).is_empty());
    }

    #[test]
    fn test_valuation_metric_must_exist() {
        let broken = CONFIG.replace("\"price_metric\": \"price\"", "\"price_metric\": \"last_price\"");
        let err = MetricEngine::from_config(MetricConfig::from_json(&broken).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Valuation(_)));
    }

    #[test]
    fn test_valuation_metric_must_be_reachable() {
        let broken = CONFIG.replace("\"fundamental_metric\": \"eps_ttm\"", "\"fundamental_metric\": \"eps_change\"");
        let err = MetricEngine::from_config(MetricConfig::from_json(&broken).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Valuation(_)));
    }

    #[test]
    fn test_example_config_loads() {
        let example = include_str!("../../../config/metrics.example.json");
        let engine = MetricEngine::from_config(MetricConfig::from_json(example).unwrap()).unwrap();
        assert_eq!(engine.quantitative_domains().len(), 3);

        let peer_calls = engine.required_calls(["quantitative-valuation"]).unwrap();
        assert_eq!(
            peer_calls,
            BTreeSet::from([
                "daily_bars".to_string(),
                "financials".to_string(),
                "ticker_details".to_string()
            ])
        );
        let consensus_calls = engine.required_calls(["qualitative-consensus"]).unwrap();
        assert!(consensus_calls.contains("analyst_ratings"));
        assert!(!consensus_calls.contains("financials"));
    }

    #[test]
    fn test_cycle_blocks_start() {
        let cyclic = CONFIG.replace("\"price / eps_ttm\"", "\"price / pe_ratio\"");
        let err = MetricEngine::from_config(MetricConfig::from_json(&cyclic).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Cycle(_)));
    }
}
