use crate::extract::extract;
use crate::graph::EvaluationPlan;
use crate::provenance::{date_info, Operand, ProvenanceArena, ProvenanceNode, DATE_PREVIEW_LIMIT};
use crate::registry::{CompiledMetric, CompiledSource, MetricRegistry};
use chrono::NaiveDate;
use metrics_core::{DomainResult, MetricValue, RawResponses};
use std::collections::BTreeMap;

/// State for one (ticker, event date) evaluation. Created per event and
/// dropped once its results are taken.
pub struct EvaluationContext<'a> {
    pub ticker: String,
    pub event_date: NaiveDate,
    responses: &'a RawResponses,
    overrides: BTreeMap<String, f64>,
    computed: BTreeMap<String, Option<MetricValue>>,
    provenance: ProvenanceArena,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(ticker: impl Into<String>, event_date: NaiveDate, responses: &'a RawResponses) -> Self {
        Self {
            ticker: ticker.into(),
            event_date,
            responses,
            overrides: BTreeMap::new(),
            computed: BTreeMap::new(),
            provenance: ProvenanceArena::new(),
        }
    }

    /// Values that replace graph evaluation for the given metric ids
    pub fn with_overrides(mut self, overrides: BTreeMap<String, f64>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn value(&self, metric_id: &str) -> Option<&MetricValue> {
        self.computed.get(metric_id).and_then(|v| v.as_ref())
    }

    pub fn scalar(&self, metric_id: &str) -> Option<f64> {
        self.value(metric_id).and_then(|v| v.as_scalar())
    }

    pub fn is_computed(&self, metric_id: &str) -> bool {
        self.computed.contains_key(metric_id)
    }

    pub fn provenance(&self) -> &ProvenanceArena {
        &self.provenance
    }

    pub fn into_values(self) -> BTreeMap<String, Option<MetricValue>> {
        self.computed
    }
}

/// Walks an evaluation plan in order, resolving one metric at a time.
pub struct Evaluator<'r> {
    registry: &'r MetricRegistry,
}

impl<'r> Evaluator<'r> {
    pub fn new(registry: &'r MetricRegistry) -> Self {
        Self { registry }
    }

    pub fn run(&self, ctx: &mut EvaluationContext<'_>, plan: &EvaluationPlan) {
        for id in &plan.order {
            let Some(metric) = self.registry.get(id) else {
                continue;
            };
            let (value, node) = match ctx.overrides.get(id) {
                Some(v) => (
                    Some(MetricValue::Scalar(*v)),
                    ProvenanceNode::Override {
                        source_kind: metric.definition.source.kind(),
                    },
                ),
                None => self.evaluate_metric(ctx, metric),
            };
            ctx.computed.insert(id.clone(), value);
            ctx.provenance.record(id.clone(), node);
        }
    }

    fn evaluate_metric(
        &self,
        ctx: &EvaluationContext<'_>,
        metric: &CompiledMetric,
    ) -> (Option<MetricValue>, ProvenanceNode) {
        match &metric.compiled {
            CompiledSource::ApiField { call, response_key } => {
                let extracted = ctx
                    .responses
                    .get(&call.id)
                    .and_then(|body| extract(body, call, response_key, ctx.event_date));
                let (value, dates) = match extracted {
                    Some(e) => (Some(e.value), e.dates),
                    None => (None, Vec::new()),
                };
                let node = ProvenanceNode::ApiField {
                    api_call_id: call.id.clone(),
                    response_key: response_key.clone(),
                    dates,
                    single_date: call.single_date,
                };
                (value, node)
            }
            CompiledSource::Aggregation {
                base_metric_id,
                transform,
            } => {
                let (value, consumed) = match ctx.value(base_metric_id) {
                    None => (None, Vec::new()),
                    Some(base) => match transform.apply(base) {
                        Ok(out) => (out.value, out.consumed),
                        Err(e) => {
                            tracing::warn!(
                                "{} {}: {} on {}: {}",
                                ctx.ticker,
                                ctx.event_date,
                                metric.id(),
                                base_metric_id,
                                e
                            );
                            (None, Vec::new())
                        }
                    },
                };
                let node = ProvenanceNode::Aggregation {
                    base_metric_id: base_metric_id.clone(),
                    transform: transform.kind.id().to_string(),
                    consumed,
                };
                (value, node)
            }
            CompiledSource::Expression { formula, expr } => {
                let operands = expr
                    .references()
                    .into_iter()
                    .map(|id| {
                        let restrict = match ctx.value(&id) {
                            Some(MetricValue::Series(points)) => {
                                Some(points.first().and_then(|p| p.date).into_iter().collect())
                            }
                            _ => None,
                        };
                        Operand { metric_id: id, restrict }
                    })
                    .collect();
                let value = expr
                    .eval(&|id| ctx.value(id).and_then(|v| v.as_scalar()))
                    .map(MetricValue::Scalar);
                let node = ProvenanceNode::Expression {
                    formula: formula.clone(),
                    operands,
                };
                (value, node)
            }
        }
    }

    /// Values and date info for one domain's metrics
    pub fn domain_result(&self, ctx: &EvaluationContext<'_>, domain: &str) -> DomainResult {
        let mut values = BTreeMap::new();
        let mut merged = BTreeMap::new();
        for metric in self.registry.metrics_in_domain(domain) {
            let id = metric.id().to_string();
            values.insert(id.clone(), ctx.value(&id).cloned());
            if let Some(m) = ctx.provenance.merge(&id) {
                merged.insert(id, m);
            }
        }
        DomainResult {
            values,
            date_info: date_info(merged.iter(), DATE_PREVIEW_LIMIT),
        }
    }
}
