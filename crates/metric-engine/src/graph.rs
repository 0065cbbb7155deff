//! Dependency graph over metric definitions.
//!
//! Edges run from a dependency to its dependents (aggregation base -> metric,
//! expression operand -> metric). The graph is validated once at load; a cycle
//! is a configuration error naming the offending path.

use crate::registry::{CompiledSource, MetricRegistry};
use metrics_core::ConfigError;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Global topological order, dependencies first, stable across runs
    order: Vec<String>,
}

/// Evaluation sequence for a set of requested domains
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPlan {
    pub domains: BTreeSet<String>,
    pub order: Vec<String>,
    /// Api calls reachable from the requested domains
    pub required_calls: BTreeSet<String>,
}

impl EvaluationPlan {
    pub fn contains(&self, metric_id: &str) -> bool {
        self.order.iter().any(|m| m == metric_id)
    }
}

impl DependencyGraph {
    pub fn build(registry: &MetricRegistry) -> Result<Self, ConfigError> {
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for metric in registry.iter() {
            let deps = metric.dependencies();
            for dep in &deps {
                if !registry.contains(dep) {
                    return Err(ConfigError::UnknownMetric {
                        metric: metric.id().to_string(),
                        target: dep.clone(),
                    });
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(metric.id().to_string());
            }
            dependencies.insert(metric.id().to_string(), deps);
        }

        let order = topological_order(&dependencies)?;
        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependents_of(&self, metric_id: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(metric_id)
    }

    /// Metrics of the requested domains plus every transitive dependency,
    /// whatever domain those dependencies belong to.
    pub fn plan(&self, registry: &MetricRegistry, domains: &BTreeSet<String>) -> Result<EvaluationPlan, ConfigError> {
        let mut needed: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for domain in domains {
            let before = queue.len();
            queue.extend(registry.metrics_in_domain(domain).map(|m| m.id().to_string()));
            if queue.len() == before {
                return Err(ConfigError::UnknownDomain(domain.clone()));
            }
        }

        while let Some(id) = queue.pop_front() {
            if !needed.insert(id.clone()) {
                continue;
            }
            if let Some(deps) = self.dependencies.get(&id) {
                queue.extend(deps.iter().filter(|d| !needed.contains(*d)).cloned());
            }
        }

        let required_calls = needed
            .iter()
            .filter_map(|id| registry.get(id))
            .filter_map(|m| match &m.compiled {
                CompiledSource::ApiField { call, .. } => Some(call.id.clone()),
                _ => None,
            })
            .collect();

        Ok(EvaluationPlan {
            domains: domains.clone(),
            order: self.order.iter().filter(|id| needed.contains(*id)).cloned().collect(),
            required_calls,
        })
    }
}

/// Depth-first post-order with an on-stack marker. Roots and children are
/// visited in key order, so the result is deterministic.
fn topological_order(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>, ConfigError> {
    let empty = BTreeSet::new();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut order = Vec::with_capacity(dependencies.len());

    for root in dependencies.keys() {
        if marks.contains_key(root.as_str()) {
            continue;
        }
        marks.insert(root, Mark::OnStack);
        let mut stack = vec![(root.as_str(), dependencies.get(root).unwrap_or(&empty).iter())];

        while let Some((node, children)) = stack.last_mut() {
            match children.next() {
                Some(child) => match marks.get(child.as_str()) {
                    Some(Mark::Done) => {}
                    Some(Mark::OnStack) => {
                        let start = stack.iter().position(|(n, _)| *n == child.as_str()).unwrap_or(0);
                        let mut path: Vec<&str> = stack[start..].iter().map(|(n, _)| *n).collect();
                        path.push(child);
                        return Err(ConfigError::Cycle(path.join(" -> ")));
                    }
                    None => {
                        marks.insert(child, Mark::OnStack);
                        stack.push((child.as_str(), dependencies.get(child).unwrap_or(&empty).iter()));
                    }
                },
                None => {
                    let done = *node;
                    stack.pop();
                    marks.insert(done, Mark::Done);
                    order.push(done.to_string());
                }
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::TransformRegistry;
    use metrics_core::{ApiCallDefinition, MetricRecord, SourceKind};

    fn api(id: &str, domain: &str, call: &str) -> MetricRecord {
        MetricRecord {
            id: id.to_string(),
            domain: domain.to_string(),
            source_kind: Some(SourceKind::ApiField),
            api_call_id: Some(call.to_string()),
            response_key: Some("value".to_string()),
            ..Default::default()
        }
    }

    fn expr(id: &str, domain: &str, formula: &str) -> MetricRecord {
        MetricRecord {
            id: id.to_string(),
            domain: domain.to_string(),
            source_kind: Some(SourceKind::Expression),
            expression: Some(formula.to_string()),
            ..Default::default()
        }
    }

    fn agg(id: &str, domain: &str, base: &str, kind: &str) -> MetricRecord {
        MetricRecord {
            id: id.to_string(),
            domain: domain.to_string(),
            source_kind: Some(SourceKind::Aggregation),
            base_metric_id: Some(base.to_string()),
            aggregation_kind: Some(kind.to_string()),
            ..Default::default()
        }
    }

    fn call(id: &str) -> ApiCallDefinition {
        ApiCallDefinition {
            id: id.to_string(),
            endpoint: format!("/{}", id),
            query: BTreeMap::new(),
            results_key: None,
            date_field: None,
            single_date: false,
        }
    }

    fn registry(records: Vec<MetricRecord>) -> MetricRegistry {
        MetricRegistry::load(
            vec![call("financials"), call("quote"), call("ratings")],
            records,
            &TransformRegistry::builtin(),
        )
        .unwrap()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|m| m == id).unwrap()
    }

    #[test]
    fn test_dependencies_come_first() {
        let reg = registry(vec![
            expr("pe", "quantitative-valuation", "price / eps_ttm"),
            agg("eps_ttm", "internal", "eps", "ttm"),
            api("eps", "internal", "financials"),
            api("price", "internal", "quote"),
        ]);
        let graph = DependencyGraph::build(&reg).unwrap();
        let order = graph.order();

        assert!(position(order, "eps") < position(order, "eps_ttm"));
        assert!(position(order, "eps_ttm") < position(order, "pe"));
        assert!(position(order, "price") < position(order, "pe"));
        assert_eq!(
            graph.dependents_of("eps").unwrap(),
            &BTreeSet::from(["eps_ttm".to_string()])
        );
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let reg = registry(vec![
            expr("a", "internal", "b + 1"),
            expr("b", "internal", "c * 2"),
            expr("c", "internal", "a - 3"),
        ]);
        match DependencyGraph::build(&reg) {
            Err(ConfigError::Cycle(path)) => {
                assert!(path.contains("a") && path.contains("b") && path.contains("c"), "{}", path);
                assert_eq!(path.split(" -> ").next(), path.split(" -> ").last());
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_rejected() {
        let reg = registry(vec![expr("a", "internal", "a + 1")]);
        assert!(matches!(DependencyGraph::build(&reg), Err(ConfigError::Cycle(_))));
    }

    #[test]
    fn test_cycle_through_aggregation_rejected() {
        let reg = registry(vec![agg("a", "internal", "b", "ttm"), expr("b", "internal", "a / 4")]);
        assert!(matches!(DependencyGraph::build(&reg), Err(ConfigError::Cycle(_))));
    }

    #[test]
    fn test_diamond_is_accepted() {
        let reg = registry(vec![
            api("x", "internal", "financials"),
            expr("l", "internal", "x + 1"),
            expr("r", "internal", "x * 2"),
            expr("top", "internal", "l + r"),
        ]);
        let graph = DependencyGraph::build(&reg).unwrap();
        assert_eq!(graph.order().len(), 4);
        assert_eq!(graph.order().last().map(|s| s.as_str()), Some("top"));
    }

    #[test]
    fn test_order_is_deterministic() {
        let records = || {
            vec![
                api("z", "internal", "financials"),
                api("a", "internal", "quote"),
                expr("m", "internal", "z + a"),
            ]
        };
        let first = DependencyGraph::build(&registry(records())).unwrap();
        let second = DependencyGraph::build(&registry(records())).unwrap();
        assert_eq!(first.order(), second.order());
    }

    #[test]
    fn test_plan_covers_cross_domain_dependencies_only() {
        let reg = registry(vec![
            api("eps", "internal", "financials"),
            api("price", "internal", "quote"),
            agg("eps_ttm", "internal", "eps", "ttm"),
            expr("pe", "quantitative-valuation", "price / eps_ttm"),
            api("targets", "qualitative-analyst", "ratings"),
        ]);
        let graph = DependencyGraph::build(&reg).unwrap();
        let plan = graph
            .plan(&reg, &BTreeSet::from(["quantitative-valuation".to_string()]))
            .unwrap();

        assert_eq!(plan.order.len(), 4);
        assert!(!plan.contains("targets"));
        assert_eq!(
            plan.required_calls,
            BTreeSet::from(["financials".to_string(), "quote".to_string()])
        );
    }

    #[test]
    fn test_plan_unknown_domain() {
        let reg = registry(vec![api("eps", "internal", "financials")]);
        let graph = DependencyGraph::build(&reg).unwrap();
        assert!(matches!(
            graph.plan(&reg, &BTreeSet::from(["momentum".to_string()])),
            Err(ConfigError::UnknownDomain(_))
        ));
    }
}
