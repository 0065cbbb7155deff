//! Provenance tracking
//!
//! Every evaluated metric records one node describing how it was derived.
//! Nodes reference other metrics by id only, so deep expression chains are
//! merged with an explicit worklist instead of recursion.

use chrono::NaiveDate;
use metrics_core::{CalcType, DateInfo, DateRange, ProvenanceSummary, RawSourceSummary, SourceKind};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Default number of dates kept in a source preview
pub const DATE_PREVIEW_LIMIT: usize = 4;

/// Expression operand, optionally narrowed to the dates the expression read
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub metric_id: String,
    /// Set when only part of the operand's history was used (a series operand
    /// contributes its latest point only)
    pub restrict: Option<Vec<NaiveDate>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvenanceNode {
    ApiField {
        api_call_id: String,
        response_key: String,
        dates: Vec<NaiveDate>,
        single_date: bool,
    },
    Aggregation {
        base_metric_id: String,
        transform: String,
        consumed: Vec<NaiveDate>,
    },
    Expression {
        formula: String,
        operands: Vec<Operand>,
    },
    /// Value supplied from outside the graph; nothing below it is tracked
    Override { source_kind: SourceKind },
}

impl ProvenanceNode {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            ProvenanceNode::ApiField { .. } => SourceKind::ApiField,
            ProvenanceNode::Aggregation { .. } => SourceKind::Aggregation,
            ProvenanceNode::Expression { .. } => SourceKind::Expression,
            ProvenanceNode::Override { source_kind } => *source_kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct SourceAccumulator {
    dates: BTreeSet<NaiveDate>,
    transforms: BTreeSet<String>,
    single_date: bool,
}

/// Fully merged provenance of one metric, before preview capping
#[derive(Debug, Clone, PartialEq)]
pub struct MergedProvenance {
    pub source_kind: SourceKind,
    pub formula: Option<String>,
    pub externally_supplied: bool,
    sources: BTreeMap<String, SourceAccumulator>,
}

impl MergedProvenance {
    pub fn all_dates(&self) -> BTreeSet<NaiveDate> {
        self.sources.values().flat_map(|s| s.dates.iter().copied()).collect()
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(|k| k.as_str())
    }

    fn single_date_flags(&self) -> impl Iterator<Item = bool> + '_ {
        self.sources.values().map(|s| s.single_date)
    }

    pub fn summary(&self, preview: usize) -> ProvenanceSummary {
        let sources = self
            .sources
            .iter()
            .map(|(call_id, acc)| {
                let cap = if acc.single_date { 1 } else { preview };
                RawSourceSummary {
                    api_call_id: call_id.clone(),
                    date_preview: acc.dates.iter().rev().take(cap).copied().collect(),
                    date_count: acc.dates.len(),
                    transforms: acc.transforms.iter().cloned().collect(),
                    single_date: acc.single_date,
                }
            })
            .collect();

        ProvenanceSummary {
            source_kind: self.source_kind,
            formula: self.formula.clone(),
            externally_supplied: self.externally_supplied,
            sources,
        }
    }
}

struct Visit {
    metric_id: String,
    transforms: BTreeSet<String>,
    restrict: Option<BTreeSet<NaiveDate>>,
}

fn narrow(current: &Option<BTreeSet<NaiveDate>>, next: Option<&[NaiveDate]>) -> Option<BTreeSet<NaiveDate>> {
    match (current, next) {
        (None, None) => None,
        (Some(c), None) => Some(c.clone()),
        (None, Some(n)) => Some(n.iter().copied().collect()),
        (Some(c), Some(n)) => Some(n.iter().filter(|d| c.contains(d)).copied().collect()),
    }
}

/// Provenance nodes addressed by metric id
#[derive(Debug, Clone, Default)]
pub struct ProvenanceArena {
    nodes: BTreeMap<String, ProvenanceNode>,
}

impl ProvenanceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metric_id: impl Into<String>, node: ProvenanceNode) {
        self.nodes.insert(metric_id.into(), node);
    }

    /// Merge the chain below `metric_id` down to its raw provider calls:
    /// per call, the union of consumed dates and the transforms applied on
    /// the way up.
    pub fn merge(&self, metric_id: &str) -> Option<MergedProvenance> {
        let root = self.nodes.get(metric_id)?;
        let mut merged = MergedProvenance {
            source_kind: root.source_kind(),
            formula: match root {
                ProvenanceNode::Expression { formula, .. } => Some(formula.clone()),
                _ => None,
            },
            externally_supplied: matches!(root, ProvenanceNode::Override { .. }),
            sources: BTreeMap::new(),
        };

        let mut seen: HashSet<(String, Vec<String>, Option<Vec<NaiveDate>>)> = HashSet::new();
        let mut worklist = vec![Visit {
            metric_id: metric_id.to_string(),
            transforms: BTreeSet::new(),
            restrict: None,
        }];

        while let Some(visit) = worklist.pop() {
            let key = (
                visit.metric_id.clone(),
                visit.transforms.iter().cloned().collect::<Vec<_>>(),
                visit.restrict.as_ref().map(|r| r.iter().copied().collect::<Vec<_>>()),
            );
            if !seen.insert(key) {
                continue;
            }
            let Some(node) = self.nodes.get(&visit.metric_id) else {
                continue;
            };

            match node {
                ProvenanceNode::ApiField {
                    api_call_id,
                    dates,
                    single_date,
                    ..
                } => {
                    let acc = merged.sources.entry(api_call_id.clone()).or_default();
                    acc.dates.extend(
                        dates
                            .iter()
                            .filter(|d| visit.restrict.as_ref().map(|r| r.contains(d)).unwrap_or(true))
                            .copied(),
                    );
                    acc.transforms.extend(visit.transforms.iter().cloned());
                    acc.single_date |= *single_date;
                }
                ProvenanceNode::Aggregation {
                    base_metric_id,
                    transform,
                    consumed,
                } => {
                    let mut transforms = visit.transforms.clone();
                    transforms.insert(transform.clone());
                    worklist.push(Visit {
                        metric_id: base_metric_id.clone(),
                        transforms,
                        restrict: narrow(&visit.restrict, Some(consumed)),
                    });
                }
                ProvenanceNode::Expression { operands, .. } => {
                    for operand in operands {
                        worklist.push(Visit {
                            metric_id: operand.metric_id.clone(),
                            transforms: visit.transforms.clone(),
                            restrict: narrow(&visit.restrict, operand.restrict.as_deref()),
                        });
                    }
                }
                ProvenanceNode::Override { .. } => {}
            }
        }

        Some(merged)
    }
}

/// Date summary across the merged provenance of a domain's metrics
pub fn date_info<'a>(
    merged: impl IntoIterator<Item = (&'a String, &'a MergedProvenance)>,
    preview: usize,
) -> DateInfo {
    let mut per_metric = BTreeMap::new();
    let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut any_snapshot = false;
    let mut any_series = false;

    for (metric_id, m) in merged {
        dates.extend(m.all_dates());
        for single in m.single_date_flags() {
            if single {
                any_snapshot = true;
            } else {
                any_series = true;
            }
        }
        per_metric.insert(metric_id.clone(), m.summary(preview));
    }

    let calc_type = match (any_snapshot, any_series) {
        (true, true) => CalcType::Mixed,
        (true, false) => CalcType::Snapshot,
        (false, true) => CalcType::Series,
        (false, false) => CalcType::None,
    };

    DateInfo {
        calc_type,
        date_range: match (dates.first(), dates.last()) {
            (Some(from), Some(to)) => Some(DateRange { from: *from, to: *to }),
            _ => None,
        },
        count: dates.len(),
        per_metric,
    }
}
