//! Metric calculation engine
//!
//! Loads metric, transform and api-call definitions, orders them into a
//! dependency graph and evaluates the graph against raw provider responses
//! for one ticker at one event date.

pub mod engine;
pub mod evaluator;
pub mod expression;
pub mod extract;
pub mod graph;
pub mod provenance;
pub mod registry;
pub mod transforms;

pub use engine::{EngineOutput, MetricEngine, QUALITATIVE_PREFIX, QUANTITATIVE_PREFIX};
pub use evaluator::{EvaluationContext, Evaluator};
pub use graph::{DependencyGraph, EvaluationPlan};
pub use provenance::{MergedProvenance, ProvenanceArena, ProvenanceNode};
pub use registry::{CompiledMetric, CompiledSource, MetricRegistry};
pub use transforms::{BoundTransform, TransformError, TransformKind, TransformRegistry};
