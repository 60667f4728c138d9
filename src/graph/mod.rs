//! Tensor graph: intermediate representation and lowering rules
//!
//! - [`ir`]: the operation/value graph and its mutation primitives
//! - [`rules`]: the per-kind rewrite rules and the driver that applies them

pub mod ir;
pub mod rules;

// Re-exports
pub use ir::{Dependency, GraphNode, GraphStatistics, NewOp, NodeId, TensorGraph};
pub use rules::{
    GraphLowerer, LoweringStats, RewriteMatch, RewriteOutcome, RewriteRule, RuleSet,
};
