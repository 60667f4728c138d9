//! # tosa-lowering
//!
//! Pattern-based lowering of high-level tensor graphs to a TOSA-style
//! accelerator dialect.
//!
//! ## Overview
//!
//! The crate rewrites graphs written in a high-level source vocabulary
//! (convolution, broadcast, dot, softmax, reshape, reduce-mean,
//! quantize-linear) into equivalent graphs over a small accelerator-style
//! target vocabulary (conv2d, matmul, transposes, reshapes, reductions,
//! elementwise arithmetic, casts, constants). Every value carries a declared
//! shape and element type stamped by a shape inference oracle when its
//! producer is constructed, and every rewrite keeps the whole graph
//! consistent with that oracle.
//!
//! ```text
//!  source graph         rewrite rules              target graph
//! +-------------+     +------------------+     +------------------+
//! | convolution |     | one rule per     |     | tosa.transpose   |
//! | softmax     | --> | source kind,     | --> | tosa.conv2d      |
//! | dot, ...    |     | applied per op   |     | tosa.matmul, ... |
//! +-------------+     +------------------+     +------------------+
//! ```
//!
//! ## Usage
//!
//! ```
//! use tosa_lowering::{
//!     Attribute, DType, GraphLowerer, OpKind, TensorGraph, TensorType, ValueInfo,
//! };
//!
//! # fn main() -> tosa_lowering::Result<()> {
//! let mut graph = TensorGraph::new();
//! graph.add_input(ValueInfo::new("x", TensorType::new(vec![2, 5], DType::F32)))?;
//! graph
//!     .add_op(OpKind::Softmax)
//!     .input("x")
//!     .attribute("axis", Attribute::Int(1))
//!     .output("y")
//!     .finish()?;
//! graph.mark_output("y")?;
//!
//! let stats = GraphLowerer::new().lower(&mut graph)?;
//! assert!(graph.is_lowered());
//! assert_eq!(stats.lowered, 1);
//! # Ok(())
//! # }
//! ```

pub mod config; // TOML configuration for the driver
pub mod error; // error taxonomy and Result alias
pub mod graph; // graph IR, rewrite rules, lowering driver
pub mod ops; // the two operation vocabularies
pub mod shape_inference; // the result-type oracle
pub mod types; // tensor types, attributes, constants

// Re-exports for convenient access
pub use config::{ConfigError, LoweringConfig};
pub use error::{LowerError, Result};
pub use graph::ir::{Dependency, GraphNode, GraphStatistics, NewOp, NodeId, TensorGraph};
pub use graph::rules::{
    GraphLowerer, LoweringStats, RewriteMatch, RewriteOutcome, RewriteRule, RuleSet,
};
pub use ops::{Dialect, OpKind};
pub use shape_inference::{broadcast_shapes, infer_op, rhs_broadcastable, ShapeInference};
pub use types::{Attribute, ConstData, DType, QuantizationInfo, TensorType, ValueInfo};

/// Crate version from Cargo metadata
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
