//! Rewrite rules and the lowering driver
//!
//! One independent rule per source operation kind:
//!
//! - **ConvolutionLowering**: channel-first convolution to channel-last with
//!   layout transposes and a synthesized bias
//! - **BroadcastLowering** / **MultiBroadcastLowering**: erase explicit
//!   broadcasts by rewiring consumers onto reshaped inputs
//! - **DotLowering**: arbitrary-rank batched dot to rank-3 matmul
//! - **SoftmaxLowering**: six-op numerically stable decomposition
//! - **ReduceMeanLowering**: mean as multiply-by-reciprocal plus reduce-sum
//! - **ReshapeLowering**: attribute repack
//! - **QuantizeLinearLowering**: bias add, upcast, scale multiply, downcast
//!
//! [`RuleSet`] maps each source kind to its rule; [`GraphLowerer`] walks a
//! graph in topological order, applies the matching rule to every source
//! operation, and erases each replaced operation once its uses have moved.

pub mod helpers;

pub mod broadcast;
pub mod conv;
pub mod dot;
pub mod quantize;
pub mod reduce_mean;
pub mod reshape;
pub mod softmax;

// Re-exports
pub use broadcast::{BroadcastLowering, MultiBroadcastLowering};
pub use conv::ConvolutionLowering;
pub use dot::DotLowering;
pub use quantize::QuantizeLinearLowering;
pub use reduce_mean::ReduceMeanLowering;
pub use reshape::ReshapeLowering;
pub use softmax::SoftmaxLowering;

use crate::config::LoweringConfig;
use crate::error::Result;
use crate::graph::ir::{NodeId, TensorGraph};
use crate::ops::{Dialect, OpKind};
use rustc_hash::FxHashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A successful rewrite: the operations created and where the original
/// results went
#[derive(Debug, Clone)]
pub struct RewriteMatch {
    /// Newly created operations, in creation order
    pub new_ops: Vec<NodeId>,
    /// Original result name to replacement value name, one entry per result
    pub output_mapping: Vec<(String, String)>,
}

/// What a rule did with an operation
#[derive(Debug, Clone)]
pub enum RewriteOutcome {
    /// The operation was rewritten; its uses now read the replacement values
    Replaced(RewriteMatch),
    /// The rule's kind precondition was not met. Not an error.
    NotApplicable,
}

/// One lowering pattern for a single source operation kind.
///
/// A rule validates the full configuration before mutating anything: on any
/// error return the matched operation's connections are exactly as they were.
/// On success all uses of the original results have been redirected, so the
/// matched operation is dead (broadcast rules erase it themselves, everything
/// else leaves that to the driver).
pub trait RewriteRule {
    /// Stable name used in logs and failure reasons
    fn name(&self) -> &str;

    /// The source kind this rule matches
    fn source_kind(&self) -> OpKind;

    /// Attempt to rewrite `op` in place
    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome>;
}

/// Kind-indexed table of rewrite rules
pub struct RuleSet {
    rules: FxHashMap<OpKind, Box<dyn RewriteRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            rules: FxHashMap::default(),
        }
    }

    /// Every lowering rule this crate ships
    pub fn standard() -> Self {
        let mut set = Self::new();
        set.register(Box::new(ConvolutionLowering));
        set.register(Box::new(BroadcastLowering));
        set.register(Box::new(MultiBroadcastLowering));
        set.register(Box::new(DotLowering));
        set.register(Box::new(SoftmaxLowering));
        set.register(Box::new(ReduceMeanLowering));
        set.register(Box::new(ReshapeLowering));
        set.register(Box::new(QuantizeLinearLowering));
        set
    }

    /// Add a rule, replacing any existing rule for the same source kind
    pub fn register(&mut self, rule: Box<dyn RewriteRule>) {
        self.rules.insert(rule.source_kind(), rule);
    }

    pub fn rule_for(&self, kind: OpKind) -> Option<&dyn RewriteRule> {
        self.rules.get(&kind).map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Dispatch to the rule registered for the operation's kind.
    ///
    /// Operations with no registered rule are not applicable rather than an
    /// error, so a partial rule set degrades to a partial lowering.
    pub fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let kind = match graph.node(op) {
            Some(node) => node.kind,
            None => return Ok(RewriteOutcome::NotApplicable),
        };
        match self.rules.get(&kind) {
            Some(rule) => rule.try_rewrite(graph, op),
            None => {
                debug!(op = kind.name(), "no rule registered");
                Ok(RewriteOutcome::NotApplicable)
            }
        }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks a graph once, lowering every source operation it has a rule for
pub struct GraphLowerer {
    rules: RuleSet,
    verbose: bool,
    debug_export: Option<PathBuf>,
}

impl GraphLowerer {
    /// Driver over the standard rule set
    pub fn new() -> Self {
        Self {
            rules: RuleSet::standard(),
            verbose: false,
            debug_export: None,
        }
    }

    /// Driver over a caller-assembled rule set
    pub fn with_rules(rules: RuleSet) -> Self {
        Self {
            rules,
            verbose: false,
            debug_export: None,
        }
    }

    /// Driver configured from a loaded configuration file
    pub fn from_config(config: &LoweringConfig) -> Self {
        Self {
            rules: RuleSet::standard(),
            verbose: config.verbose.unwrap_or(false),
            debug_export: config.debug_export.clone(),
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Lower every source operation in the graph.
    ///
    /// Operations are visited in topological order so operand types are final
    /// before a dependent rule consults inference. The first failure aborts
    /// the walk; rewrites already committed stay committed.
    ///
    /// # Returns
    /// Counters for the walk. `lowered` counts rewritten operations,
    /// `not_applicable` the source operations left in place.
    pub fn lower(&self, graph: &mut TensorGraph) -> Result<LoweringStats> {
        let start = Instant::now();
        let mut stats = LoweringStats::default();

        for id in graph.topological_sort()? {
            let kind = match graph.node(id) {
                Some(node) => node.kind,
                None => continue,
            };
            if kind.dialect() != Dialect::Graph {
                continue;
            }
            match self.rules.try_rewrite(graph, id)? {
                RewriteOutcome::Replaced(rewrite) => {
                    if self.verbose {
                        info!(
                            op = kind.name(),
                            new_ops = rewrite.new_ops.len(),
                            "lowered operation"
                        );
                    } else {
                        debug!(
                            op = kind.name(),
                            new_ops = rewrite.new_ops.len(),
                            "lowered operation"
                        );
                    }
                    stats.lowered += 1;
                    stats.ops_created += rewrite.new_ops.len();
                    // broadcast rules erase the operation themselves
                    if graph.node(id).is_some() {
                        graph.remove_node(id)?;
                    }
                }
                RewriteOutcome::NotApplicable => {
                    stats.not_applicable += 1;
                }
            }
        }
        stats.duration = start.elapsed();

        if let Some(path) = &self.debug_export {
            if let Err(err) = std::fs::write(path, graph.visualize_dot()) {
                warn!(path = %path.display(), error = %err, "failed to export debug graph");
            }
        }
        info!(
            lowered = stats.lowered,
            skipped = stats.not_applicable,
            ops_created = stats.ops_created,
            fully_lowered = graph.is_lowered(),
            "lowering finished"
        );
        Ok(stats)
    }
}

impl Default for GraphLowerer {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters from one lowering walk
#[derive(Debug, Clone, Default)]
pub struct LoweringStats {
    pub lowered: usize,
    pub not_applicable: usize,
    pub ops_created: usize,
    pub duration: Duration,
}

impl fmt::Display for LoweringStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lowering summary:")?;
        writeln!(f, "  Rewritten:   {}", self.lowered)?;
        writeln!(f, "  Left as-is:  {}", self.not_applicable)?;
        writeln!(f, "  Ops created: {}", self.ops_created)?;
        writeln!(f, "  Duration:    {:?}", self.duration)?;
        Ok(())
    }
}
