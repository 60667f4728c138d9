// Reshape lowering: a straight rename of the source reshape into the target
// one, with the dims attribute repacked as new_shape.

use crate::error::Result;
use crate::graph::ir::{NodeId, TensorGraph};
use crate::graph::rules::{helpers, RewriteMatch, RewriteOutcome, RewriteRule};
use crate::ops::OpKind;

pub struct ReshapeLowering;

impl RewriteRule for ReshapeLowering {
    fn name(&self) -> &str {
        "lower-reshape"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::Reshape
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::Reshape => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let input = helpers::operand(node, 0)?.to_string();
        let out_name = helpers::result_name(node)?.to_string();
        let dims = helpers::require_ints_attr(node, "dims")?;

        let (reshape, reshape_name) = helpers::reshape_to(graph, &input, &dims)?;
        graph.replace_value(&out_name, &reshape_name)?;
        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops: vec![reshape],
            output_mapping: vec![(out_name, reshape_name)],
        }))
    }
}
