// Softmax decomposition.
//
// No single target primitive exists, so the op expands along its axis into
// max-subtraction for numerical stability, exponentiation, and normalization
// by the reciprocal of the sum:
//
//   reduce_max -> sub -> exp -> reduce_sum -> reciprocal -> mul

use crate::error::Result;
use crate::graph::ir::{NodeId, TensorGraph};
use crate::graph::rules::{helpers, RewriteMatch, RewriteOutcome, RewriteRule};
use crate::ops::OpKind;
use crate::types::Attribute;
use tracing::debug;

pub struct SoftmaxLowering;

impl RewriteRule for SoftmaxLowering {
    fn name(&self) -> &str {
        "lower-softmax"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::Softmax
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::Softmax => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let input = helpers::operand(node, 0)?.to_string();
        let out_name = helpers::result_name(node)?.to_string();
        let axis = helpers::require_int_attr(node, "axis")?;

        debug!(value = out_name.as_str(), axis, "decomposing softmax");

        let (max, max_name) = reduce(graph, OpKind::TosaReduceMax, &input, axis, "max")?;
        let sub_name = graph.fresh_name("sub");
        let sub = graph
            .add_op(OpKind::TosaSub)
            .input(input.clone())
            .input(max_name)
            .output(sub_name.clone())
            .finish()?;
        let exp_name = graph.fresh_name("exp");
        let exp = graph
            .add_op(OpKind::TosaExp)
            .input(sub_name)
            .output(exp_name.clone())
            .finish()?;
        let (sum, sum_name) = reduce(graph, OpKind::TosaReduceSum, &exp_name, axis, "sum")?;
        let recip_name = graph.fresh_name("recip");
        let recip = graph
            .add_op(OpKind::TosaReciprocal)
            .input(sum_name)
            .output(recip_name.clone())
            .finish()?;
        let mul_name = graph.fresh_name("mul");
        let mul = graph
            .add_op(OpKind::TosaMul)
            .input(exp_name)
            .input(recip_name)
            .attribute("shift", Attribute::Int(0))
            .output(mul_name.clone())
            .finish()?;

        graph.replace_value(&out_name, &mul_name)?;
        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops: vec![max, sub, exp, sum, recip, mul],
            output_mapping: vec![(out_name, mul_name)],
        }))
    }
}

fn reduce(
    graph: &mut TensorGraph,
    kind: OpKind,
    input: &str,
    axis: i64,
    stem: &str,
) -> Result<(NodeId, String)> {
    let out = graph.fresh_name(stem);
    let id = graph
        .add_op(kind)
        .input(input)
        .attribute("axis", Attribute::Int(axis))
        .output(out.clone())
        .finish()?;
    Ok((id, out))
}
