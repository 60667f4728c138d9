// Reduce-mean decomposition.
//
// Mean is expressed as sum-of-(x * 1/n) so it only needs primitives the
// target vocabulary already has: a constant holding the axis element count,
// its reciprocal, an elementwise multiply, and a reduce-sum. Exactly one
// reduction axis is supported; asking for more is reported, never silently
// truncated to the first axis.

use crate::error::{LowerError, Result};
use crate::graph::ir::{NodeId, TensorGraph};
use crate::graph::rules::{helpers, RewriteMatch, RewriteOutcome, RewriteRule};
use crate::ops::OpKind;
use crate::types::{Attribute, DType};
use tracing::debug;

pub struct ReduceMeanLowering;

impl RewriteRule for ReduceMeanLowering {
    fn name(&self) -> &str {
        "lower-reduce-mean"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::ReduceMean
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::ReduceMean => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let input = helpers::operand(node, 0)?.to_string();
        let out_name = helpers::result_name(node)?.to_string();
        let axes = helpers::require_ints_attr(node, "axes")?;
        if axes.len() != 1 {
            return Err(LowerError::unsupported(
                self.name(),
                format!("only single-axis reductions are supported, got {:?}", axes),
            ));
        }
        let axis = axes[0];

        let in_ty = helpers::value_ty(graph, &input)?;
        if axis < 0 || axis as usize >= in_ty.rank() {
            return Err(LowerError::InvalidAttribute {
                kind: OpKind::ReduceMean,
                name: "axes",
                reason: format!("axis {} out of range for rank {}", axis, in_ty.rank()),
            });
        }
        let count = in_ty.dims[axis as usize];
        if in_ty.dtype == DType::I8 && count > i8::MAX as i64 {
            return Err(LowerError::unsupported(
                self.name(),
                format!("axis element count {} does not fit the i8 divisor constant", count),
            ));
        }

        debug!(value = out_name.as_str(), axis, count, "decomposing reduce_mean");

        let (divisor, divisor_name) = helpers::scalar_const(graph, in_ty.dtype, count as f64)?;
        let recip_name = graph.fresh_name("recip");
        let recip = graph
            .add_op(OpKind::TosaReciprocal)
            .input(divisor_name)
            .output(recip_name.clone())
            .finish()?;
        let mul_name = graph.fresh_name("mul");
        let mul = graph
            .add_op(OpKind::TosaMul)
            .input(input)
            .input(recip_name)
            .attribute("shift", Attribute::Int(0))
            .output(mul_name.clone())
            .finish()?;
        let sum_name = graph.fresh_name("sum");
        let sum = graph
            .add_op(OpKind::TosaReduceSum)
            .input(mul_name)
            .attribute("axis", Attribute::Int(axis))
            .output(sum_name.clone())
            .finish()?;

        graph.replace_value(&out_name, &sum_name)?;
        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops: vec![divisor, recip, mul, sum],
            output_mapping: vec![(out_name, sum_name)],
        }))
    }
}
