// Quantize-linear lowering.
//
// The arithmetic runs in f32 regardless of the source element type: an
// optional bias add in the source type, an upcast when the source is not
// already f32, a multiply by the scale operand, and a downcast to i8. The
// multiply is skipped entirely when the scale is a constant of ones, which
// collapses the common scale=1 case to a bare cast. Rounding on the downcast
// is whatever the cast primitive does natively.

use crate::error::Result;
use crate::graph::ir::{NodeId, TensorGraph};
use crate::graph::rules::{helpers, RewriteMatch, RewriteOutcome, RewriteRule};
use crate::ops::OpKind;
use crate::types::{Attribute, DType};
use tracing::debug;

pub struct QuantizeLinearLowering;

impl RewriteRule for QuantizeLinearLowering {
    fn name(&self) -> &str {
        "lower-quantizelinear"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::QuantizeLinear
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::QuantizeLinear => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let input = helpers::operand(node, 0)?.to_string();
        let scale = helpers::operand(node, 1)?.to_string();
        let bias = node.input_names.get(2).cloned();
        let out_name = helpers::result_name(node)?.to_string();

        let unit_scale = is_const_ones(graph, &scale);
        debug!(
            value = out_name.as_str(),
            unit_scale,
            has_bias = bias.is_some(),
            "lowering quantizelinear"
        );

        let mut new_ops = Vec::new();
        let mut current = input;

        if let Some(bias) = bias {
            let add_name = graph.fresh_name("add");
            let add = graph
                .add_op(OpKind::TosaAdd)
                .input(current)
                .input(bias)
                .output(add_name.clone())
                .finish()?;
            new_ops.push(add);
            current = add_name;
        }

        if helpers::value_ty(graph, &current)?.dtype != DType::F32 {
            let (upcast, upcast_name) = helpers::cast_to(graph, &current, DType::F32)?;
            new_ops.push(upcast);
            current = upcast_name;
        }

        if !unit_scale {
            let mul_name = graph.fresh_name("mul");
            let mul = graph
                .add_op(OpKind::TosaMul)
                .input(current)
                .input(scale)
                .attribute("shift", Attribute::Int(0))
                .output(mul_name.clone())
                .finish()?;
            new_ops.push(mul);
            current = mul_name;
        }

        let (downcast, downcast_name) = helpers::cast_to(graph, &current, DType::I8)?;
        new_ops.push(downcast);

        graph.replace_value(&out_name, &downcast_name)?;
        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops,
            output_mapping: vec![(out_name, downcast_name)],
        }))
    }
}

/// Whether a value is produced by a constant whose every element is one
fn is_const_ones(graph: &TensorGraph, value: &str) -> bool {
    let producer = match graph.producer_of(value) {
        Some((id, _)) => id,
        None => return false,
    };
    match graph.node(producer) {
        Some(node) if node.kind == OpKind::TosaConst => node
            .get_attribute("value")
            .and_then(Attribute::as_tensor)
            .map(|(_, data)| data.is_splat_one())
            .unwrap_or(false),
        _ => false,
    }
}
