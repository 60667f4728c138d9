// Convolution lowering.
//
// The source convolution runs on channel-first operands; the target one is
// channel-last with a mandatory bias. The rewrite brackets the target
// convolution with layout transposes, synthesizes an all-zero bias when the
// source op carries none, and forwards stride, dilation, padding, and the
// optional tuning attributes unchanged.

use crate::error::{LowerError, Result};
use crate::graph::ir::{NodeId, TensorGraph};
use crate::graph::rules::{helpers, RewriteMatch, RewriteOutcome, RewriteRule};
use crate::ops::OpKind;
use crate::types::{Attribute, DType, QuantizationInfo};
use tracing::debug;

pub struct ConvolutionLowering;

impl RewriteRule for ConvolutionLowering {
    fn name(&self) -> &str {
        "lower-convolution"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::Convolution
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::Convolution => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let input = helpers::operand(node, 0)?.to_string();
        let filter = helpers::operand(node, 1)?.to_string();
        let source_bias = node.input_names.get(2).cloned();
        let out_name = helpers::result_name(node)?.to_string();
        let padding = helpers::require_ints_attr_of_len(node, "padding", 4)?;
        let stride = helpers::require_ints_attr_of_len(node, "stride", 2)?;
        let dilation = helpers::require_ints_attr_of_len(node, "dilation", 2)?;
        let xdlops = node.get_attribute("xdlopsV2").and_then(Attribute::as_bool);
        let perf_config = node
            .get_attribute("perf_config")
            .and_then(Attribute::as_str)
            .map(str::to_string);

        let in_ty = helpers::value_ty(graph, &input)?;
        let filter_ty = helpers::value_ty(graph, &filter)?;
        let out_ty = helpers::value_ty(graph, &out_name)?;
        if in_ty.rank() != 4 || filter_ty.rank() != 4 {
            return Err(LowerError::InvalidGraph(format!(
                "convolution operands must have rank 4, got {} and {}",
                in_ty, filter_ty
            )));
        }
        let out_channels = filter_ty.dims[0];

        debug!(input = %in_ty, filter = %filter_ty, "lowering convolution to channel-last form");

        let (t_in, t_in_name) = helpers::nchw_to_nhwc(graph, &input)?;
        let (t_filter, t_filter_name) = helpers::nchw_to_nhwc(graph, &filter)?;
        let mut new_ops = vec![t_in, t_filter];
        let bias_name = match source_bias {
            Some(bias) => bias,
            None => {
                let (bias, bias_name) = helpers::zero_bias(graph, out_ty.dtype, out_channels)?;
                new_ops.push(bias);
                bias_name
            }
        };

        let conv_out = graph.fresh_name("conv2d");
        let mut builder = graph
            .add_op(OpKind::TosaConv2d)
            .input(t_in_name)
            .input(t_filter_name)
            .input(bias_name)
            .attribute("pad", Attribute::Ints(padding))
            .attribute("stride", Attribute::Ints(stride))
            .attribute("dilation", Attribute::Ints(dilation));
        if in_ty.dtype == DType::I8 {
            // TODO: carry real zero points once quantized source graphs record them
            builder = builder.attribute(
                "quantization_info",
                Attribute::Quantization(QuantizationInfo {
                    input_zp: 0,
                    weight_zp: 0,
                }),
            );
        }
        if let Some(xdlops) = xdlops {
            builder = builder.attribute("xdlopsV2", Attribute::Bool(xdlops));
        }
        if let Some(perf_config) = perf_config {
            builder = builder.attribute("perf_config", Attribute::Str(perf_config));
        }
        let conv = builder.output(conv_out.clone()).finish()?;
        new_ops.push(conv);

        let (back, back_name) = helpers::nhwc_to_nchw(graph, &conv_out)?;
        new_ops.push(back);

        let back_ty = helpers::value_ty(graph, &back_name)?;
        if back_ty != out_ty {
            return Err(LowerError::ShapeMismatch {
                kind: OpKind::Convolution,
                reason: format!("lowered result {} does not match declared {}", back_ty, out_ty),
            });
        }

        graph.replace_value(&out_name, &back_name)?;
        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops,
            output_mapping: vec![(out_name, back_name)],
        }))
    }
}
