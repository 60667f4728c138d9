// Batched dot lowering.
//
// The target matmul is rank-3 only and wants equal batch extents, while the
// source dot takes any rank >= 2 with independent leading batch shapes. When
// the operands are not already in the direct form, both are flattened to
// (batch, rows, cols) and the result is reshaped back. A unit batch on the
// second operand is folded into the first operand's row extent; any other
// batch mismatch cannot be expressed and is reported.

use crate::error::{LowerError, Result};
use crate::graph::ir::{NodeId, TensorGraph};
use crate::graph::rules::{helpers, RewriteMatch, RewriteOutcome, RewriteRule};
use crate::ops::OpKind;
use crate::types::Attribute;
use tracing::debug;

pub struct DotLowering;

impl RewriteRule for DotLowering {
    fn name(&self) -> &str {
        "lower-dot"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::Dot
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::Dot => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let lhs = helpers::operand(node, 0)?.to_string();
        let rhs = helpers::operand(node, 1)?.to_string();
        let out_name = helpers::result_name(node)?.to_string();
        let xdlops = node.get_attribute("xdlopsV2").and_then(Attribute::as_bool);
        let perf_config = node
            .get_attribute("perf_config")
            .and_then(Attribute::as_str)
            .map(str::to_string);

        let lhs_ty = helpers::value_ty(graph, &lhs)?;
        let rhs_ty = helpers::value_ty(graph, &rhs)?;
        let out_ty = helpers::value_ty(graph, &out_name)?;
        if lhs_ty.rank() < 2 || rhs_ty.rank() < 2 {
            return Err(LowerError::InvalidGraph(format!(
                "dot operands must have rank >= 2, got {} and {}",
                lhs_ty, rhs_ty
            )));
        }
        let (ra, rb) = (lhs_ty.rank(), rhs_ty.rank());

        let direct = out_ty.rank() == 3
            && ra == rb
            && lhs_ty.dims[..ra - 2] == rhs_ty.dims[..rb - 2];

        if direct {
            debug!(lhs = %lhs_ty, rhs = %rhs_ty, "emitting matmul directly");
            let (matmul, matmul_name) =
                build_matmul(graph, &lhs, &rhs, xdlops, perf_config)?;
            graph.replace_value(&out_name, &matmul_name)?;
            return Ok(RewriteOutcome::Replaced(RewriteMatch {
                new_ops: vec![matmul],
                output_mapping: vec![(out_name, matmul_name)],
            }));
        }

        let mut lhs3 = helpers::flatten_batch(&lhs_ty.dims);
        let rhs3 = helpers::flatten_batch(&rhs_ty.dims);

        // an output batch grown by per-axis broadcast holds more elements
        // than the flat matmul and cannot reshape back
        let out_batch: i64 = out_ty.dims[..out_ty.rank() - 2].iter().product();
        if lhs3[0] != out_batch {
            return Err(LowerError::unsupported(
                self.name(),
                format!(
                    "cannot flatten batch dimensions {:?} x {:?} into a single matmul batch",
                    &lhs_ty.dims[..ra - 2],
                    &rhs_ty.dims[..rb - 2]
                ),
            ));
        }

        if lhs3[0] != rhs3[0] {
            if rhs3[0] != 1 {
                return Err(LowerError::unsupported(
                    self.name(),
                    format!(
                        "cannot broadcast batch dimension: {} vs {}",
                        lhs3[0], rhs3[0]
                    ),
                ));
            }
            // a uniformly broadcast rhs: fold the lhs batch into its rows
            lhs3 = [1, lhs3[0] * lhs3[1], lhs3[2]];
        }

        debug!(
            lhs = %lhs_ty,
            rhs = %rhs_ty,
            flattened = ?lhs3,
            "flattening batch dimensions for matmul"
        );

        let (r_lhs, r_lhs_name) = helpers::reshape_to(graph, &lhs, &lhs3)?;
        let (r_rhs, r_rhs_name) = helpers::reshape_to(graph, &rhs, &rhs3)?;
        let (matmul, matmul_name) =
            build_matmul(graph, &r_lhs_name, &r_rhs_name, xdlops, perf_config)?;
        let mut new_ops = vec![r_lhs, r_rhs, matmul];

        let matmul_ty = helpers::value_ty(graph, &matmul_name)?;
        let replacement = if matmul_ty.dims == out_ty.dims {
            matmul_name
        } else {
            let (back, back_name) = helpers::reshape_to(graph, &matmul_name, &out_ty.dims)?;
            new_ops.push(back);
            back_name
        };

        graph.replace_value(&out_name, &replacement)?;
        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops,
            output_mapping: vec![(out_name, replacement)],
        }))
    }
}

fn build_matmul(
    graph: &mut TensorGraph,
    lhs: &str,
    rhs: &str,
    xdlops: Option<bool>,
    perf_config: Option<String>,
) -> Result<(NodeId, String)> {
    let out = graph.fresh_name("matmul");
    let mut builder = graph.add_op(OpKind::TosaMatMul).input(lhs).input(rhs);
    if let Some(xdlops) = xdlops {
        builder = builder.attribute("xdlopsV2", Attribute::Bool(xdlops));
    }
    if let Some(perf_config) = perf_config {
        builder = builder.attribute("perf_config", Attribute::Str(perf_config));
    }
    let id = builder.output(out.clone()).finish()?;
    Ok((id, out))
}
