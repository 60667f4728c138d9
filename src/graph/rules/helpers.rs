// Shared construction and dimension algebra for the rewrite rules.
//
// Rules validate everything before they mutate, so the helpers split into
// pure shape computations (safe to call during validation) and graph-building
// shorthands that mint fresh value names and append one target operation.

use crate::error::{LowerError, Result};
use crate::graph::ir::{GraphNode, NewOp, NodeId, TensorGraph};
use crate::ops::OpKind;
use crate::types::{Attribute, ConstData, DType, TensorType};

/// Feature-map layout permutation: NCHW to NHWC
pub const NCHW_TO_NHWC: [i64; 4] = [0, 2, 3, 1];
/// Feature-map layout permutation: NHWC back to NCHW
pub const NHWC_TO_NCHW: [i64; 4] = [0, 3, 1, 2];

// ---------------------------------------------------------------------------
// Pure shape algebra
// ---------------------------------------------------------------------------

/// Embed `dims` into a rank-`out_rank` shape of ones starting at `axis`.
///
/// This is the explicit-broadcast alignment: the result has the input extents
/// in the window `[axis, axis + rank)` and 1 everywhere else, so it is
/// broadcast-compatible in the second operand slot of any consumer whose
/// result has `out_rank` dimensions.
pub fn align_broadcast_shape(dims: &[i64], out_rank: usize, axis: usize) -> Option<Vec<i64>> {
    if axis + dims.len() > out_rank {
        return None;
    }
    let mut shape = vec![1; out_rank];
    shape[axis..axis + dims.len()].copy_from_slice(dims);
    Some(shape)
}

/// Collapse all leading dimensions into one batch extent, keeping the
/// trailing two.
///
/// Rank-2 shapes get an implicit batch of 1. Callers guarantee rank >= 2.
pub fn flatten_batch(dims: &[i64]) -> [i64; 3] {
    let r = dims.len();
    let batch = dims[..r - 2].iter().product::<i64>();
    [batch, dims[r - 2], dims[r - 1]]
}

// ---------------------------------------------------------------------------
// Node structure accessors
// ---------------------------------------------------------------------------

pub fn operand(node: &GraphNode, index: usize) -> Result<&str> {
    node.input_names
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| {
            LowerError::InvalidGraph(format!("{} is missing operand {}", node.kind, index))
        })
}

pub fn result_name(node: &GraphNode) -> Result<&str> {
    node.output_names
        .first()
        .map(String::as_str)
        .ok_or_else(|| LowerError::InvalidGraph(format!("{} has no result", node.kind)))
}

pub fn value_ty(graph: &TensorGraph, name: &str) -> Result<TensorType> {
    graph
        .value_type(name)
        .cloned()
        .ok_or_else(|| LowerError::UnknownValue(name.to_string()))
}

pub fn require_int_attr(node: &GraphNode, name: &'static str) -> Result<i64> {
    node.get_attribute(name)
        .ok_or(LowerError::MissingAttribute {
            kind: node.kind,
            name,
        })?
        .as_int()
        .ok_or_else(|| LowerError::InvalidAttribute {
            kind: node.kind,
            name,
            reason: "expected an integer".into(),
        })
}

pub fn require_ints_attr(node: &GraphNode, name: &'static str) -> Result<Vec<i64>> {
    Ok(node
        .get_attribute(name)
        .ok_or(LowerError::MissingAttribute {
            kind: node.kind,
            name,
        })?
        .as_ints()
        .ok_or_else(|| LowerError::InvalidAttribute {
            kind: node.kind,
            name,
            reason: "expected an integer list".into(),
        })?
        .to_vec())
}

pub fn require_ints_attr_of_len(
    node: &GraphNode,
    name: &'static str,
    len: usize,
) -> Result<Vec<i64>> {
    let values = require_ints_attr(node, name)?;
    if values.len() != len {
        return Err(LowerError::InvalidAttribute {
            kind: node.kind,
            name,
            reason: format!("expected {} entries, got {}", len, values.len()),
        });
    }
    Ok(values)
}

// ---------------------------------------------------------------------------
// Consumer checks for broadcast rewires
// ---------------------------------------------------------------------------

/// Check that `consumer` can take a broadcast replacement in its second
/// operand slot.
///
/// # Returns
/// Whether the consumer's operands must be swapped to put the value there.
/// Non-elementwise consumers, consumers reading the value in both slots, and
/// non-commutative consumers reading it in the first slot are all reported as
/// unsupported.
pub fn rhs_position(rule: &str, consumer: &GraphNode, value: &str) -> Result<bool> {
    if !consumer.kind.is_elementwise_binary() {
        return Err(LowerError::unsupported(
            rule,
            format!("consumer {} cannot take a broadcast operand", consumer.kind),
        ));
    }
    let at0 = consumer.input_names.first().map(|n| n == value) == Some(true);
    let at1 = consumer.input_names.get(1).map(|n| n == value) == Some(true);
    match (at0, at1) {
        (false, true) => Ok(false),
        (true, false) if consumer.kind.is_commutative() => Ok(true),
        (true, false) => Err(LowerError::unsupported(
            rule,
            format!(
                "{} broadcasts only its second operand and is not commutative",
                consumer.kind
            ),
        )),
        (true, true) => Err(LowerError::unsupported(
            rule,
            format!("both operands of {} read the broadcast value", consumer.kind),
        )),
        (false, false) => Err(LowerError::InvalidGraph(format!(
            "{} does not read '{}'",
            consumer.kind, value
        ))),
    }
}

// ---------------------------------------------------------------------------
// Target-op construction
// ---------------------------------------------------------------------------

fn finish_named(builder: NewOp<'_>, out: String) -> Result<(NodeId, String)> {
    let id = builder.output(out.clone()).finish()?;
    Ok((id, out))
}

/// Append a transpose of a rank-4 value
pub fn transpose_4d(
    graph: &mut TensorGraph,
    value: &str,
    perm: [i64; 4],
    stem: &str,
) -> Result<(NodeId, String)> {
    let out = graph.fresh_name(stem);
    let builder = graph
        .add_op(OpKind::TosaTranspose)
        .input(value)
        .attribute("perm", Attribute::Ints(perm.to_vec()));
    finish_named(builder, out)
}

pub fn nchw_to_nhwc(graph: &mut TensorGraph, value: &str) -> Result<(NodeId, String)> {
    transpose_4d(graph, value, NCHW_TO_NHWC, "nhwc")
}

pub fn nhwc_to_nchw(graph: &mut TensorGraph, value: &str) -> Result<(NodeId, String)> {
    transpose_4d(graph, value, NHWC_TO_NCHW, "nchw")
}

/// Append a reshape of a value to the given extents
pub fn reshape_to(graph: &mut TensorGraph, value: &str, dims: &[i64]) -> Result<(NodeId, String)> {
    let out = graph.fresh_name("reshape");
    let builder = graph
        .add_op(OpKind::TosaReshape)
        .input(value)
        .attribute("new_shape", Attribute::Ints(dims.to_vec()));
    finish_named(builder, out)
}

/// Append a cast of a value to another element type
pub fn cast_to(graph: &mut TensorGraph, value: &str, dtype: DType) -> Result<(NodeId, String)> {
    let out = graph.fresh_name("cast");
    let builder = graph
        .add_op(OpKind::TosaCast)
        .input(value)
        .attribute("to", Attribute::Type(dtype));
    finish_named(builder, out)
}

fn const_op(
    graph: &mut TensorGraph,
    dims: Vec<i64>,
    data: ConstData,
    stem: &str,
) -> Result<(NodeId, String)> {
    let out = graph.fresh_name(stem);
    let builder = graph
        .add_op(OpKind::TosaConst)
        .attribute("value", Attribute::Tensor { dims, data });
    finish_named(builder, out)
}

/// Append an all-zero rank-1 constant, used as a synthesized bias
pub fn zero_bias(graph: &mut TensorGraph, dtype: DType, len: i64) -> Result<(NodeId, String)> {
    let data = splat_const(dtype, len as usize, 0.0)?;
    const_op(graph, vec![len], data, "bias")
}

/// Append a single-element constant holding `value` in the given element type
pub fn scalar_const(
    graph: &mut TensorGraph,
    dtype: DType,
    value: f64,
) -> Result<(NodeId, String)> {
    let data = splat_const(dtype, 1, value)?;
    const_op(graph, vec![1], data, "const")
}

fn splat_const(dtype: DType, n: usize, value: f64) -> Result<ConstData> {
    ConstData::splat(dtype, n, value).ok_or(LowerError::InvalidAttribute {
        kind: OpKind::TosaConst,
        name: "value",
        reason: format!("no constant payload for {}", dtype),
    })
}
