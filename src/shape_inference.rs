//! Shape and type inference
//!
//! A pure oracle that derives the result type of any operation from its kind,
//! attributes, and operand types. The graph builder consults it once per
//! constructed operation, so a type stamped on a value is the inferred type by
//! construction. [`ShapeInference::verify`] re-derives every type from the
//! boundary inputs and checks the stamps still agree, which is how tests pin
//! down that rewrites preserve consistency.
//!
//! Inference is total over both dialects and never touches the graph: given
//! the same inputs it always produces the same answer or the same error.

use crate::error::{LowerError, Result};
use crate::graph::ir::TensorGraph;
use crate::ops::OpKind;
use crate::types::{Attribute, ConstData, DType, TensorType};
use ahash::AHashMap;
use tracing::{debug, warn};

/// Numpy-style two-sided shape broadcasting.
///
/// Aligns the shapes at their trailing dimensions and widens size-1 extents.
/// Returns `None` when some aligned pair disagrees with both sides larger
/// than one.
pub fn broadcast_shapes(a: &[i64], b: &[i64]) -> Option<Vec<i64>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = dim_or_one(a, rank, i);
        let db = dim_or_one(b, rank, i);
        if da == db || db == 1 {
            out.push(da);
        } else if da == 1 {
            out.push(db);
        } else {
            return None;
        }
    }
    Some(out)
}

fn dim_or_one(dims: &[i64], rank: usize, i: usize) -> i64 {
    let offset = rank - dims.len();
    if i < offset {
        1
    } else {
        dims[i - offset]
    }
}

/// Whether `rhs` may sit in the broadcasting operand position of a target
/// binary operation with `lhs` fixed.
///
/// Only the second operand broadcasts: `rhs` must not out-rank `lhs`, and
/// every trailing-aligned extent must match `lhs` exactly or be 1.
pub fn rhs_broadcastable(lhs: &[i64], rhs: &[i64]) -> bool {
    if rhs.len() > lhs.len() {
        return false;
    }
    let offset = lhs.len() - rhs.len();
    rhs.iter()
        .enumerate()
        .all(|(i, &r)| r == 1 || r == lhs[offset + i])
}

// ---------------------------------------------------------------------------
// Attribute lookup
// ---------------------------------------------------------------------------

fn find_attr<'a>(attrs: &'a [(String, Attribute)], name: &str) -> Option<&'a Attribute> {
    attrs.iter().find(|(n, _)| n == name).map(|(_, a)| a)
}

fn require_int(kind: OpKind, attrs: &[(String, Attribute)], name: &'static str) -> Result<i64> {
    find_attr(attrs, name)
        .ok_or(LowerError::MissingAttribute { kind, name })?
        .as_int()
        .ok_or_else(|| LowerError::InvalidAttribute {
            kind,
            name,
            reason: "expected an integer".into(),
        })
}

fn require_ints<'a>(
    kind: OpKind,
    attrs: &'a [(String, Attribute)],
    name: &'static str,
) -> Result<&'a [i64]> {
    find_attr(attrs, name)
        .ok_or(LowerError::MissingAttribute { kind, name })?
        .as_ints()
        .ok_or_else(|| LowerError::InvalidAttribute {
            kind,
            name,
            reason: "expected an integer list".into(),
        })
}

fn require_ints_of_len<'a>(
    kind: OpKind,
    attrs: &'a [(String, Attribute)],
    name: &'static str,
    len: usize,
) -> Result<&'a [i64]> {
    let values = require_ints(kind, attrs, name)?;
    if values.len() != len {
        return Err(LowerError::InvalidAttribute {
            kind,
            name,
            reason: format!("expected {} entries, got {}", len, values.len()),
        });
    }
    Ok(values)
}

fn require_type(kind: OpKind, attrs: &[(String, Attribute)], name: &'static str) -> Result<DType> {
    find_attr(attrs, name)
        .ok_or(LowerError::MissingAttribute { kind, name })?
        .as_type()
        .ok_or_else(|| LowerError::InvalidAttribute {
            kind,
            name,
            reason: "expected an element type".into(),
        })
}

fn require_tensor<'a>(
    kind: OpKind,
    attrs: &'a [(String, Attribute)],
    name: &'static str,
) -> Result<(&'a [i64], &'a ConstData)> {
    find_attr(attrs, name)
        .ok_or(LowerError::MissingAttribute { kind, name })?
        .as_tensor()
        .ok_or_else(|| LowerError::InvalidAttribute {
            kind,
            name,
            reason: "expected a tensor literal".into(),
        })
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

fn expect_inputs(kind: OpKind, inputs: &[TensorType], n: usize) -> Result<()> {
    if inputs.len() != n {
        return Err(LowerError::ShapeMismatch {
            kind,
            reason: format!("expected {} operands, got {}", n, inputs.len()),
        });
    }
    Ok(())
}

fn expect_rank(kind: OpKind, ty: &TensorType, rank: usize, what: &str) -> Result<()> {
    if ty.rank() != rank {
        return Err(LowerError::ShapeMismatch {
            kind,
            reason: format!("{} must have rank {}, got {}", what, rank, ty),
        });
    }
    Ok(())
}

fn expect_same_dtype(kind: OpKind, a: &TensorType, b: &TensorType) -> Result<()> {
    if a.dtype != b.dtype {
        return Err(LowerError::ShapeMismatch {
            kind,
            reason: format!("element types differ: {} vs {}", a.dtype, b.dtype),
        });
    }
    Ok(())
}

fn check_axis(kind: OpKind, name: &'static str, axis: i64, rank: usize) -> Result<usize> {
    if axis < 0 || axis as usize >= rank {
        return Err(LowerError::InvalidAttribute {
            kind,
            name,
            reason: format!("axis {} out of range for rank {}", axis, rank),
        });
    }
    Ok(axis as usize)
}

/// Output extent of one spatial dimension of a convolution
fn conv_out_extent(
    kind: OpKind,
    what: &str,
    input: i64,
    kernel: i64,
    pad_before: i64,
    pad_after: i64,
    stride: i64,
    dilation: i64,
) -> Result<i64> {
    if stride <= 0 || dilation <= 0 {
        return Err(LowerError::ShapeMismatch {
            kind,
            reason: format!("{}: stride and dilation must be positive", what),
        });
    }
    let span = input + pad_before + pad_after - dilation * (kernel - 1) - 1;
    if span < 0 {
        return Err(LowerError::ShapeMismatch {
            kind,
            reason: format!(
                "{}: kernel {} with dilation {} exceeds padded extent {}",
                what,
                kernel,
                dilation,
                input + pad_before + pad_after
            ),
        });
    }
    Ok(span / stride + 1)
}

/// Result type of a target binary operation.
///
/// Ranks need not match, but any broadcasting is carried by the second
/// operand alone; the first operand's extents are authoritative.
fn infer_elementwise(kind: OpKind, a: &TensorType, b: &TensorType) -> Result<TensorType> {
    expect_same_dtype(kind, a, b)?;
    if !rhs_broadcastable(&a.dims, &b.dims) {
        return Err(LowerError::ShapeMismatch {
            kind,
            reason: format!(
                "cannot broadcast {} against {}: only the second operand broadcasts",
                b, a
            ),
        });
    }
    Ok(a.clone())
}

fn infer_reduce(
    kind: OpKind,
    attrs: &[(String, Attribute)],
    input: &TensorType,
) -> Result<TensorType> {
    let axis = require_int(kind, attrs, "axis")?;
    let axis = check_axis(kind, "axis", axis, input.rank())?;
    let mut dims = input.dims.clone();
    dims[axis] = 1;
    Ok(input.with_dims(dims))
}

fn check_new_shape(kind: OpKind, name: &'static str, input: &TensorType, shape: &[i64]) -> Result<()> {
    if shape.iter().any(|&d| d < 1) {
        return Err(LowerError::InvalidAttribute {
            kind,
            name,
            reason: format!("extents must be positive, got {:?}", shape),
        });
    }
    let elements: i64 = shape.iter().product();
    if elements != input.num_elements() {
        return Err(LowerError::ShapeMismatch {
            kind,
            reason: format!(
                "cannot reshape {} ({} elements) to {:?} ({} elements)",
                input,
                input.num_elements(),
                shape,
                elements
            ),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The oracle
// ---------------------------------------------------------------------------

/// Derive the result type of an operation from its kind, attributes, and
/// operand types.
///
/// # Arguments
/// * `kind` - operation kind from either dialect
/// * `attrs` - named attributes in declaration order
/// * `inputs` - operand types in operand order
///
/// # Returns
/// The single result type, or an error describing the violated precondition.
pub fn infer_op(
    kind: OpKind,
    attrs: &[(String, Attribute)],
    inputs: &[TensorType],
) -> Result<TensorType> {
    for ty in inputs {
        if !ty.is_static() {
            return Err(LowerError::ShapeMismatch {
                kind,
                reason: format!("dynamic extents are not supported: {}", ty),
            });
        }
    }

    match kind {
        OpKind::Convolution => {
            if inputs.len() < 2 || inputs.len() > 3 {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!("expected 2 or 3 operands, got {}", inputs.len()),
                });
            }
            let (input, filter) = (&inputs[0], &inputs[1]);
            expect_rank(kind, input, 4, "input")?;
            expect_rank(kind, filter, 4, "filter")?;
            expect_same_dtype(kind, input, filter)?;
            if input.dims[1] != filter.dims[1] {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!(
                        "input channels {} do not match filter channels {}",
                        input.dims[1], filter.dims[1]
                    ),
                });
            }
            if let Some(bias) = inputs.get(2) {
                expect_rank(kind, bias, 1, "bias")?;
                expect_same_dtype(kind, input, bias)?;
                if bias.dims[0] != filter.dims[0] {
                    return Err(LowerError::ShapeMismatch {
                        kind,
                        reason: format!(
                            "bias length {} does not match output channels {}",
                            bias.dims[0], filter.dims[0]
                        ),
                    });
                }
            }
            let padding = require_ints_of_len(kind, attrs, "padding", 4)?;
            let stride = require_ints_of_len(kind, attrs, "stride", 2)?;
            let dilation = require_ints_of_len(kind, attrs, "dilation", 2)?;
            let oh = conv_out_extent(
                kind, "height", input.dims[2], filter.dims[2], padding[0], padding[1], stride[0],
                dilation[0],
            )?;
            let ow = conv_out_extent(
                kind, "width", input.dims[3], filter.dims[3], padding[2], padding[3], stride[1],
                dilation[1],
            )?;
            Ok(input.with_dims(vec![input.dims[0], filter.dims[0], oh, ow]))
        }

        OpKind::Broadcast => {
            expect_inputs(kind, inputs, 1)?;
            let input = &inputs[0];
            let axis = require_int(kind, attrs, "axis")?;
            let out_lens = require_ints(kind, attrs, "out_lens")?.to_vec();
            if out_lens.iter().any(|&d| d < 1) {
                return Err(LowerError::InvalidAttribute {
                    kind,
                    name: "out_lens",
                    reason: format!("extents must be positive, got {:?}", out_lens),
                });
            }
            if axis < 0 || axis as usize + input.rank() > out_lens.len() {
                return Err(LowerError::InvalidAttribute {
                    kind,
                    name: "axis",
                    reason: format!(
                        "axis {} cannot place a rank-{} input in a rank-{} result",
                        axis,
                        input.rank(),
                        out_lens.len()
                    ),
                });
            }
            for (i, &d) in input.dims.iter().enumerate() {
                let out = out_lens[axis as usize + i];
                if out != d {
                    return Err(LowerError::ShapeMismatch {
                        kind,
                        reason: format!(
                            "input extent {} at axis {} does not match result extent {}",
                            d,
                            axis as usize + i,
                            out
                        ),
                    });
                }
            }
            Ok(input.with_dims(out_lens))
        }

        OpKind::MultiBroadcast => {
            expect_inputs(kind, inputs, 1)?;
            let input = &inputs[0];
            let out_lens = require_ints(kind, attrs, "out_lens")?.to_vec();
            if out_lens.iter().any(|&d| d < 1) {
                return Err(LowerError::InvalidAttribute {
                    kind,
                    name: "out_lens",
                    reason: format!("extents must be positive, got {:?}", out_lens),
                });
            }
            if out_lens.len() < input.rank() {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!(
                        "result rank {} below input rank {}",
                        out_lens.len(),
                        input.rank()
                    ),
                });
            }
            let offset = out_lens.len() - input.rank();
            for (i, &d) in input.dims.iter().enumerate() {
                let out = out_lens[offset + i];
                if d != out && d != 1 {
                    return Err(LowerError::ShapeMismatch {
                        kind,
                        reason: format!("cannot broadcast extent {} to {}", d, out),
                    });
                }
            }
            Ok(input.with_dims(out_lens))
        }

        OpKind::Dot => {
            expect_inputs(kind, inputs, 2)?;
            let (a, b) = (&inputs[0], &inputs[1]);
            expect_same_dtype(kind, a, b)?;
            if a.rank() < 2 || b.rank() < 2 {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!("operands must have rank >= 2, got {} and {}", a, b),
                });
            }
            let (ra, rb) = (a.rank(), b.rank());
            if a.dims[ra - 1] != b.dims[rb - 2] {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!(
                        "contraction extents differ: {} vs {}",
                        a.dims[ra - 1],
                        b.dims[rb - 2]
                    ),
                });
            }
            let batch = broadcast_shapes(&a.dims[..ra - 2], &b.dims[..rb - 2]).ok_or_else(|| {
                LowerError::ShapeMismatch {
                    kind,
                    reason: format!(
                        "batch extents {:?} and {:?} do not broadcast",
                        &a.dims[..ra - 2],
                        &b.dims[..rb - 2]
                    ),
                }
            })?;
            let mut dims = batch;
            dims.push(a.dims[ra - 2]);
            dims.push(b.dims[rb - 1]);
            Ok(a.with_dims(dims))
        }

        OpKind::Softmax => {
            expect_inputs(kind, inputs, 1)?;
            let axis = require_int(kind, attrs, "axis")?;
            check_axis(kind, "axis", axis, inputs[0].rank())?;
            Ok(inputs[0].clone())
        }

        OpKind::Reshape => {
            expect_inputs(kind, inputs, 1)?;
            let dims = require_ints(kind, attrs, "dims")?.to_vec();
            check_new_shape(kind, "dims", &inputs[0], &dims)?;
            Ok(inputs[0].with_dims(dims))
        }

        OpKind::ReduceMean => {
            expect_inputs(kind, inputs, 1)?;
            let input = &inputs[0];
            let axes = require_ints(kind, attrs, "axes")?;
            let mut dims = input.dims.clone();
            let mut seen = vec![false; input.rank()];
            for &axis in axes {
                let axis = check_axis(kind, "axes", axis, input.rank())?;
                if seen[axis] {
                    return Err(LowerError::InvalidAttribute {
                        kind,
                        name: "axes",
                        reason: format!("axis {} listed twice", axis),
                    });
                }
                seen[axis] = true;
                dims[axis] = 1;
            }
            Ok(input.with_dims(dims))
        }

        OpKind::QuantizeLinear => {
            if inputs.len() < 2 || inputs.len() > 3 {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!("expected 2 or 3 operands, got {}", inputs.len()),
                });
            }
            let (input, scale) = (&inputs[0], &inputs[1]);
            if scale.dtype != DType::F32 {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!("scale must be f32, got {}", scale.dtype),
                });
            }
            if !rhs_broadcastable(&input.dims, &scale.dims) {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!("scale {} does not broadcast over input {}", scale, input),
                });
            }
            if let Some(bias) = inputs.get(2) {
                expect_same_dtype(kind, input, bias)?;
                if !rhs_broadcastable(&input.dims, &bias.dims) {
                    return Err(LowerError::ShapeMismatch {
                        kind,
                        reason: format!("bias {} does not broadcast over input {}", bias, input),
                    });
                }
            }
            Ok(input.with_dtype(DType::I8))
        }

        OpKind::TosaConv2d => {
            expect_inputs(kind, inputs, 3)?;
            let (input, filter, bias) = (&inputs[0], &inputs[1], &inputs[2]);
            expect_rank(kind, input, 4, "input")?;
            expect_rank(kind, filter, 4, "filter")?;
            expect_rank(kind, bias, 1, "bias")?;
            expect_same_dtype(kind, input, filter)?;
            expect_same_dtype(kind, input, bias)?;
            if input.dims[3] != filter.dims[3] {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!(
                        "input channels {} do not match filter channels {}",
                        input.dims[3], filter.dims[3]
                    ),
                });
            }
            if bias.dims[0] != filter.dims[0] {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!(
                        "bias length {} does not match output channels {}",
                        bias.dims[0], filter.dims[0]
                    ),
                });
            }
            let pad = require_ints_of_len(kind, attrs, "pad", 4)?;
            let stride = require_ints_of_len(kind, attrs, "stride", 2)?;
            let dilation = require_ints_of_len(kind, attrs, "dilation", 2)?;
            let oh = conv_out_extent(
                kind, "height", input.dims[1], filter.dims[1], pad[0], pad[1], stride[0],
                dilation[0],
            )?;
            let ow = conv_out_extent(
                kind, "width", input.dims[2], filter.dims[2], pad[2], pad[3], stride[1],
                dilation[1],
            )?;
            Ok(input.with_dims(vec![input.dims[0], oh, ow, filter.dims[0]]))
        }

        OpKind::TosaTranspose => {
            expect_inputs(kind, inputs, 1)?;
            let input = &inputs[0];
            let perm = require_ints(kind, attrs, "perm")?;
            if perm.len() != input.rank() {
                return Err(LowerError::InvalidAttribute {
                    kind,
                    name: "perm",
                    reason: format!(
                        "permutation length {} does not match rank {}",
                        perm.len(),
                        input.rank()
                    ),
                });
            }
            let mut sorted: Vec<i64> = perm.to_vec();
            sorted.sort_unstable();
            if sorted != (0..input.rank() as i64).collect::<Vec<_>>() {
                return Err(LowerError::InvalidAttribute {
                    kind,
                    name: "perm",
                    reason: format!("{:?} is not a permutation of 0..{}", perm, input.rank()),
                });
            }
            let dims = perm.iter().map(|&p| input.dims[p as usize]).collect();
            Ok(input.with_dims(dims))
        }

        OpKind::TosaReshape => {
            expect_inputs(kind, inputs, 1)?;
            let shape = require_ints(kind, attrs, "new_shape")?.to_vec();
            check_new_shape(kind, "new_shape", &inputs[0], &shape)?;
            Ok(inputs[0].with_dims(shape))
        }

        OpKind::TosaMatMul => {
            expect_inputs(kind, inputs, 2)?;
            let (a, b) = (&inputs[0], &inputs[1]);
            expect_rank(kind, a, 3, "first operand")?;
            expect_rank(kind, b, 3, "second operand")?;
            expect_same_dtype(kind, a, b)?;
            if a.dims[0] != b.dims[0] {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!("batch extents differ: {} vs {}", a.dims[0], b.dims[0]),
                });
            }
            if a.dims[2] != b.dims[1] {
                return Err(LowerError::ShapeMismatch {
                    kind,
                    reason: format!("contraction extents differ: {} vs {}", a.dims[2], b.dims[1]),
                });
            }
            Ok(a.with_dims(vec![a.dims[0], a.dims[1], b.dims[2]]))
        }

        OpKind::TosaReduceMax | OpKind::TosaReduceSum => {
            expect_inputs(kind, inputs, 1)?;
            infer_reduce(kind, attrs, &inputs[0])
        }

        OpKind::TosaSub | OpKind::TosaAdd | OpKind::TosaMul => {
            expect_inputs(kind, inputs, 2)?;
            infer_elementwise(kind, &inputs[0], &inputs[1])
        }

        OpKind::TosaExp | OpKind::TosaReciprocal => {
            expect_inputs(kind, inputs, 1)?;
            Ok(inputs[0].clone())
        }

        OpKind::TosaCast => {
            expect_inputs(kind, inputs, 1)?;
            let to = require_type(kind, attrs, "to")?;
            Ok(inputs[0].with_dtype(to))
        }

        OpKind::TosaConst => {
            expect_inputs(kind, inputs, 0)?;
            let (dims, data) = require_tensor(kind, attrs, "value")?;
            let elements: i64 = dims.iter().product();
            if data.len() as i64 != elements {
                return Err(LowerError::InvalidAttribute {
                    kind,
                    name: "value",
                    reason: format!(
                        "payload has {} elements, shape {:?} wants {}",
                        data.len(),
                        dims,
                        elements
                    ),
                });
            }
            Ok(TensorType::new(dims.to_vec(), data.dtype()))
        }
    }
}

// ---------------------------------------------------------------------------
// Whole-graph checking
// ---------------------------------------------------------------------------

/// Re-derives value types across a whole graph and compares them against the
/// declared ones
#[derive(Debug, Default)]
pub struct ShapeInference {
    verbose: bool,
}

impl ShapeInference {
    pub fn new() -> Self {
        Self { verbose: false }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Infer one operation, logging the result when verbose
    pub fn infer(
        &self,
        kind: OpKind,
        attrs: &[(String, Attribute)],
        inputs: &[TensorType],
    ) -> Result<TensorType> {
        let ty = infer_op(kind, attrs, inputs)?;
        if self.verbose {
            debug!(op = kind.name(), result = %ty, "inferred result type");
        }
        Ok(ty)
    }

    /// Walk the graph in topological order and derive every value type from
    /// the boundary inputs alone.
    ///
    /// # Returns
    /// A map from value name to derived type, covering boundary inputs and
    /// every operation result.
    pub fn annotate(&self, graph: &TensorGraph) -> Result<AHashMap<String, TensorType>> {
        let mut types: AHashMap<String, TensorType> = AHashMap::new();
        for info in graph.graph_inputs() {
            types.insert(info.name.clone(), info.ty.clone());
        }
        for id in graph.topological_sort()? {
            let node = graph
                .node(id)
                .ok_or_else(|| LowerError::InvalidGraph(format!("dangling node {:?}", id)))?;
            let mut input_types = Vec::with_capacity(node.input_names.len());
            for name in &node.input_names {
                let ty = types
                    .get(name)
                    .cloned()
                    .ok_or_else(|| LowerError::UnknownValue(name.clone()))?;
                input_types.push(ty);
            }
            let ty = self.infer(node.kind, &node.attributes, &input_types)?;
            for out in &node.output_names {
                types.insert(out.clone(), ty.clone());
            }
        }
        Ok(types)
    }

    /// Check that every declared value type matches what inference derives
    /// from the boundary inputs.
    pub fn verify(&self, graph: &TensorGraph) -> Result<()> {
        let derived = self.annotate(graph)?;
        for id in graph.topological_sort()? {
            let node = graph
                .node(id)
                .ok_or_else(|| LowerError::InvalidGraph(format!("dangling node {:?}", id)))?;
            for out in &node.output_names {
                let declared = graph
                    .value_type(out)
                    .ok_or_else(|| LowerError::UnknownValue(out.clone()))?;
                let inferred = derived
                    .get(out)
                    .ok_or_else(|| LowerError::UnknownValue(out.clone()))?;
                if declared != inferred {
                    warn!(
                        op = node.kind.name(),
                        value = out.as_str(),
                        declared = %declared,
                        inferred = %inferred,
                        "declared type disagrees with inference"
                    );
                    return Err(LowerError::ShapeMismatch {
                        kind: node.kind,
                        reason: format!(
                            "'{}' declared as {} but inference yields {}",
                            out, declared, inferred
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
