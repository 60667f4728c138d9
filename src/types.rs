//! Shared data types for the lowering pipeline
//!
//! This module defines the typed surface every other component builds on:
//!
//! - **DType**: closed element-type set (floating point and integer widths)
//! - **TensorType**: static shape plus element type carried by every value
//! - **ConstData**: typed payloads for constant operations
//! - **Attribute**: closed attribute-value set attached to operations
//! - **QuantizationInfo**: zero-point annotation for quantized convolutions
//! - **ValueInfo**: declared graph boundary values

use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    I8,
    Bool,
}

impl DType {
    /// Whether this is a floating-point type
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }

    /// Whether this is an integer type (excluding Bool)
    pub fn is_int(&self) -> bool {
        matches!(self, DType::I64 | DType::I32 | DType::I8)
    }

    /// Bit width of the element type
    pub fn bit_width(&self) -> u32 {
        match self {
            DType::F32 => 32,
            DType::F16 => 16,
            DType::I64 => 64,
            DType::I32 => 32,
            DType::I8 => 8,
            DType::Bool => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::I8 => "i8",
            DType::Bool => "bool",
        };
        write!(f, "{}", name)
    }
}

/// Static tensor type: ordered extents plus element type
///
/// Extents are non-negative; `-1` marks a dynamic extent, which every rule
/// requiring concrete dimension algebra rejects as a precondition violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dims: Vec<i64>,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(dims: Vec<i64>, dtype: DType) -> Self {
        Self { dims, dtype }
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Product of all extents (1 for rank 0)
    pub fn num_elements(&self) -> i64 {
        self.dims.iter().product()
    }

    /// Whether every extent is concrete (no dynamic markers)
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|&d| d >= 0)
    }

    /// Same element type, different extents
    pub fn with_dims(&self, dims: Vec<i64>) -> Self {
        Self {
            dims,
            dtype: self.dtype,
        }
    }

    /// Same extents, different element type
    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dims: self.dims.clone(),
            dtype,
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.dims {
            write!(f, "{}x", d)?;
        }
        write!(f, "{}", self.dtype)
    }
}

/// Typed payload of a constant operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    I8(Vec<i8>),
}

impl ConstData {
    /// Element type of the payload
    pub fn dtype(&self) -> DType {
        match self {
            ConstData::F32(_) => DType::F32,
            ConstData::F16(_) => DType::F16,
            ConstData::I64(_) => DType::I64,
            ConstData::I32(_) => DType::I32,
            ConstData::I8(_) => DType::I8,
        }
    }

    /// Number of stored elements
    pub fn len(&self) -> usize {
        match self {
            ConstData::F32(v) => v.len(),
            ConstData::F16(v) => v.len(),
            ConstData::I64(v) => v.len(),
            ConstData::I32(v) => v.len(),
            ConstData::I8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a payload of `n` copies of `value` in the requested element type.
    ///
    /// Returns `None` for element types without a constant payload
    /// representation (Bool).
    pub fn splat(dtype: DType, n: usize, value: f64) -> Option<Self> {
        match dtype {
            DType::F32 => Some(ConstData::F32(vec![value as f32; n])),
            DType::F16 => Some(ConstData::F16(vec![f16::from_f64(value); n])),
            DType::I64 => Some(ConstData::I64(vec![value as i64; n])),
            DType::I32 => Some(ConstData::I32(vec![value as i32; n])),
            DType::I8 => Some(ConstData::I8(vec![value as i8; n])),
            DType::Bool => None,
        }
    }

    /// Whether every stored element equals one.
    ///
    /// Used to recognize unit scale factors that make a multiply redundant.
    pub fn is_splat_one(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        match self {
            ConstData::F32(v) => v.iter().all(|&x| x == 1.0),
            ConstData::F16(v) => v.iter().all(|&x| x == f16::ONE),
            ConstData::I64(v) => v.iter().all(|&x| x == 1),
            ConstData::I32(v) => v.iter().all(|&x| x == 1),
            ConstData::I8(v) => v.iter().all(|&x| x == 1),
        }
    }
}

/// Zero-point annotation attached to quantized convolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub input_zp: i32,
    pub weight_zp: i32,
}

/// Attribute value attached to an operation under a name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Bool(bool),
    Str(String),
    Type(DType),
    Tensor { dims: Vec<i64>, data: ConstData },
    Quantization(QuantizationInfo),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attribute::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Attribute::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attribute::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<DType> {
        match self {
            Attribute::Type(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<(&[i64], &ConstData)> {
        match self {
            Attribute::Tensor { dims, data } => Some((dims, data)),
            _ => None,
        }
    }

    pub fn as_quantization(&self) -> Option<&QuantizationInfo> {
        match self {
            Attribute::Quantization(q) => Some(q),
            _ => None,
        }
    }
}

/// A declared graph boundary value (input or output signature entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub ty: TensorType,
}

impl ValueInfo {
    pub fn new(name: impl Into<String>, ty: TensorType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}
