//! Operation vocabulary
//!
//! A closed set of operation kinds across the two dialects the engine works
//! with:
//!
//! - **Graph dialect**: the high-level source operations rewrite rules match on
//! - **Tosa dialect**: the accelerator-style target operations rules emit
//!
//! Keeping the vocabulary closed means adding an operation is a compile-time
//! event: every `match` over `OpKind` is checked exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which vocabulary an operation kind belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// High-level source operations
    Graph,
    /// Accelerator-style target operations
    Tosa,
}

/// Every operation kind the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    // Source operations
    Convolution,
    Broadcast,
    MultiBroadcast,
    Dot,
    Softmax,
    Reshape,
    ReduceMean,
    QuantizeLinear,

    // Target operations
    TosaConv2d,
    TosaTranspose,
    TosaReshape,
    TosaMatMul,
    TosaReduceMax,
    TosaReduceSum,
    TosaSub,
    TosaExp,
    TosaReciprocal,
    TosaMul,
    TosaAdd,
    TosaCast,
    TosaConst,
}

impl OpKind {
    /// Dialect this kind belongs to
    pub fn dialect(&self) -> Dialect {
        match self {
            OpKind::Convolution
            | OpKind::Broadcast
            | OpKind::MultiBroadcast
            | OpKind::Dot
            | OpKind::Softmax
            | OpKind::Reshape
            | OpKind::ReduceMean
            | OpKind::QuantizeLinear => Dialect::Graph,
            OpKind::TosaConv2d
            | OpKind::TosaTranspose
            | OpKind::TosaReshape
            | OpKind::TosaMatMul
            | OpKind::TosaReduceMax
            | OpKind::TosaReduceSum
            | OpKind::TosaSub
            | OpKind::TosaExp
            | OpKind::TosaReciprocal
            | OpKind::TosaMul
            | OpKind::TosaAdd
            | OpKind::TosaCast
            | OpKind::TosaConst => Dialect::Tosa,
        }
    }

    /// Canonical printed name, qualified by dialect for target operations
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Convolution => "convolution",
            OpKind::Broadcast => "broadcast",
            OpKind::MultiBroadcast => "multibroadcast",
            OpKind::Dot => "dot",
            OpKind::Softmax => "softmax",
            OpKind::Reshape => "reshape",
            OpKind::ReduceMean => "reduce_mean",
            OpKind::QuantizeLinear => "quantizelinear",
            OpKind::TosaConv2d => "tosa.conv2d",
            OpKind::TosaTranspose => "tosa.transpose",
            OpKind::TosaReshape => "tosa.reshape",
            OpKind::TosaMatMul => "tosa.matmul",
            OpKind::TosaReduceMax => "tosa.reduce_max",
            OpKind::TosaReduceSum => "tosa.reduce_sum",
            OpKind::TosaSub => "tosa.sub",
            OpKind::TosaExp => "tosa.exp",
            OpKind::TosaReciprocal => "tosa.reciprocal",
            OpKind::TosaMul => "tosa.mul",
            OpKind::TosaAdd => "tosa.add",
            OpKind::TosaCast => "tosa.cast",
            OpKind::TosaConst => "tosa.const",
        }
    }

    /// Target binary operations with implicit broadcast on the second operand
    pub fn is_elementwise_binary(&self) -> bool {
        matches!(self, OpKind::TosaAdd | OpKind::TosaSub | OpKind::TosaMul)
    }

    /// Binary operations whose operands may be swapped without changing the
    /// result
    pub fn is_commutative(&self) -> bool {
        matches!(self, OpKind::TosaAdd | OpKind::TosaMul)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
