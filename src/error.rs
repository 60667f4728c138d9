//! Error types for the lowering pipeline
//!
//! Failures fall into two classes that callers treat differently:
//!
//! - **Unsupported**: a rule recognized its operation but the configuration
//!   falls outside what the target vocabulary can express. The graph is left
//!   untouched and the caller may keep the operation or try another strategy.
//! - Everything else is a violated precondition: malformed attributes,
//!   inconsistent shapes, dangling value names. These indicate a broken input
//!   graph or a bug in a rewrite, not a lowering limitation.

use crate::ops::OpKind;
use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, LowerError>;

/// All errors produced by graph construction, inference, and rewriting
#[derive(Debug, Error)]
pub enum LowerError {
    /// A rule matched its operation but cannot express it in the target
    /// vocabulary
    #[error("{rule}: unsupported configuration: {reason}")]
    Unsupported { rule: String, reason: String },

    /// A required attribute is absent
    #[error("{kind}: missing required attribute '{name}'")]
    MissingAttribute { kind: OpKind, name: &'static str },

    /// An attribute is present but malformed
    #[error("{kind}: invalid attribute '{name}': {reason}")]
    InvalidAttribute {
        kind: OpKind,
        name: &'static str,
        reason: String,
    },

    /// Operand types do not admit a result type for the operation
    #[error("{kind}: shape inference failed: {reason}")]
    ShapeMismatch { kind: OpKind, reason: String },

    /// A value name with no producer and no boundary declaration
    #[error("unknown value '{0}'")]
    UnknownValue(String),

    /// A value name that already has a producer or boundary declaration
    #[error("value '{0}' already defined")]
    DuplicateValue(String),

    /// Structural graph violation (cycle, dangling node, bad operand index)
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

impl LowerError {
    /// Shorthand for the reportable "cannot lower this configuration" class
    pub fn unsupported(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        LowerError::Unsupported {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// Whether this is the reportable class rather than a precondition
    /// violation
    pub fn is_unsupported(&self) -> bool {
        matches!(self, LowerError::Unsupported { .. })
    }
}
