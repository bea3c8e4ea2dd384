//! Compilation errors
//!
//! Every externally triggerable failure surfaces as a [`JitError`]. Broken
//! internal invariants panic instead.

use crate::analysis::DecodeError;
use crate::bytecode::ResolveError;
use crate::runtime::AllocError;

/// Errors from the compilation pipeline
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Resolution failure: {0}")]
    Resolution(#[from] ResolveError),
    #[error("Allocation failure: {0}")]
    Allocation(#[from] AllocError),
    #[error("Malformed bytecode at pc {pc}: {reason}")]
    Malformed { pc: u32, reason: String },
}

impl JitError {
    pub(crate) fn malformed(pc: u32, reason: impl Into<String>) -> Self {
        JitError::Malformed {
            pc,
            reason: reason.into(),
        }
    }
}
