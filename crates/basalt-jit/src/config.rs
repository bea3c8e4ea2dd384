//! JIT configuration
//!
//! The configuration reaches the compiler already resolved; it can be
//! deserialized from any serde format the embedding runtime uses.

use serde::{Deserialize, Serialize};

/// Configuration for the baseline compiler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Emit a safepoint poll on every backward branch (default: true)
    pub backedge_polls: bool,
    /// Emit frame consistency checks at block entries and verify the
    /// canonical operand stack at block exits (default: false)
    pub debug_checks: bool,
    /// Instrumentation mode: no register allocation, and every instruction
    /// occupies at least one byte of native code (default: false)
    pub instrumentation: bool,
    /// Log every sealed block at trace level (default: false)
    pub trace_codegen: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            backedge_polls: true,
            debug_checks: false,
            instrumentation: false,
            trace_codegen: false,
        }
    }
}

impl JitConfig {
    /// Configuration used when the runtime attaches an instrumenting tool
    pub fn instrumented() -> Self {
        JitConfig {
            instrumentation: true,
            ..JitConfig::default()
        }
    }
}
