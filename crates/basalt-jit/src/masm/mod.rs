//! Code generation backends
//!
//! The code generator emits through the [`MacroAssembler`] trait; the
//! portable backend is the reference encoder.

pub mod portable;
pub mod traits;

pub use portable::{PortableAssembler, PortableBackend};
pub use traits::{
    CallTarget, CodegenBackend, CompareKind, Cond, Conversion, FloatOp, IntOp, MacroAssembler,
    Mem, Operand, RuntimeHelper, Width,
};
