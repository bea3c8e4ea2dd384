//! Backend-agnostic instruction encoding traits
//!
//! Defines the `MacroAssembler` primitives the code generator emits through,
//! and the `CodegenBackend` trait that pluggable backends implement.

use crate::bytecode::MethodId;
use crate::reloc::{PendingRelocation, RelocTarget};
use crate::target::{Reg, TargetInfo};

/// Operand width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

/// Register or immediate source operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
}

/// Memory operand `[base + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
}

impl Mem {
    pub fn new(base: Reg, disp: i32) -> Self {
        Mem { base, disp }
    }
}

/// Branch and trap conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    /// Unsigned `>=`
    AboveEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Three-way comparison producing -1, 0 or 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    Long,
    Float,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    IntToLong,
    LongToInt,
    IntToFloat,
    FloatToInt,
    IntToDouble,
    DoubleToInt,
}

/// Well-known runtime helper functions that compiled code calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHelper {
    AllocObject,
    AllocArray,
    Throw,
    NullPointer,
    ArrayBounds,
    DivideByZero,
    SafepointPoll,
}

/// Call destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Method(MethodId),
    Helper(RuntimeHelper),
}

/// Instruction-encoding primitives
///
/// Every reference to a bytecode PC is emitted as a placeholder field and
/// recorded as a pending relocation, drained with [`take_relocations`].
///
/// [`take_relocations`]: MacroAssembler::take_relocations
pub trait MacroAssembler {
    /// Current offset in the scratch buffer
    fn offset(&self) -> u32;

    /// Bytes emitted so far
    fn code(&self) -> &[u8];

    fn nop(&mut self);
    fn mov(&mut self, width: Width, dst: Reg, src: Reg);
    /// Load raw immediate bits; float registers receive the bit pattern
    fn mov_imm(&mut self, width: Width, dst: Reg, imm: i64);
    fn load(&mut self, width: Width, dst: Reg, src: Mem);
    fn store(&mut self, width: Width, dst: Mem, src: Reg);
    fn int_op(&mut self, op: IntOp, width: Width, dst: Reg, lhs: Reg, rhs: Operand);
    fn neg(&mut self, width: Width, dst: Reg, src: Reg);
    fn float_op(&mut self, op: FloatOp, width: Width, dst: Reg, lhs: Reg, rhs: Reg);
    fn compare(&mut self, kind: CompareKind, dst: Reg, lhs: Reg, rhs: Reg);
    fn convert(&mut self, conversion: Conversion, dst: Reg, src: Reg);

    fn branch_if(&mut self, cond: Cond, width: Width, lhs: Reg, rhs: Operand, target: RelocTarget);
    fn jump(&mut self, target: RelocTarget);
    fn jump_indirect(&mut self, target: Reg);
    /// Jump through entry `index` of a pointer-sized table
    fn jump_table(&mut self, index: Reg, table: RelocTarget);
    /// Materialize the address of a code location
    fn load_address(&mut self, dst: Reg, target: RelocTarget);

    fn call(&mut self, target: CallTarget);
    /// Call `helper` when the comparison holds
    fn trap_if(&mut self, cond: Cond, width: Width, lhs: Reg, rhs: Operand, helper: RuntimeHelper);
    /// Safepoint poll
    fn poll(&mut self);

    /// Establish the frame and reserve `frame_size` bytes below the frame base
    fn enter(&mut self, frame_size: u32);
    fn leave(&mut self);
    fn ret(&mut self);
    /// Verify the distance between frame base and stack pointer
    fn check_frame(&mut self, frame_size: u32);

    fn take_relocations(&mut self) -> Vec<PendingRelocation>;

    /// Consume the assembler, returning the scratch buffer
    fn finish(self) -> Vec<u8>
    where
        Self: Sized;
}

/// The backend-agnostic code generation trait
///
/// Backends hand out one assembler per compilation; the driver emits every
/// block of a method through it.
pub trait CodegenBackend: Send + Sync {
    type Assembler: MacroAssembler;

    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Return target information
    fn target_info(&self) -> &TargetInfo;

    /// Create an empty assembler
    fn assembler(&self) -> Self::Assembler;
}
