//! Portable reference backend
//!
//! Encodes every primitive as a tag byte followed by its operands in
//! little-endian order. The encoding is stable and self-describing, so it can
//! be replayed by an interpreter or checked byte-for-byte in tests.

use crate::reloc::{PendingRelocation, RelocKind, RelocTarget};
use crate::target::{Reg, TargetInfo};

use super::traits::*;

/// Instruction tags
pub mod tag {
    pub const NOP: u8 = 0x00;
    pub const MOV: u8 = 0x01;
    pub const MOV_IMM: u8 = 0x02;
    pub const LOAD: u8 = 0x03;
    pub const STORE: u8 = 0x04;
    pub const INT_OP: u8 = 0x05;
    pub const NEG: u8 = 0x06;
    pub const FLOAT_OP: u8 = 0x07;
    pub const COMPARE: u8 = 0x08;
    pub const CONVERT: u8 = 0x09;
    pub const BRANCH_IF: u8 = 0x10;
    pub const JUMP: u8 = 0x11;
    pub const JUMP_INDIRECT: u8 = 0x12;
    pub const JUMP_TABLE: u8 = 0x13;
    pub const LOAD_ADDRESS: u8 = 0x14;
    pub const CALL: u8 = 0x20;
    pub const TRAP_IF: u8 = 0x21;
    pub const POLL: u8 = 0x22;
    pub const ENTER: u8 = 0x30;
    pub const LEAVE: u8 = 0x31;
    pub const RET: u8 = 0x32;
    pub const CHECK_FRAME: u8 = 0x33;
}

/// Portable backend producing tag-encoded code
#[derive(Debug, Clone)]
pub struct PortableBackend {
    target: TargetInfo,
}

impl PortableBackend {
    pub fn new(target: TargetInfo) -> Self {
        PortableBackend { target }
    }

    /// 64-bit portable target
    pub fn portable64() -> Self {
        Self::new(TargetInfo::portable64())
    }
}

impl Default for PortableBackend {
    fn default() -> Self {
        Self::portable64()
    }
}

impl CodegenBackend for PortableBackend {
    type Assembler = PortableAssembler;

    fn name(&self) -> &str {
        "portable"
    }

    fn target_info(&self) -> &TargetInfo {
        &self.target
    }

    fn assembler(&self) -> PortableAssembler {
        PortableAssembler::new()
    }
}

/// Tag-encoding assembler
#[derive(Debug, Default)]
pub struct PortableAssembler {
    buf: Vec<u8>,
    relocs: Vec<PendingRelocation>,
}

impl PortableAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn reg(&mut self, reg: Reg) {
        let float_bit = if reg.is_float() { 0x80 } else { 0 };
        self.byte(reg.num | float_bit);
    }

    fn width(&mut self, width: Width) {
        self.byte(match width {
            Width::W32 => 0,
            Width::W64 => 1,
        });
    }

    fn mem(&mut self, mem: Mem) {
        self.reg(mem.base);
        self.buf.extend_from_slice(&mem.disp.to_le_bytes());
    }

    fn operand(&mut self, operand: Operand) {
        match operand {
            Operand::Reg(reg) => {
                self.byte(0);
                self.reg(reg);
            }
            Operand::Imm(imm) => {
                self.byte(1);
                self.buf.extend_from_slice(&imm.to_le_bytes());
            }
        }
    }

    fn cond(&mut self, cond: Cond) {
        self.byte(match cond {
            Cond::Eq => 0,
            Cond::Ne => 1,
            Cond::Lt => 2,
            Cond::Ge => 3,
            Cond::Gt => 4,
            Cond::Le => 5,
            Cond::AboveEq => 6,
        });
    }

    fn helper(&mut self, helper: RuntimeHelper) {
        self.byte(match helper {
            RuntimeHelper::AllocObject => 0,
            RuntimeHelper::AllocArray => 1,
            RuntimeHelper::Throw => 2,
            RuntimeHelper::NullPointer => 3,
            RuntimeHelper::ArrayBounds => 4,
            RuntimeHelper::DivideByZero => 5,
            RuntimeHelper::SafepointPoll => 6,
        });
    }

    /// Emit a zeroed relocation field and record it
    fn field(&mut self, kind: RelocKind, target: RelocTarget) {
        let offset = self.offset();
        self.relocs.push(PendingRelocation::new(offset, kind, target));
        self.buf.resize(self.buf.len() + kind.field_size(), 0);
    }
}

impl MacroAssembler for PortableAssembler {
    fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    fn code(&self) -> &[u8] {
        &self.buf
    }

    fn nop(&mut self) {
        self.byte(tag::NOP);
    }

    fn mov(&mut self, width: Width, dst: Reg, src: Reg) {
        self.byte(tag::MOV);
        self.width(width);
        self.reg(dst);
        self.reg(src);
    }

    fn mov_imm(&mut self, width: Width, dst: Reg, imm: i64) {
        self.byte(tag::MOV_IMM);
        self.width(width);
        self.reg(dst);
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    fn load(&mut self, width: Width, dst: Reg, src: Mem) {
        self.byte(tag::LOAD);
        self.width(width);
        self.reg(dst);
        self.mem(src);
    }

    fn store(&mut self, width: Width, dst: Mem, src: Reg) {
        self.byte(tag::STORE);
        self.width(width);
        self.mem(dst);
        self.reg(src);
    }

    fn int_op(&mut self, op: IntOp, width: Width, dst: Reg, lhs: Reg, rhs: Operand) {
        self.byte(tag::INT_OP);
        self.byte(op as u8);
        self.width(width);
        self.reg(dst);
        self.reg(lhs);
        self.operand(rhs);
    }

    fn neg(&mut self, width: Width, dst: Reg, src: Reg) {
        self.byte(tag::NEG);
        self.width(width);
        self.reg(dst);
        self.reg(src);
    }

    fn float_op(&mut self, op: FloatOp, width: Width, dst: Reg, lhs: Reg, rhs: Reg) {
        self.byte(tag::FLOAT_OP);
        self.byte(op as u8);
        self.width(width);
        self.reg(dst);
        self.reg(lhs);
        self.reg(rhs);
    }

    fn compare(&mut self, kind: CompareKind, dst: Reg, lhs: Reg, rhs: Reg) {
        self.byte(tag::COMPARE);
        self.byte(kind as u8);
        self.reg(dst);
        self.reg(lhs);
        self.reg(rhs);
    }

    fn convert(&mut self, conversion: Conversion, dst: Reg, src: Reg) {
        self.byte(tag::CONVERT);
        self.byte(conversion as u8);
        self.reg(dst);
        self.reg(src);
    }

    fn branch_if(&mut self, cond: Cond, width: Width, lhs: Reg, rhs: Operand, target: RelocTarget) {
        self.byte(tag::BRANCH_IF);
        self.cond(cond);
        self.width(width);
        self.reg(lhs);
        self.operand(rhs);
        self.field(RelocKind::PcRel32, target);
    }

    fn jump(&mut self, target: RelocTarget) {
        self.byte(tag::JUMP);
        self.field(RelocKind::PcRel32, target);
    }

    fn jump_indirect(&mut self, target: Reg) {
        self.byte(tag::JUMP_INDIRECT);
        self.reg(target);
    }

    fn jump_table(&mut self, index: Reg, table: RelocTarget) {
        self.byte(tag::JUMP_TABLE);
        self.reg(index);
        self.field(RelocKind::Abs64, table);
    }

    fn load_address(&mut self, dst: Reg, target: RelocTarget) {
        self.byte(tag::LOAD_ADDRESS);
        self.reg(dst);
        self.field(RelocKind::Abs64, target);
    }

    fn call(&mut self, target: CallTarget) {
        self.byte(tag::CALL);
        match target {
            CallTarget::Method(id) => {
                self.byte(0);
                self.buf.extend_from_slice(&id.0.to_le_bytes());
            }
            CallTarget::Helper(helper) => {
                self.byte(1);
                self.helper(helper);
            }
        }
    }

    fn trap_if(&mut self, cond: Cond, width: Width, lhs: Reg, rhs: Operand, helper: RuntimeHelper) {
        self.byte(tag::TRAP_IF);
        self.cond(cond);
        self.width(width);
        self.reg(lhs);
        self.operand(rhs);
        self.helper(helper);
    }

    fn poll(&mut self) {
        self.byte(tag::POLL);
    }

    fn enter(&mut self, frame_size: u32) {
        self.byte(tag::ENTER);
        self.u32(frame_size);
    }

    fn leave(&mut self) {
        self.byte(tag::LEAVE);
    }

    fn ret(&mut self) {
        self.byte(tag::RET);
    }

    fn check_frame(&mut self, frame_size: u32) {
        self.byte(tag::CHECK_FRAME);
        self.u32(frame_size);
    }

    fn take_relocations(&mut self) -> Vec<PendingRelocation> {
        std::mem::take(&mut self.relocs)
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}
