//! Per-instruction translation
//!
//! Stack-slot based: every operand-stack entry has a canonical frame slot.
//! Loads of locals and constants are deferred as aliases and materialized
//! into scratch registers on demand. Scratch index 0 and 1 hold operands,
//! index 2 is reserved for flushing and address arithmetic. Every terminator
//! flushes the remaining stack before transferring control.

use crate::analysis::{InstructionDescriptor, Operands, SlotType};
use crate::bytecode::{Opcode, ValueType};
use crate::error::JitError;
use crate::info::GcRoot;
use crate::masm::{
    CallTarget, CompareKind, Cond, Conversion, FloatOp, IntOp, MacroAssembler, Mem, Operand,
    RuntimeHelper, Width,
};
use crate::regalloc::Home;
use crate::reloc::RelocTarget;
use crate::target::Reg;

use super::driver::{CodeGenerator, PendingSafepoint};
use super::state::{BlockState, Location, StackValue, ValueFacts};

const OPERAND: usize = 0;
const SECOND: usize = 1;
pub(super) const FLUSH: usize = 2;

fn int_op_of(opcode: Opcode) -> Option<(IntOp, ValueType)> {
    use Opcode::*;
    let op = match opcode {
        Iadd => (IntOp::Add, ValueType::Int),
        Isub => (IntOp::Sub, ValueType::Int),
        Imul => (IntOp::Mul, ValueType::Int),
        Idiv => (IntOp::Div, ValueType::Int),
        Irem => (IntOp::Rem, ValueType::Int),
        Iand => (IntOp::And, ValueType::Int),
        Ior => (IntOp::Or, ValueType::Int),
        Ixor => (IntOp::Xor, ValueType::Int),
        Ishl => (IntOp::Shl, ValueType::Int),
        Ishr => (IntOp::Shr, ValueType::Int),
        Ladd => (IntOp::Add, ValueType::Long),
        Lsub => (IntOp::Sub, ValueType::Long),
        Lmul => (IntOp::Mul, ValueType::Long),
        _ => return None,
    };
    Some(op)
}

fn float_op_of(opcode: Opcode) -> Option<(FloatOp, ValueType)> {
    use Opcode::*;
    let op = match opcode {
        Fadd => (FloatOp::Add, ValueType::Float),
        Fsub => (FloatOp::Sub, ValueType::Float),
        Fmul => (FloatOp::Mul, ValueType::Float),
        Fdiv => (FloatOp::Div, ValueType::Float),
        Dadd => (FloatOp::Add, ValueType::Double),
        Dsub => (FloatOp::Sub, ValueType::Double),
        Dmul => (FloatOp::Mul, ValueType::Double),
        Ddiv => (FloatOp::Div, ValueType::Double),
        _ => return None,
    };
    Some(op)
}

fn conversion_of(opcode: Opcode) -> Option<(Conversion, ValueType, ValueType)> {
    use Opcode::*;
    let conv = match opcode {
        I2l => (Conversion::IntToLong, ValueType::Int, ValueType::Long),
        L2i => (Conversion::LongToInt, ValueType::Long, ValueType::Int),
        I2f => (Conversion::IntToFloat, ValueType::Int, ValueType::Float),
        F2i => (Conversion::FloatToInt, ValueType::Float, ValueType::Int),
        I2d => (Conversion::IntToDouble, ValueType::Int, ValueType::Double),
        D2i => (Conversion::DoubleToInt, ValueType::Double, ValueType::Int),
        _ => return None,
    };
    Some(conv)
}

/// Condition and operand type of a conditional branch; `unary` compares
/// against zero
fn branch_condition(opcode: Opcode) -> (Cond, ValueType, bool) {
    use Opcode::*;
    match opcode {
        Ifeq => (Cond::Eq, ValueType::Int, true),
        Ifne => (Cond::Ne, ValueType::Int, true),
        Iflt => (Cond::Lt, ValueType::Int, true),
        Ifge => (Cond::Ge, ValueType::Int, true),
        Ifgt => (Cond::Gt, ValueType::Int, true),
        Ifle => (Cond::Le, ValueType::Int, true),
        IfIcmpeq => (Cond::Eq, ValueType::Int, false),
        IfIcmpne => (Cond::Ne, ValueType::Int, false),
        IfIcmplt => (Cond::Lt, ValueType::Int, false),
        IfIcmpge => (Cond::Ge, ValueType::Int, false),
        IfIcmpgt => (Cond::Gt, ValueType::Int, false),
        IfIcmple => (Cond::Le, ValueType::Int, false),
        IfAcmpeq => (Cond::Eq, ValueType::Ref, false),
        IfAcmpne => (Cond::Ne, ValueType::Ref, false),
        Ifnull => (Cond::Eq, ValueType::Ref, true),
        Ifnonnull => (Cond::Ne, ValueType::Ref, true),
        _ => unreachable!("{opcode} is not a conditional branch"),
    }
}

fn constant(ty: ValueType, bits: i64, facts: ValueFacts) -> StackValue {
    StackValue {
        ty,
        loc: Location::Imm(bits),
        facts,
    }
}

impl<A: MacroAssembler> CodeGenerator<'_, A> {
    /// Emit native code for one instruction
    pub(super) fn translate(
        &mut self,
        instr: &InstructionDescriptor,
        state: &mut BlockState,
    ) -> Result<(), JitError> {
        use Opcode::*;
        let pc = instr.pc;
        let op = instr.opcode;

        if let Some((int_op, ty)) = int_op_of(op) {
            return self.int_arith(pc, int_op, ty, state);
        }
        if let Some((float_op, ty)) = float_op_of(op) {
            return self.float_arith(pc, float_op, ty, state);
        }
        if let Some((conv, from, to)) = conversion_of(op) {
            let value = state.pop_expect(pc, from)?;
            let src = self.materialize(&value, OPERAND, state);
            let dst = self.target.scratch(to.is_float(), OPERAND);
            self.asm.convert(conv, dst, src);
            return self.push_reg(pc, state, to, dst, ValueFacts::NONE);
        }
        if op.is_conditional_branch() {
            return self.conditional_branch(instr, state);
        }
        if op.is_return() {
            return self.method_return(instr, state);
        }

        match (op, &instr.operands) {
            (Nop, _) => {}
            (AconstNull, _) => state.push(pc, constant(ValueType::Ref, 0, ValueFacts::NULL))?,
            (Iconst0, _) => state.push(pc, constant(ValueType::Int, 0, ValueFacts::NONE))?,
            (Iconst1, _) => state.push(pc, constant(ValueType::Int, 1, ValueFacts::NONE))?,
            (Bipush | Ldc, &Operands::Int(v)) => {
                state.push(pc, constant(ValueType::Int, v as i64, ValueFacts::NONE))?
            }
            (Lconst, &Operands::Long(v)) => {
                state.push(pc, constant(ValueType::Long, v, ValueFacts::NONE))?
            }
            (Fconst, &Operands::Float(v)) => state.push(
                pc,
                constant(ValueType::Float, v.to_bits() as i64, ValueFacts::NONE),
            )?,
            (Dconst, &Operands::Double(v)) => state.push(
                pc,
                constant(ValueType::Double, v.to_bits() as i64, ValueFacts::NONE),
            )?,

            (Iload | Lload | Fload | Dload | Aload | Iload0 | Iload1 | Aload0, _) => {
                let access = self.var_access(instr);
                let facts = state.local(access.index).facts;
                state.push(
                    pc,
                    StackValue {
                        ty: access.ty,
                        loc: Location::Local(access.index),
                        facts,
                    },
                )?;
            }
            (Istore | Lstore | Fstore | Dstore | Astore | Istore0 | Istore1, _) => {
                let access = self.var_access(instr);
                let value = state.pop(pc)?;
                let accepted = value.ty == access.ty
                    || (op == Astore && value.ty == ValueType::ReturnAddress);
                if !accepted {
                    return Err(JitError::malformed(
                        pc,
                        format!("cannot store {:?} with {}", value.ty, op),
                    ));
                }
                self.store_local(access.index, value, state);
            }
            (Iinc, &Operands::Iinc { index, delta }) => {
                self.spill_aliases(index, state);
                match self.frame.home(index) {
                    Home::Register(reg) => {
                        self.asm.int_op(IntOp::Add, Width::W32, reg, reg, Operand::Imm(delta as i64))
                    }
                    Home::Frame => {
                        let s = self.target.scratch(false, OPERAND);
                        let mem = self.frame.local_mem(index);
                        self.asm.load(Width::W32, s, mem);
                        self.asm.int_op(IntOp::Add, Width::W32, s, s, Operand::Imm(delta as i64));
                        self.asm.store(Width::W32, mem, s);
                    }
                }
            }

            (Pop, _) => {
                state.pop(pc)?;
            }
            (Dup, _) => {
                let top = *state.peek(pc)?;
                match top.loc {
                    Location::Slot(_) => {
                        let reg = self.materialize(&top, OPERAND, state);
                        self.push_reg(pc, state, top.ty, reg, top.facts)?;
                    }
                    _ => state.push(pc, top)?,
                }
            }
            (Swap, _) => {
                let b = state.pop(pc)?;
                let a = state.pop(pc)?;
                let a_reg = matches!(a.loc, Location::Slot(_)).then(|| self.materialize(&a, OPERAND, state));
                let b_reg = matches!(b.loc, Location::Slot(_)).then(|| self.materialize(&b, SECOND, state));
                self.repush(pc, state, b, b_reg)?;
                self.repush(pc, state, a, a_reg)?;
            }

            (Ineg, _) => {
                let value = state.pop_expect(pc, ValueType::Int)?;
                let src = self.materialize(&value, OPERAND, state);
                let dst = self.target.scratch(false, OPERAND);
                self.asm.neg(Width::W32, dst, src);
                self.push_reg(pc, state, ValueType::Int, dst, ValueFacts::NONE)?;
            }
            (Lcmp | Fcmp | Dcmp, _) => {
                let (kind, ty) = match op {
                    Lcmp => (CompareKind::Long, ValueType::Long),
                    Fcmp => (CompareKind::Float, ValueType::Float),
                    _ => (CompareKind::Double, ValueType::Double),
                };
                let rhs = state.pop_expect(pc, ty)?;
                let lhs = state.pop_expect(pc, ty)?;
                let l = self.materialize(&lhs, OPERAND, state);
                let r = self.materialize(&rhs, SECOND, state);
                let dst = self.target.scratch(false, OPERAND);
                self.asm.compare(kind, dst, l, r);
                self.push_reg(pc, state, ValueType::Int, dst, ValueFacts::NONE)?;
            }

            (Goto, &Operands::Branch(target)) => {
                self.flush(state);
                self.backedge_poll(pc, target, state);
                self.asm.jump(RelocTarget::Pc(target));
            }
            (Jsr, &Operands::Branch(target)) => {
                self.flush(state);
                let s = self.target.scratch(false, OPERAND);
                self.asm.load_address(s, RelocTarget::Pc(instr.next_pc));
                self.push_reg(pc, state, ValueType::ReturnAddress, s, ValueFacts::NON_NULL)?;
                self.asm.jump(RelocTarget::Pc(target));
            }
            (Ret, &Operands::Local(index)) => {
                self.flush(state);
                let address = match self.frame.home(index) {
                    Home::Register(reg) => reg,
                    Home::Frame => {
                        let s = self.target.scratch(false, OPERAND);
                        self.asm.load(self.frame.pointer_width(), s, self.frame.local_mem(index));
                        s
                    }
                };
                self.asm.jump_indirect(address);
            }
            (Tableswitch, Operands::Table { low, default, targets }) => {
                let key = state.pop_expect(pc, ValueType::Int)?;
                self.flush(state);
                let k = self.materialize(&key, OPERAND, state);
                let index = self.target.scratch(false, OPERAND);
                self.asm.int_op(IntOp::Sub, Width::W32, index, k, Operand::Imm(*low as i64));
                self.asm.branch_if(
                    Cond::AboveEq,
                    Width::W32,
                    index,
                    Operand::Imm(targets.len() as i64),
                    RelocTarget::Pc(*default),
                );
                self.asm.jump_table(index, RelocTarget::SwitchTable(pc));
                self.tables.add(pc, targets.clone());
            }
            (Lookupswitch, Operands::Lookup { default, pairs }) => {
                let key = state.pop_expect(pc, ValueType::Int)?;
                self.flush(state);
                let k = self.materialize(&key, OPERAND, state);
                for &(match_key, target) in pairs {
                    self.asm.branch_if(
                        Cond::Eq,
                        Width::W32,
                        k,
                        Operand::Imm(match_key as i64),
                        RelocTarget::Pc(target),
                    );
                }
                self.asm.jump(RelocTarget::Pc(*default));
            }
            (Athrow, _) => {
                let exception = state.pop_expect(pc, ValueType::Ref)?;
                self.flush(state);
                let reg = self.materialize(&exception, OPERAND, state);
                self.asm.store(self.frame.pointer_width(), self.frame.outgoing_mem(0), reg);
                self.asm.call(CallTarget::Helper(RuntimeHelper::Throw));
                self.record_safepoint(pc, state);
            }

            (Invoke, &Operands::Index(index)) => self.invoke(pc, index, state)?,
            (New, &Operands::Index(index)) => {
                let symbols = self.symbols;
                let class = symbols
                    .classes
                    .get(&index)
                    .unwrap_or_else(|| panic!("class #{index} was not resolved"));
                self.flush(state);
                let s = self.target.scratch(false, OPERAND);
                self.asm.mov_imm(Width::W64, s, class.0 as i64);
                self.asm.store(Width::W64, self.frame.outgoing_mem(0), s);
                self.asm.call(CallTarget::Helper(RuntimeHelper::AllocObject));
                self.record_safepoint(pc, state);
                let result = self.target.int_return;
                self.push_reg(pc, state, ValueType::Ref, result, ValueFacts::NON_NULL)?;
            }
            (Newarray, _) => {
                let length = state.pop_expect(pc, ValueType::Int)?;
                self.flush(state);
                let reg = self.materialize(&length, OPERAND, state);
                self.asm.store(Width::W32, self.frame.outgoing_mem(0), reg);
                self.asm.call(CallTarget::Helper(RuntimeHelper::AllocArray));
                self.record_safepoint(pc, state);
                let result = self.target.int_return;
                self.push_reg(pc, state, ValueType::Ref, result, ValueFacts::NON_NULL)?;
            }
            (Getfield, &Operands::Index(index)) => {
                let field = *self
                    .symbols
                    .fields
                    .get(&index)
                    .unwrap_or_else(|| panic!("field #{index} was not resolved"));
                let object = state.pop_expect(pc, ValueType::Ref)?;
                let base = self.null_checked(&object, OPERAND, state);
                let dst = self.target.scratch(field.ty.is_float(), OPERAND);
                self.asm.load(self.frame.width(field.ty), dst, Mem::new(base, field.offset));
                self.push_reg(pc, state, field.ty, dst, ValueFacts::NONE)?;
            }
            (Putfield, &Operands::Index(index)) => {
                let field = *self
                    .symbols
                    .fields
                    .get(&index)
                    .unwrap_or_else(|| panic!("field #{index} was not resolved"));
                let value = state.pop_expect(pc, field.ty)?;
                let object = state.pop_expect(pc, ValueType::Ref)?;
                let base = self.null_checked(&object, OPERAND, state);
                let src = self.materialize(&value, SECOND, state);
                self.asm.store(self.frame.width(field.ty), Mem::new(base, field.offset), src);
            }
            (Arraylength, _) => {
                let array = state.pop_expect(pc, ValueType::Ref)?;
                let base = self.null_checked(&array, OPERAND, state);
                let dst = self.target.scratch(false, OPERAND);
                self.asm.load(Width::W32, dst, Mem::new(base, self.target.array_length_offset));
                self.push_reg(pc, state, ValueType::Int, dst, ValueFacts::NONE)?;
            }
            (Iaload | Aaload, _) => {
                let element = if op == Iaload { ValueType::Int } else { ValueType::Ref };
                let index = state.pop_expect(pc, ValueType::Int)?;
                let array = state.pop_expect(pc, ValueType::Ref)?;
                let address = self.element_address(&array, &index, element, state);
                let dst = self.target.scratch(false, OPERAND);
                self.asm.load(self.frame.width(element), dst, address);
                self.push_reg(pc, state, element, dst, ValueFacts::NONE)?;
            }
            (Iastore | Aastore, _) => {
                let element = if op == Iastore { ValueType::Int } else { ValueType::Ref };
                let value = state.pop_expect(pc, element)?;
                let index = state.pop_expect(pc, ValueType::Int)?;
                let array = state.pop_expect(pc, ValueType::Ref)?;
                let address = self.element_address(&array, &index, element, state);
                let src = self.materialize(&value, OPERAND, state);
                self.asm.store(self.frame.width(element), address, src);
            }

            _ => {
                return Err(JitError::malformed(
                    pc,
                    format!("unexpected operands for {}", op),
                ))
            }
        }
        Ok(())
    }

    fn var_access(&self, instr: &InstructionDescriptor) -> crate::analysis::VarAccess {
        instr
            .var
            .unwrap_or_else(|| panic!("{} at pc {} has no local access", instr.opcode, instr.pc))
    }

    /// Register holding `value`; loads into scratch `index` unless the value
    /// is a register-homed local
    pub(super) fn materialize(&mut self, value: &StackValue, index: usize, state: &BlockState) -> Reg {
        let width = self.frame.width(value.ty);
        let scratch = self.target.scratch(value.ty.is_float(), index);
        match value.loc {
            Location::Slot(slot) => {
                self.asm.load(width, scratch, self.frame.stack_mem(slot));
                scratch
            }
            Location::Local(local) => match state.local(local).home {
                Home::Register(reg) => reg,
                Home::Frame => {
                    self.asm.load(width, scratch, self.frame.local_mem(local));
                    scratch
                }
            },
            Location::Imm(bits) => {
                self.asm.mov_imm(width, scratch, bits);
                scratch
            }
        }
    }

    /// Integer-class immediates stay immediates
    fn operand(&mut self, value: &StackValue, index: usize, state: &BlockState) -> Operand {
        match value.loc {
            Location::Imm(bits) if !value.ty.is_float() => Operand::Imm(bits),
            _ => Operand::Reg(self.materialize(value, index, state)),
        }
    }

    /// Store `reg` into the next canonical slot and push it
    fn push_reg(
        &mut self,
        pc: u32,
        state: &mut BlockState,
        ty: ValueType,
        reg: Reg,
        facts: ValueFacts,
    ) -> Result<(), JitError> {
        let slot = state.depth();
        let value = StackValue {
            ty,
            loc: Location::Slot(slot),
            facts,
        };
        state.push(pc, value)?;
        self.asm.store(self.frame.width(ty), self.frame.stack_mem(slot), reg);
        Ok(())
    }

    /// Push a value again after reordering; slot values come back through
    /// the register they were loaded into
    fn repush(
        &mut self,
        pc: u32,
        state: &mut BlockState,
        value: StackValue,
        reg: Option<Reg>,
    ) -> Result<(), JitError> {
        match reg {
            Some(reg) => self.push_reg(pc, state, value.ty, reg, value.facts),
            None => state.push(pc, value),
        }
    }

    /// Write every aliased or immediate stack entry into its canonical slot
    pub(super) fn flush(&mut self, state: &mut BlockState) {
        for slot in 0..state.depth() {
            let value = state.stack()[slot as usize];
            if value.loc == Location::Slot(slot) {
                continue;
            }
            let reg = self.materialize(&value, FLUSH, state);
            self.asm.store(self.frame.width(value.ty), self.frame.stack_mem(slot), reg);
            state.stack_mut()[slot as usize].loc = Location::Slot(slot);
        }
    }

    /// Materialize stack aliases of `local` before it is overwritten
    fn spill_aliases(&mut self, local: u16, state: &mut BlockState) {
        for slot in 0..state.depth() {
            let value = state.stack()[slot as usize];
            if value.loc != Location::Local(local) {
                continue;
            }
            let reg = self.materialize(&value, FLUSH, state);
            self.asm.store(self.frame.width(value.ty), self.frame.stack_mem(slot), reg);
            state.stack_mut()[slot as usize].loc = Location::Slot(slot);
        }
    }

    fn store_local(&mut self, local: u16, value: StackValue, state: &mut BlockState) {
        self.spill_aliases(local, state);
        let width = self.frame.width(value.ty);
        match state.local(local).home {
            Home::Register(home) => match value.loc {
                Location::Imm(bits) => self.asm.mov_imm(width, home, bits),
                _ => {
                    let src = self.materialize(&value, OPERAND, state);
                    if src != home {
                        self.asm.mov(width, home, src);
                    }
                }
            },
            Home::Frame => {
                let src = self.materialize(&value, OPERAND, state);
                self.asm.store(width, self.frame.local_mem(local), src);
            }
        }
        state.local_mut(local).facts = value.facts;
    }

    /// Materialize a reference and trap when it is null, unless it is known
    /// non-null; the local it came from is non-null afterwards
    fn null_checked(&mut self, value: &StackValue, index: usize, state: &mut BlockState) -> Reg {
        let reg = self.materialize(value, index, state);
        if !value.facts.non_null {
            self.asm.trap_if(
                Cond::Eq,
                self.frame.pointer_width(),
                reg,
                Operand::Imm(0),
                RuntimeHelper::NullPointer,
            );
            if let Location::Local(local) = value.loc {
                state.local_mut(local).facts = ValueFacts::NON_NULL;
                for entry in state.stack_mut() {
                    if entry.loc == Location::Local(local) {
                        entry.facts = ValueFacts::NON_NULL;
                    }
                }
            }
        }
        reg
    }

    /// Null- and bounds-check an array access; the element address is
    /// computed into the flush scratch register
    fn element_address(
        &mut self,
        array: &StackValue,
        index: &StackValue,
        element: ValueType,
        state: &mut BlockState,
    ) -> Mem {
        let base = self.null_checked(array, OPERAND, state);
        let idx = self.materialize(index, SECOND, state);
        let scratch = self.target.scratch(false, FLUSH);
        self.asm.load(Width::W32, scratch, Mem::new(base, self.target.array_length_offset));
        self.asm.trap_if(
            Cond::AboveEq,
            Width::W32,
            idx,
            Operand::Reg(scratch),
            RuntimeHelper::ArrayBounds,
        );
        let shift = match self.frame.width(element) {
            Width::W32 => 2,
            Width::W64 => 3,
        };
        self.asm.int_op(IntOp::Shl, Width::W64, scratch, idx, Operand::Imm(shift));
        self.asm.int_op(IntOp::Add, Width::W64, scratch, base, Operand::Reg(scratch));
        Mem::new(scratch, self.target.array_data_offset)
    }

    fn int_arith(
        &mut self,
        pc: u32,
        op: IntOp,
        ty: ValueType,
        state: &mut BlockState,
    ) -> Result<(), JitError> {
        let rhs = state.pop_expect(pc, ty)?;
        let lhs = state.pop_expect(pc, ty)?;
        let width = self.frame.width(ty);
        let l = self.materialize(&lhs, OPERAND, state);
        let r = if matches!(op, IntOp::Div | IntOp::Rem) {
            match rhs.loc {
                Location::Imm(bits) if bits != 0 => Operand::Imm(bits),
                _ => {
                    let divisor = self.materialize(&rhs, SECOND, state);
                    self.asm.trap_if(
                        Cond::Eq,
                        width,
                        divisor,
                        Operand::Imm(0),
                        RuntimeHelper::DivideByZero,
                    );
                    Operand::Reg(divisor)
                }
            }
        } else {
            self.operand(&rhs, SECOND, state)
        };
        let dst = self.target.scratch(false, OPERAND);
        self.asm.int_op(op, width, dst, l, r);
        self.push_reg(pc, state, ty, dst, ValueFacts::NONE)
    }

    fn float_arith(
        &mut self,
        pc: u32,
        op: FloatOp,
        ty: ValueType,
        state: &mut BlockState,
    ) -> Result<(), JitError> {
        let rhs = state.pop_expect(pc, ty)?;
        let lhs = state.pop_expect(pc, ty)?;
        let l = self.materialize(&lhs, OPERAND, state);
        let r = self.materialize(&rhs, SECOND, state);
        let dst = self.target.scratch(true, OPERAND);
        self.asm.float_op(op, self.frame.width(ty), dst, l, r);
        self.push_reg(pc, state, ty, dst, ValueFacts::NONE)
    }

    fn conditional_branch(
        &mut self,
        instr: &InstructionDescriptor,
        state: &mut BlockState,
    ) -> Result<(), JitError> {
        let pc = instr.pc;
        let Operands::Branch(target) = instr.operands else {
            panic!("{} at pc {pc} has no branch target", instr.opcode);
        };
        let (cond, ty, unary) = branch_condition(instr.opcode);
        self.backedge_poll(pc, target, state);
        let rhs = if unary {
            None
        } else {
            Some(state.pop_expect(pc, ty)?)
        };
        let lhs = state.pop_expect(pc, ty)?;
        self.flush(state);

        let width = self.frame.width(ty);
        let l = self.materialize(&lhs, OPERAND, state);
        let r = match rhs {
            Some(rhs) => self.operand(&rhs, SECOND, state),
            None => Operand::Imm(0),
        };
        self.asm.branch_if(cond, width, l, r, RelocTarget::Pc(target));
        Ok(())
    }

    fn method_return(
        &mut self,
        instr: &InstructionDescriptor,
        state: &mut BlockState,
    ) -> Result<(), JitError> {
        let pc = instr.pc;
        let ty = match instr.opcode {
            Opcode::Ireturn => Some(ValueType::Int),
            Opcode::Lreturn => Some(ValueType::Long),
            Opcode::Freturn => Some(ValueType::Float),
            Opcode::Dreturn => Some(ValueType::Double),
            Opcode::Areturn => Some(ValueType::Ref),
            _ => None,
        };
        if let Some(ty) = ty {
            let value = state.pop_expect(pc, ty)?;
            let dst = if ty.is_float() {
                self.target.float_return
            } else {
                self.target.int_return
            };
            let width = self.frame.width(ty);
            match value.loc {
                Location::Imm(bits) => self.asm.mov_imm(width, dst, bits),
                _ => {
                    let src = self.materialize(&value, OPERAND, state);
                    self.asm.mov(width, dst, src);
                }
            }
        }
        self.flush(state);
        self.emit_epilogue();
        Ok(())
    }

    fn emit_epilogue(&mut self) {
        let frame = self.frame;
        for (k, &reg) in frame.saved().iter().enumerate() {
            self.asm.load(Width::W64, reg, frame.save_mem(k));
        }
        self.asm.leave();
        self.asm.ret();
    }

    fn invoke(&mut self, pc: u32, index: u16, state: &mut BlockState) -> Result<(), JitError> {
        let symbols = self.symbols;
        let callee = symbols
            .methods
            .get(&index)
            .unwrap_or_else(|| panic!("method #{index} was not resolved"));
        let params = &callee.signature.params;
        let mut args = Vec::with_capacity(params.len());
        for &ty in params.iter().rev() {
            args.push(state.pop_expect(pc, ty)?);
        }
        args.reverse();
        self.flush(state);

        for (slot, arg) in args.iter().enumerate() {
            let reg = self.materialize(arg, OPERAND, state);
            self.asm.store(self.frame.width(arg.ty), self.frame.outgoing_mem(slot as u16), reg);
        }
        self.asm.call(CallTarget::Method(callee.id));
        self.record_safepoint(pc, state);

        if let Some(ty) = callee.signature.ret {
            let result = if ty.is_float() {
                self.target.float_return
            } else {
                self.target.int_return
            };
            self.push_reg(pc, state, ty, result, ValueFacts::NONE)?;
        }
        Ok(())
    }

    /// Safepoint poll before a backward transfer; the stack is flushed so
    /// every live reference is in a slot
    fn backedge_poll(&mut self, pc: u32, target: u32, state: &mut BlockState) {
        if self.config.backedge_polls && target <= pc {
            self.flush(state);
            self.asm.poll();
            self.record_safepoint(pc, state);
        }
    }

    /// Exception-handler entry: the caught object arrives in the exception
    /// register and is stored like a call result
    pub(super) fn store_exception(&mut self) {
        let width = self.frame.pointer_width();
        self.asm
            .store(width, self.frame.stack_mem(0), self.target.exception_reg);
    }

    fn record_safepoint(&mut self, pc: u32, state: &BlockState) {
        let roots = self.gc_roots(state);
        self.safepoints.push(PendingSafepoint {
            block: self.current,
            offset: self.asm.offset(),
            pc,
            roots,
        });
    }

    /// Reference-holding locals and canonical stack slots
    fn gc_roots(&self, state: &BlockState) -> Vec<GcRoot> {
        let mut roots = Vec::new();
        for (local, usage) in self.analysis.vars.iter().enumerate() {
            let conservative = match usage.ty {
                SlotType::Typed(ValueType::Ref) => false,
                SlotType::Conflict => true,
                _ => continue,
            };
            roots.push(GcRoot {
                location: self.frame.local_location(local as u16),
                conservative,
            });
        }
        for value in state.stack() {
            if let (ValueType::Ref, Location::Slot(slot)) = (value.ty, value.loc) {
                roots.push(GcRoot {
                    location: self.frame.stack_location(slot),
                    conservative: false,
                });
            }
        }
        roots
    }
}
