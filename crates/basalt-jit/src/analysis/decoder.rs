//! Bytecode instruction decoder
//!
//! Decodes raw bytecode bytes into [`InstructionDescriptor`]s with parsed
//! operands, absolute branch targets, control-flow flags and local-variable
//! def/use information.

use crate::bytecode::{Opcode, ValueType};

/// Error during bytecode decoding or validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid opcode byte {byte:#x} at pc {pc}")]
    InvalidOpcode { byte: u8, pc: u32 },
    #[error("Unexpected end of bytecode at pc {0}")]
    UnexpectedEnd(u32),
    #[error("Method has no code")]
    EmptyMethod,
    #[error("Branch at pc {pc} targets {target}, which is not an instruction")]
    BadTarget { pc: u32, target: i64 },
    #[error("Malformed switch at pc {0}")]
    BadSwitch(u32),
    #[error("Local {index} at pc {pc} exceeds max_locals {max_locals}")]
    LocalOutOfRange { pc: u32, index: u16, max_locals: u16 },
    #[error("Exception table entry {0} is not on instruction boundaries")]
    BadHandler(usize),
    #[error("Control falls off the end of the method after pc {0}")]
    FallsOffEnd(u32),
    #[error("{params} parameters do not fit in {max_locals} locals")]
    TooManyParams { params: usize, max_locals: u16 },
}

/// Control-flow and data-flow flags of one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstrFlags(u16);

impl InstrFlags {
    pub const NONE: Self = Self(0);
    /// First instruction of a basic block
    pub const STARTS_BLOCK: Self = Self(0x0001);
    /// Last instruction of a basic block
    pub const ENDS_BLOCK: Self = Self(0x0002);
    /// Control never reaches the next instruction
    pub const DEAD_END: Self = Self(0x0004);
    /// Has explicit branch targets
    pub const BRANCH: Self = Self(0x0008);
    pub const SUBROUTINE_CALL: Self = Self(0x0010);
    pub const SUBROUTINE_RETURN: Self = Self(0x0020);
    /// Writes a local variable
    pub const DEFINES_VAR: Self = Self(0x0040);
    /// Reads a local variable
    pub const USES_VAR: Self = Self(0x0080);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for InstrFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Typed operands with branch offsets already resolved to absolute PCs
#[derive(Debug, Clone, PartialEq)]
pub enum Operands {
    None,
    /// Local variable index
    Local(u16),
    Iinc { index: u16, delta: i32 },
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Absolute branch target
    Branch(u32),
    Table {
        low: i32,
        default: u32,
        targets: Vec<u32>,
    },
    Lookup {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
    /// Constant-pool index
    Index(u16),
}

/// Local-variable access performed by an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarAccess {
    pub index: u16,
    pub ty: ValueType,
    pub defines: bool,
    pub uses: bool,
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionDescriptor {
    pub pc: u32,
    pub opcode: Opcode,
    pub operands: Operands,
    /// PC of the following instruction
    pub next_pc: u32,
    pub flags: InstrFlags,
    pub var: Option<VarAccess>,
    /// Visit order from the reachability pass; 0 = unvisited
    pub seq_id: u32,
    /// Incoming edges from reachable instructions; 0 = unreachable
    pub ref_count: u32,
}

impl InstructionDescriptor {
    pub fn size(&self) -> u32 {
        self.next_pc - self.pc
    }

    pub fn is_reachable(&self) -> bool {
        self.ref_count > 0
    }

    /// Execution can continue at `next_pc`
    pub fn falls_through(&self) -> bool {
        !self.flags.contains(InstrFlags::DEAD_END)
    }

    /// Explicit targets: branch target, or switch default followed by cases
    pub fn targets(&self) -> Vec<u32> {
        match &self.operands {
            Operands::Branch(target) => vec![*target],
            Operands::Table {
                default, targets, ..
            } => {
                let mut all = Vec::with_capacity(targets.len() + 1);
                all.push(*default);
                all.extend_from_slice(targets);
                all
            }
            Operands::Lookup { default, pairs } => {
                let mut all = Vec::with_capacity(pairs.len() + 1);
                all.push(*default);
                all.extend(pairs.iter().map(|&(_, target)| target));
                all
            }
            _ => Vec::new(),
        }
    }
}

/// Decode every instruction of a method in PC order
pub fn decode_method(code: &[u8]) -> Result<Vec<InstructionDescriptor>, DecodeError> {
    if code.is_empty() {
        return Err(DecodeError::EmptyMethod);
    }

    let mut instrs = Vec::new();
    let mut pc = 0u32;
    while (pc as usize) < code.len() {
        let instr = decode_at(code, pc)?;
        pc = instr.next_pc;
        instrs.push(instr);
    }

    if let Some(last) = instrs.last() {
        if last.falls_through() {
            return Err(DecodeError::FallsOffEnd(last.pc));
        }
    }
    Ok(instrs)
}

/// Decode the single instruction at `pc`
pub fn decode_at(code: &[u8], pc: u32) -> Result<InstructionDescriptor, DecodeError> {
    let mut reader = Reader {
        code,
        pos: pc as usize,
        pc,
    };
    let byte = reader.u8()?;
    let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode { byte, pc })?;
    let operands = decode_operands(opcode, &mut reader)?;
    let next_pc = reader.pos as u32;

    let mut flags = control_flags(opcode);
    let var = var_access(opcode, &operands);
    if let Some(access) = var {
        if access.defines {
            flags.insert(InstrFlags::DEFINES_VAR);
        }
        if access.uses {
            flags.insert(InstrFlags::USES_VAR);
        }
    }

    Ok(InstructionDescriptor {
        pc,
        opcode,
        operands,
        next_pc,
        flags,
        var,
        seq_id: 0,
        ref_count: 0,
    })
}

fn control_flags(opcode: Opcode) -> InstrFlags {
    use Opcode::*;
    match opcode {
        op if op.is_conditional_branch() => InstrFlags::ENDS_BLOCK | InstrFlags::BRANCH,
        Goto => InstrFlags::ENDS_BLOCK | InstrFlags::DEAD_END | InstrFlags::BRANCH,
        // The fallthrough of a jsr is where the subroutine returns to
        Jsr => InstrFlags::ENDS_BLOCK | InstrFlags::BRANCH | InstrFlags::SUBROUTINE_CALL,
        Ret => InstrFlags::ENDS_BLOCK | InstrFlags::DEAD_END | InstrFlags::SUBROUTINE_RETURN,
        Tableswitch | Lookupswitch => {
            InstrFlags::ENDS_BLOCK | InstrFlags::DEAD_END | InstrFlags::BRANCH
        }
        op if op.is_return() => InstrFlags::ENDS_BLOCK | InstrFlags::DEAD_END,
        Athrow => InstrFlags::ENDS_BLOCK | InstrFlags::DEAD_END,
        _ => InstrFlags::NONE,
    }
}

fn var_access(opcode: Opcode, operands: &Operands) -> Option<VarAccess> {
    use Opcode::*;
    let (index, ty, defines) = match (opcode, operands) {
        (Iload, Operands::Local(i)) => (*i, ValueType::Int, false),
        (Lload, Operands::Local(i)) => (*i, ValueType::Long, false),
        (Fload, Operands::Local(i)) => (*i, ValueType::Float, false),
        (Dload, Operands::Local(i)) => (*i, ValueType::Double, false),
        (Aload, Operands::Local(i)) => (*i, ValueType::Ref, false),
        (Istore, Operands::Local(i)) => (*i, ValueType::Int, true),
        (Lstore, Operands::Local(i)) => (*i, ValueType::Long, true),
        (Fstore, Operands::Local(i)) => (*i, ValueType::Float, true),
        (Dstore, Operands::Local(i)) => (*i, ValueType::Double, true),
        (Astore, Operands::Local(i)) => (*i, ValueType::Ref, true),
        (Ret, Operands::Local(i)) => (*i, ValueType::ReturnAddress, false),
        (Iload0, _) => (0, ValueType::Int, false),
        (Iload1, _) => (1, ValueType::Int, false),
        (Istore0, _) => (0, ValueType::Int, true),
        (Istore1, _) => (1, ValueType::Int, true),
        (Aload0, _) => (0, ValueType::Ref, false),
        (Iinc, Operands::Iinc { index, .. }) => {
            return Some(VarAccess {
                index: *index,
                ty: ValueType::Int,
                defines: true,
                uses: true,
            })
        }
        _ => return None,
    };
    Some(VarAccess {
        index,
        ty,
        defines,
        uses: !defines,
    })
}

fn decode_operands(opcode: Opcode, r: &mut Reader<'_>) -> Result<Operands, DecodeError> {
    use Opcode::*;
    let operands = match opcode {
        Bipush => Operands::Int(r.u8()? as i8 as i32),
        Ldc => Operands::Int(r.i32()?),
        Lconst => Operands::Long(r.i64()?),
        Fconst => Operands::Float(f32::from_bits(r.i32()? as u32)),
        Dconst => Operands::Double(f64::from_bits(r.i64()? as u64)),
        Iconst0 => Operands::Int(0),
        Iconst1 => Operands::Int(1),

        Iload | Lload | Fload | Dload | Aload | Istore | Lstore | Fstore | Dstore | Astore
        | Ret => Operands::Local(r.u8()? as u16),
        Iinc => {
            let index = r.u8()? as u16;
            let delta = r.u8()? as i8 as i32;
            Operands::Iinc { index, delta }
        }

        op if op.is_conditional_branch() => Operands::Branch(r.branch16()?),
        Goto | Jsr => Operands::Branch(r.branch16()?),

        Tableswitch => {
            let default = r.branch32()?;
            let low = r.i32()?;
            let high = r.i32()?;
            if high < low {
                return Err(DecodeError::BadSwitch(r.pc));
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            r.ensure(count.saturating_mul(4))?;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(r.branch32()?);
            }
            Operands::Table {
                low,
                default,
                targets,
            }
        }
        Lookupswitch => {
            let default = r.branch32()?;
            let npairs = r.i32()? as u32 as usize;
            r.ensure(npairs.saturating_mul(8))?;
            let mut pairs: Vec<(i32, u32)> = Vec::with_capacity(npairs);
            for _ in 0..npairs {
                let key = r.i32()?;
                if pairs.last().is_some_and(|&(prev, _)| prev >= key) {
                    return Err(DecodeError::BadSwitch(r.pc));
                }
                pairs.push((key, r.branch32()?));
            }
            Operands::Lookup { default, pairs }
        }

        Invoke | New | Getfield | Putfield => Operands::Index(r.u16()?),
        _ => Operands::None,
    };
    Ok(operands)
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
    /// PC of the instruction being decoded
    pc: u32,
}

impl Reader<'_> {
    fn ensure(&self, len: usize) -> Result<(), DecodeError> {
        if self.pos.saturating_add(len) > self.code.len() {
            return Err(DecodeError::UnexpectedEnd(self.pc));
        }
        Ok(())
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.code[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.bytes()?))
    }

    fn branch16(&mut self) -> Result<u32, DecodeError> {
        let rel = i16::from_le_bytes(self.bytes()?) as i64;
        self.target(rel)
    }

    fn branch32(&mut self) -> Result<u32, DecodeError> {
        let rel = self.i32()? as i64;
        self.target(rel)
    }

    fn target(&self, rel: i64) -> Result<u32, DecodeError> {
        let target = self.pc as i64 + rel;
        if target < 0 || target >= self.code.len() as i64 {
            return Err(DecodeError::BadTarget {
                pc: self.pc,
                target,
            });
        }
        Ok(target as u32)
    }
}
