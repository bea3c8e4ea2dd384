//! Label-based bytecode builder
//!
//! Branch and switch offsets are emitted as placeholders and fixed up in
//! [`BytecodeBuilder::finish`] once every label is bound.

use super::opcode::Opcode;

/// Forward-referenceable code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Error finishing a builder
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Label {0} was never bound")]
    UnboundLabel(u32),
    #[error("Branch at pc {pc} cannot reach pc {target}")]
    OffsetOutOfRange { pc: u32, target: u32 },
}

#[derive(Debug, Clone, Copy)]
enum FixupWidth {
    Rel16,
    Rel32,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Byte position of the offset field
    at: usize,
    /// PC of the instruction the offset is relative to
    base: u32,
    label: Label,
    width: FixupWidth,
}

/// Builder for bytecode method bodies
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current PC
    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind a label to the current PC
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let slot = &mut self.labels[label.0 as usize];
        assert!(slot.is_none(), "label {} bound twice", label.0);
        *slot = Some(self.code.len() as u32);
        self
    }

    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.code.push(opcode.to_u8());
        self
    }

    /// Instruction with a single-byte operand (local index)
    pub fn op_u8(&mut self, opcode: Opcode, operand: u8) -> &mut Self {
        self.code.push(opcode.to_u8());
        self.code.push(operand);
        self
    }

    /// Instruction with a 16-bit constant-pool index
    pub fn op_u16(&mut self, opcode: Opcode, index: u16) -> &mut Self {
        self.code.push(opcode.to_u8());
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn bipush(&mut self, value: i8) -> &mut Self {
        self.code.push(Opcode::Bipush.to_u8());
        self.code.push(value as u8);
        self
    }

    pub fn ldc(&mut self, value: i32) -> &mut Self {
        self.code.push(Opcode::Ldc.to_u8());
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn lconst(&mut self, value: i64) -> &mut Self {
        self.code.push(Opcode::Lconst.to_u8());
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn fconst(&mut self, value: f32) -> &mut Self {
        self.code.push(Opcode::Fconst.to_u8());
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn dconst(&mut self, value: f64) -> &mut Self {
        self.code.push(Opcode::Dconst.to_u8());
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn iinc(&mut self, index: u8, delta: i8) -> &mut Self {
        self.code.push(Opcode::Iinc.to_u8());
        self.code.push(index);
        self.code.push(delta as u8);
        self
    }

    /// Conditional branch, `goto` or `jsr` to a label
    pub fn branch(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        debug_assert!(
            opcode.is_conditional_branch() || matches!(opcode, Opcode::Goto | Opcode::Jsr),
            "{} is not a branch",
            opcode
        );
        let base = self.pc();
        self.code.push(opcode.to_u8());
        self.placeholder(base, label, FixupWidth::Rel16);
        self
    }

    /// Dense switch over `[low, low + cases.len())`
    pub fn tableswitch(&mut self, low: i32, default: Label, cases: &[Label]) -> &mut Self {
        assert!(!cases.is_empty(), "tableswitch needs at least one case");
        let base = self.pc();
        self.code.push(Opcode::Tableswitch.to_u8());
        self.placeholder(base, default, FixupWidth::Rel32);
        let high = low + cases.len() as i32 - 1;
        self.code.extend_from_slice(&low.to_le_bytes());
        self.code.extend_from_slice(&high.to_le_bytes());
        for &case in cases {
            self.placeholder(base, case, FixupWidth::Rel32);
        }
        self
    }

    /// Sparse switch; keys must be strictly increasing
    pub fn lookupswitch(&mut self, default: Label, pairs: &[(i32, Label)]) -> &mut Self {
        let base = self.pc();
        self.code.push(Opcode::Lookupswitch.to_u8());
        self.placeholder(base, default, FixupWidth::Rel32);
        self.code
            .extend_from_slice(&(pairs.len() as u32).to_le_bytes());
        for &(key, label) in pairs {
            self.code.extend_from_slice(&key.to_le_bytes());
            self.placeholder(base, label, FixupWidth::Rel32);
        }
        self
    }

    /// Append raw bytes, for malformed-input tests
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    fn placeholder(&mut self, base: u32, label: Label, width: FixupWidth) {
        let at = self.code.len();
        match width {
            FixupWidth::Rel16 => self.code.extend_from_slice(&[0; 2]),
            FixupWidth::Rel32 => self.code.extend_from_slice(&[0; 4]),
        }
        self.fixups.push(Fixup {
            at,
            base,
            label,
            width,
        });
    }

    /// Resolve all label references and return the finished code
    pub fn finish(mut self) -> Result<Vec<u8>, BuildError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.labels[fixup.label.0 as usize]
                .ok_or(BuildError::UnboundLabel(fixup.label.0))?;
            let delta = target as i64 - fixup.base as i64;
            match fixup.width {
                FixupWidth::Rel16 => {
                    let rel = i16::try_from(delta).map_err(|_| BuildError::OffsetOutOfRange {
                        pc: fixup.base,
                        target,
                    })?;
                    self.code[fixup.at..fixup.at + 2].copy_from_slice(&rel.to_le_bytes());
                }
                FixupWidth::Rel32 => {
                    let rel = delta as i32;
                    self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
                }
            }
        }
        Ok(self.code)
    }
}
