//! Symbolic references resolved ahead of generation
//!
//! Every callee, field and class referenced by reachable code is resolved
//! before the first byte is emitted, so a resolution failure leaves nothing
//! behind.

use rustc_hash::FxHashMap;

use crate::analysis::{MethodAnalysis, Operands};
use crate::bytecode::{ClassRef, FieldRef, MethodRef, MethodSource, Opcode, ResolveError};

#[derive(Debug, Clone, Default)]
pub struct Symbols {
    pub methods: FxHashMap<u16, MethodRef>,
    pub fields: FxHashMap<u16, FieldRef>,
    pub classes: FxHashMap<u16, ClassRef>,
    /// Reachable code calls a runtime helper that takes an argument
    pub calls_helpers: bool,
}

impl Symbols {
    pub fn resolve(method: &dyn MethodSource, analysis: &MethodAnalysis) -> Result<Self, ResolveError> {
        let mut symbols = Symbols::default();
        for instr in analysis.instrs.iter().filter(|i| i.is_reachable()) {
            match (instr.opcode, &instr.operands) {
                (Opcode::Invoke, &Operands::Index(index)) => {
                    if !symbols.methods.contains_key(&index) {
                        symbols.methods.insert(index, method.resolve_method(index)?);
                    }
                }
                (Opcode::Getfield | Opcode::Putfield, &Operands::Index(index)) => {
                    if !symbols.fields.contains_key(&index) {
                        symbols.fields.insert(index, method.resolve_field(index)?);
                    }
                }
                (Opcode::New, &Operands::Index(index)) => {
                    symbols.calls_helpers = true;
                    if !symbols.classes.contains_key(&index) {
                        symbols.classes.insert(index, method.resolve_class(index)?);
                    }
                }
                (Opcode::Newarray | Opcode::Athrow, _) => symbols.calls_helpers = true,
                _ => {}
            }
        }
        Ok(symbols)
    }

    /// Outgoing argument slots needed by the largest call
    pub fn outgoing_slots(&self) -> u16 {
        let invokes = self
            .methods
            .values()
            .map(|callee| callee.signature.params.len() as u16)
            .max()
            .unwrap_or(0);
        invokes.max(self.calls_helpers as u16)
    }
}
