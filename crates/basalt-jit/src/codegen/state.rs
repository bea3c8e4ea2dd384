//! Simulated operand stack and local bindings
//!
//! Every operand-stack entry has a canonical frame slot. An entry is either
//! in its slot, a deferred alias of a local, or an immediate; an entry at
//! index `i` is never held in any slot other than `i`.

use crate::bytecode::ValueType;
use crate::error::JitError;
use crate::regalloc::Home;

/// Where an operand-stack value currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Canonical stack slot `i`
    Slot(u16),
    /// Not yet copied out of local `n`
    Local(u16),
    /// Constant bits not yet materialized
    Imm(i64),
}

/// Nullness facts about a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueFacts {
    pub non_null: bool,
    pub null: bool,
}

impl ValueFacts {
    pub const NONE: ValueFacts = ValueFacts {
        non_null: false,
        null: false,
    };
    pub const NON_NULL: ValueFacts = ValueFacts {
        non_null: true,
        null: false,
    };
    pub const NULL: ValueFacts = ValueFacts {
        non_null: false,
        null: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackValue {
    pub ty: ValueType,
    pub loc: Location,
    pub facts: ValueFacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBinding {
    pub home: Home,
    pub facts: ValueFacts,
}

/// Abstract machine state at a point in a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    stack: Vec<StackValue>,
    locals: Vec<LocalBinding>,
    max_stack: u16,
}

impl BlockState {
    /// Method-entry state: empty stack, locals at their homes with no facts
    pub fn entry(homes: &[Home], max_stack: u16) -> Self {
        BlockState {
            stack: Vec::with_capacity(max_stack as usize),
            locals: homes
                .iter()
                .map(|&home| LocalBinding {
                    home,
                    facts: ValueFacts::NONE,
                })
                .collect(),
            max_stack,
        }
    }

    /// Exception-handler entry state: the caught object in slot 0
    pub fn handler(homes: &[Home], max_stack: u16) -> Self {
        let mut state = Self::entry(homes, max_stack);
        state.stack.push(StackValue {
            ty: ValueType::Ref,
            loc: Location::Slot(0),
            facts: ValueFacts::NON_NULL,
        });
        state
    }

    pub fn depth(&self) -> u16 {
        self.stack.len() as u16
    }

    pub fn stack(&self) -> &[StackValue] {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut [StackValue] {
        &mut self.stack
    }

    pub fn locals(&self) -> &[LocalBinding] {
        &self.locals
    }

    pub fn local(&self, index: u16) -> &LocalBinding {
        &self.locals[index as usize]
    }

    pub fn local_mut(&mut self, index: u16) -> &mut LocalBinding {
        &mut self.locals[index as usize]
    }

    pub fn push(&mut self, pc: u32, value: StackValue) -> Result<(), JitError> {
        if self.stack.len() >= self.max_stack as usize {
            return Err(JitError::malformed(pc, "operand stack overflow"));
        }
        debug_assert!(
            !matches!(value.loc, Location::Slot(i) if i as usize != self.stack.len()),
            "value pushed into a foreign slot"
        );
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self, pc: u32) -> Result<StackValue, JitError> {
        self.stack
            .pop()
            .ok_or_else(|| JitError::malformed(pc, "operand stack underflow"))
    }

    /// Pop a value that must have type `ty`
    pub fn pop_expect(&mut self, pc: u32, ty: ValueType) -> Result<StackValue, JitError> {
        let value = self.pop(pc)?;
        if value.ty != ty {
            return Err(JitError::malformed(
                pc,
                format!("expected {:?} on the stack, found {:?}", ty, value.ty),
            ));
        }
        Ok(value)
    }

    pub fn peek(&self, pc: u32) -> Result<&StackValue, JitError> {
        self.stack
            .last()
            .ok_or_else(|| JitError::malformed(pc, "operand stack underflow"))
    }

    /// Drop all value facts; used at merge points
    pub fn forget_facts(&mut self) {
        for value in &mut self.stack {
            value.facts = ValueFacts::NONE;
        }
        for local in &mut self.locals {
            local.facts = ValueFacts::NONE;
        }
    }

    /// Every stack value is in its own canonical slot
    pub fn is_canonical(&self) -> bool {
        self.stack
            .iter()
            .enumerate()
            .all(|(i, value)| value.loc == Location::Slot(i as u16))
    }

    /// Same depth, stack types and local homes
    pub fn layout_matches(&self, other: &BlockState) -> bool {
        self.stack.len() == other.stack.len()
            && self
                .stack
                .iter()
                .zip(&other.stack)
                .all(|(a, b)| a.ty == b.ty)
            && self
                .locals
                .iter()
                .zip(&other.locals)
                .all(|(a, b)| a.home == b.home)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Reg;

    fn slot(ty: ValueType, i: u16) -> StackValue {
        StackValue {
            ty,
            loc: Location::Slot(i),
            facts: ValueFacts::NONE,
        }
    }

    #[test]
    fn test_push_pop() {
        let mut state = BlockState::entry(&[Home::Frame], 2);
        state.push(0, slot(ValueType::Int, 0)).unwrap();
        state.push(0, slot(ValueType::Ref, 1)).unwrap();
        assert_eq!(state.depth(), 2);
        assert!(state.is_canonical());
        assert!(matches!(
            state.push(7, slot(ValueType::Int, 2)),
            Err(JitError::Malformed { pc: 7, .. })
        ));
        assert_eq!(state.pop(0).unwrap().ty, ValueType::Ref);
        assert!(state.pop_expect(3, ValueType::Long).is_err());
        assert!(matches!(state.pop(4), Err(JitError::Malformed { pc: 4, .. })));
    }

    #[test]
    fn test_aliases_are_not_canonical() {
        let mut state = BlockState::entry(&[Home::Frame], 2);
        state
            .push(
                0,
                StackValue {
                    ty: ValueType::Int,
                    loc: Location::Local(0),
                    facts: ValueFacts::NONE,
                },
            )
            .unwrap();
        assert!(!state.is_canonical());
    }

    #[test]
    fn test_forget_facts() {
        let mut state = BlockState::handler(&[Home::Frame], 1);
        state.local_mut(0).facts = ValueFacts::NON_NULL;
        assert!(state.stack()[0].facts.non_null);
        state.forget_facts();
        assert_eq!(state.stack()[0].facts, ValueFacts::NONE);
        assert_eq!(state.local(0).facts, ValueFacts::NONE);
        assert_eq!(state.depth(), 1);
    }

    #[test]
    fn test_layout_matches() {
        let homes = [Home::Register(Reg::int(8)), Home::Frame];
        let a = BlockState::handler(&homes, 2);
        let mut b = BlockState::handler(&homes, 2);
        b.forget_facts();
        assert!(a.layout_matches(&b));
        let c = BlockState::entry(&homes, 2);
        assert!(!a.layout_matches(&c));
    }
}
