//! Local register allocator
//!
//! Whole-method greedy assignment of the most frequently accessed local slots
//! to callee-saved registers. The integer and float pools are filled
//! independently; everything else lives in the frame.

use crate::analysis::{SlotType, VarUsage};
use crate::bytecode::ValueType;
use crate::target::{Reg, TargetInfo};

/// Where a local slot lives for the whole method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    Register(Reg),
    Frame,
}

impl Home {
    pub fn register(self) -> Option<Reg> {
        match self {
            Home::Register(reg) => Some(reg),
            Home::Frame => None,
        }
    }
}

/// Result of allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// One home per local slot
    pub homes: Vec<Home>,
    /// Callee-saved registers the method touches, frame base included
    pub used: Vec<Reg>,
}

impl Allocation {
    /// Used registers that must be saved and restored around the body
    pub fn saved(&self, target: &TargetInfo) -> Vec<Reg> {
        self.used
            .iter()
            .copied()
            .filter(|&reg| reg != target.frame_base)
            .collect()
    }
}

/// Assign registers to local slots
pub fn allocate(vars: &[VarUsage], target: &TargetInfo, instrumentation: bool) -> Allocation {
    let mut homes = vec![Home::Frame; vars.len()];
    let mut used = vec![target.frame_base];

    if !instrumentation {
        let int_pool: Vec<Reg> = target
            .callee_saved_int
            .iter()
            .copied()
            .filter(|&reg| reg != target.frame_base)
            .collect();
        let float_pool = target.callee_saved_float.clone();

        fill_pool(vars, &mut homes, &mut used, &int_pool, |ty| match ty {
            ValueType::Int | ValueType::Ref | ValueType::ReturnAddress => true,
            ValueType::Long => target.wide_int_regs,
            _ => false,
        });
        fill_pool(vars, &mut homes, &mut used, &float_pool, |ty| match ty {
            ValueType::Float => true,
            ValueType::Double => target.wide_float_regs,
            _ => false,
        });
    }

    used.sort();
    Allocation { homes, used }
}

fn fill_pool(
    vars: &[VarUsage],
    homes: &mut [Home],
    used: &mut Vec<Reg>,
    pool: &[Reg],
    eligible: impl Fn(ValueType) -> bool,
) {
    let mut candidates: Vec<usize> = vars
        .iter()
        .enumerate()
        .filter(|(slot, usage)| {
            homes[*slot] == Home::Frame
                && usage.weight() > 0
                && matches!(usage.ty, SlotType::Typed(ty) if eligible(ty))
        })
        .map(|(slot, _)| slot)
        .collect();
    // Hottest first; ties go to the lowest slot
    candidates.sort_by(|&a, &b| vars[b].weight().cmp(&vars[a].weight()).then(a.cmp(&b)));

    for (slot, &reg) in candidates.into_iter().zip(pool) {
        homes[slot] = Home::Register(reg);
        used.push(reg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(defs: u32, uses: u32, ty: ValueType) -> VarUsage {
        VarUsage {
            defs,
            uses,
            ty: SlotType::Typed(ty),
        }
    }

    #[test]
    fn test_hottest_slots_win() {
        let mut target = TargetInfo::portable64();
        target.callee_saved_int = vec![Reg::int(8), Reg::int(14)];
        let vars = vec![
            usage(1, 1, ValueType::Int),
            usage(3, 4, ValueType::Int),
            usage(1, 1, ValueType::Ref),
        ];
        let alloc = allocate(&vars, &target, false);
        assert_eq!(alloc.homes[1], Home::Register(Reg::int(8)));
        assert_eq!(alloc.homes[0], Home::Frame);
        assert_eq!(alloc.homes[2], Home::Frame);
        assert_eq!(alloc.used, vec![Reg::int(8), Reg::int(14)]);
        assert_eq!(alloc.saved(&target), vec![Reg::int(8)]);
    }

    #[test]
    fn test_tie_goes_to_lowest_slot() {
        let mut target = TargetInfo::portable64();
        target.callee_saved_int = vec![Reg::int(9)];
        let vars = vec![
            VarUsage::default(),
            usage(2, 0, ValueType::Int),
            usage(1, 1, ValueType::Int),
        ];
        let alloc = allocate(&vars, &target, false);
        assert_eq!(alloc.homes[1], Home::Register(Reg::int(9)));
        assert_eq!(alloc.homes[2], Home::Frame);
    }

    #[test]
    fn test_conflict_and_unused_never_allocated() {
        let target = TargetInfo::portable64();
        let vars = vec![
            VarUsage {
                defs: 9,
                uses: 9,
                ty: SlotType::Conflict,
            },
            VarUsage::default(),
        ];
        let alloc = allocate(&vars, &target, false);
        assert_eq!(alloc.homes, vec![Home::Frame, Home::Frame]);
    }

    #[test]
    fn test_float_pool_is_independent() {
        let target = TargetInfo::portable64();
        let vars = vec![
            usage(1, 1, ValueType::Double),
            usage(1, 1, ValueType::Int),
        ];
        let alloc = allocate(&vars, &target, false);
        assert_eq!(alloc.homes[0], Home::Register(Reg::float(8)));
        assert_eq!(alloc.homes[1], Home::Register(Reg::int(8)));
    }

    #[test]
    fn test_wide_ints_need_wide_registers() {
        let vars = vec![usage(5, 5, ValueType::Long)];
        let alloc = allocate(&vars, &TargetInfo::portable32(), false);
        assert_eq!(alloc.homes[0], Home::Frame);
        let alloc = allocate(&vars, &TargetInfo::portable64(), false);
        assert!(matches!(alloc.homes[0], Home::Register(_)));
    }

    #[test]
    fn test_frame_base_never_allocated() {
        let target = TargetInfo::portable64();
        let vars: Vec<VarUsage> = (0..20).map(|_| usage(1, 1, ValueType::Int)).collect();
        let alloc = allocate(&vars, &target, false);
        assert!(alloc
            .homes
            .iter()
            .all(|home| *home != Home::Register(target.frame_base)));
        // six allocatable registers plus the frame base
        assert_eq!(alloc.used.len(), 7);
    }

    #[test]
    fn test_instrumentation_allocates_nothing() {
        let target = TargetInfo::portable64();
        let vars = vec![usage(4, 4, ValueType::Int)];
        let alloc = allocate(&vars, &target, true);
        assert_eq!(alloc.homes, vec![Home::Frame]);
        assert_eq!(alloc.used, vec![target.frame_base]);
    }
}
