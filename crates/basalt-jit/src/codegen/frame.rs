//! Stack-frame layout
//!
//! All slots are 8 bytes. Relative to the frame base:
//! - incoming argument `i` at `+16 + 8i`
//! - callee-saved register `k` at `-8(k + 1)`
//! - local `n` at `-8(saved + n + 1)`, unless it is a frame-homed parameter,
//!   which stays in its incoming slot
//! - operand-stack slot `i` at `-8(saved + max_locals + i + 1)`
//!
//! Outgoing arguments live at the bottom of the frame, addressed from the
//! stack pointer.

use crate::bytecode::ValueType;
use crate::info::{FrameDescriptor, SlotLocation};
use crate::masm::{Mem, Width};
use crate::regalloc::{Allocation, Home};
use crate::target::{Reg, TargetInfo};

pub const SLOT_SIZE: i32 = 8;
const INCOMING_BASE: i32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    frame_base: Reg,
    stack_pointer: Reg,
    pointer_size: u8,
    saved: Vec<Reg>,
    homes: Vec<Home>,
    arg_slots: u16,
    max_stack: u16,
    outgoing_slots: u16,
    frame_size: u32,
}

impl FrameLayout {
    pub fn new(
        target: &TargetInfo,
        allocation: &Allocation,
        arg_slots: u16,
        max_stack: u16,
        outgoing_slots: u16,
    ) -> Self {
        let saved = allocation.saved(target);
        let slots = saved.len() + allocation.homes.len() + max_stack as usize + outgoing_slots as usize;
        let frame_size = ((slots as u32 * SLOT_SIZE as u32) + 15) & !15;
        FrameLayout {
            frame_base: target.frame_base,
            stack_pointer: target.stack_pointer,
            pointer_size: target.pointer_size,
            saved,
            homes: allocation.homes.clone(),
            arg_slots,
            max_stack,
            outgoing_slots,
            frame_size,
        }
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn saved(&self) -> &[Reg] {
        &self.saved
    }

    pub fn homes(&self) -> &[Home] {
        &self.homes
    }

    pub fn home(&self, local: u16) -> Home {
        self.homes[local as usize]
    }

    pub fn outgoing_slots(&self) -> u16 {
        self.outgoing_slots
    }

    fn max_locals(&self) -> i32 {
        self.homes.len() as i32
    }

    fn below_base(&self, slot: i32) -> Mem {
        Mem::new(self.frame_base, -SLOT_SIZE * (slot + 1))
    }

    pub fn save_mem(&self, k: usize) -> Mem {
        self.below_base(k as i32)
    }

    pub fn incoming_mem(&self, arg: u16) -> Mem {
        Mem::new(self.frame_base, INCOMING_BASE + SLOT_SIZE * arg as i32)
    }

    /// Frame slot of a local; register-homed locals still own one
    pub fn local_mem(&self, local: u16) -> Mem {
        if local < self.arg_slots && self.home(local) == Home::Frame {
            return self.incoming_mem(local);
        }
        self.below_base(self.saved.len() as i32 + local as i32)
    }

    pub fn stack_mem(&self, slot: u16) -> Mem {
        debug_assert!(slot < self.max_stack.max(1));
        self.below_base(self.saved.len() as i32 + self.max_locals() + slot as i32)
    }

    pub fn outgoing_mem(&self, arg: u16) -> Mem {
        debug_assert!(arg < self.outgoing_slots);
        Mem::new(self.stack_pointer, SLOT_SIZE * arg as i32)
    }

    pub fn local_location(&self, local: u16) -> SlotLocation {
        match self.home(local) {
            Home::Register(reg) => SlotLocation::Register(reg),
            Home::Frame => SlotLocation::Frame(self.local_mem(local).disp),
        }
    }

    pub fn stack_location(&self, slot: u16) -> SlotLocation {
        SlotLocation::Frame(self.stack_mem(slot).disp)
    }

    /// Access width of a value of type `ty`
    pub fn width(&self, ty: ValueType) -> Width {
        match ty {
            ValueType::Int | ValueType::Float => Width::W32,
            ValueType::Long | ValueType::Double => Width::W64,
            ValueType::Ref | ValueType::ReturnAddress => self.pointer_width(),
        }
    }

    pub fn pointer_width(&self) -> Width {
        if self.pointer_size == 8 {
            Width::W64
        } else {
            Width::W32
        }
    }

    pub fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            arg_slots: self.arg_slots,
            max_locals: self.homes.len() as u16,
            max_stack: self.max_stack,
            frame_size: self.frame_size,
            saved: self
                .saved
                .iter()
                .enumerate()
                .map(|(k, &reg)| (reg, self.save_mem(k).disp))
                .collect(),
            locals: (0..self.homes.len() as u16)
                .map(|local| self.local_location(local))
                .collect(),
        }
    }
}
