//! Compiled-method artifacts
//!
//! Everything the runtime consumes after compilation: the frame descriptor,
//! the bidirectional PC map, per-safepoint GC roots, the native handler table
//! and the serialized info block.

use crate::bytecode::MethodId;
use crate::handlers::NativeHandler;
use crate::runtime::NativeBlock;
use crate::target::Reg;

/// Register or frame-base-relative stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotLocation {
    Register(Reg),
    /// Displacement from the frame base
    Frame(i32),
}

/// Stack-frame shape of a compiled method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Incoming argument slots
    pub arg_slots: u16,
    pub max_locals: u16,
    pub max_stack: u16,
    /// Bytes reserved below the frame base
    pub frame_size: u32,
    /// Callee-saved registers and the frame displacement they are saved at
    pub saved: Vec<(Reg, i32)>,
    /// Location of every local slot
    pub locals: Vec<SlotLocation>,
}

/// A GC-visible reference at a safepoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRoot {
    pub location: SlotLocation,
    /// The slot may hold a non-reference; scan it conservatively
    pub conservative: bool,
}

/// GC roots live across one call or poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Safepoint {
    /// Native offset of the return point
    pub offset: u32,
    pub pc: u32,
    pub roots: Vec<GcRoot>,
}

/// Safepoints sorted by native offset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafepointMap {
    entries: Vec<Safepoint>,
}

impl SafepointMap {
    pub fn new(mut entries: Vec<Safepoint>) -> Self {
        entries.sort_by_key(|s| s.offset);
        SafepointMap { entries }
    }

    pub fn lookup(&self, offset: u32) -> Option<&Safepoint> {
        self.entries
            .binary_search_by_key(&offset, |s| s.offset)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn entries(&self) -> &[Safepoint] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bidirectional map between bytecode PCs and native code offsets
///
/// Total over `[0, code_len]`: live PCs map to their instruction, dead PCs to
/// the next live instruction (or to no code), and `code_len` to the end of the
/// code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcMap {
    code_len: u32,
    code_size: u32,
    entries: Vec<Option<u32>>,
    /// Live instruction PCs and their offsets, in PC order
    live: Vec<(u32, u32)>,
}

impl PcMap {
    /// Build from `(pc, next_pc, offset)` of every generated instruction
    pub fn build(code_len: u32, code_size: u32, mut live: Vec<(u32, u32, u32)>) -> Self {
        live.sort_unstable_by_key(|&(pc, _, _)| pc);
        let mut entries = vec![None; code_len as usize + 1];
        for &(pc, next_pc, offset) in &live {
            for entry in &mut entries[pc as usize..next_pc as usize] {
                *entry = Some(offset);
            }
        }

        // Bridge dead PCs to the next live instruction
        let mut next = None;
        for entry in entries[..code_len as usize].iter_mut().rev() {
            match entry {
                Some(offset) => next = Some(*offset),
                None => *entry = next,
            }
        }
        entries[code_len as usize] = Some(code_size);

        PcMap {
            code_len,
            code_size,
            entries,
            live: live.into_iter().map(|(pc, _, off)| (pc, off)).collect(),
        }
    }

    pub fn code_len(&self) -> u32 {
        self.code_len
    }

    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    /// Native offset for any PC in `[0, code_len]`
    pub fn native_offset(&self, pc: u32) -> Option<u32> {
        self.entries.get(pc as usize).copied().flatten()
    }

    /// Native offset of a live instruction starting at `pc`
    pub fn live_offset(&self, pc: u32) -> Option<u32> {
        self.live
            .binary_search_by_key(&pc, |&(p, _)| p)
            .ok()
            .map(|i| self.live[i].1)
    }

    /// First live instruction in `range`
    pub fn first_live_in(&self, range: std::ops::Range<u32>) -> Option<(u32, u32)> {
        let idx = self.live.partition_point(|&(pc, _)| pc < range.start);
        self.live.get(idx).copied().filter(|&(pc, _)| pc < range.end)
    }

    /// PC of the instruction covering a native offset
    pub fn pc_at(&self, offset: u32) -> Option<u32> {
        if offset >= self.code_size {
            return None;
        }
        let idx = self.live.partition_point(|&(_, off)| off <= offset);
        idx.checked_sub(1).map(|i| self.live[i].0)
    }

    pub fn live(&self) -> &[(u32, u32)] {
        &self.live
    }
}

/// Metadata serialized into the info block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub frame: FrameDescriptor,
    pub pc_map: PcMap,
    pub safepoints: SafepointMap,
}

/// Info block magic
pub const INFO_MAGIC: [u8; 4] = *b"BINF";
pub const INFO_VERSION: u16 = 1;

impl MethodInfo {
    /// Serialize into the info-block format
    ///
    /// Layout (little-endian): magic, version, frame descriptor, PC map
    /// (`code_len`, `code_size`, live pairs), safepoints with their roots.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = InfoWriter::default();
        w.bytes(&INFO_MAGIC);
        w.u16(INFO_VERSION);

        let frame = &self.frame;
        w.u16(frame.arg_slots);
        w.u16(frame.max_locals);
        w.u16(frame.max_stack);
        w.u32(frame.frame_size);
        w.u16(frame.saved.len() as u16);
        for &(reg, disp) in &frame.saved {
            w.location(SlotLocation::Register(reg));
            w.i32(disp);
        }
        w.u16(frame.locals.len() as u16);
        for &location in &frame.locals {
            w.location(location);
        }

        w.u32(self.pc_map.code_len);
        w.u32(self.pc_map.code_size);
        w.u32(self.pc_map.live.len() as u32);
        for &(pc, offset) in &self.pc_map.live {
            w.u32(pc);
            w.u32(offset);
        }

        w.u32(self.safepoints.len() as u32);
        for sp in self.safepoints.entries() {
            w.u32(sp.offset);
            w.u32(sp.pc);
            w.u16(sp.roots.len() as u16);
            for root in &sp.roots {
                w.location(root.location);
                w.bytes(&[root.conservative as u8]);
            }
        }
        w.buf
    }
}

#[derive(Default)]
struct InfoWriter {
    buf: Vec<u8>,
}

impl InfoWriter {
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn location(&mut self, location: SlotLocation) {
        match location {
            SlotLocation::Register(reg) => {
                let float_bit = if reg.is_float() { 0x80 } else { 0 };
                self.bytes(&[0, reg.num | float_bit]);
            }
            SlotLocation::Frame(disp) => {
                self.bytes(&[1]);
                self.i32(disp);
            }
        }
    }
}

/// An installed method; immutable and shared once committed
#[derive(Debug)]
pub struct CompiledMethod {
    pub id: MethodId,
    pub name: String,
    pub code: NativeBlock,
    /// Switch tables, when the method has any
    pub data: Option<NativeBlock>,
    pub info_block: NativeBlock,
    pub info: MethodInfo,
    pub handlers: Vec<NativeHandler>,
}

impl CompiledMethod {
    pub fn entry_address(&self) -> u64 {
        self.code.address()
    }

    pub fn code_bytes(&self) -> &[u8] {
        self.code.bytes()
    }

    /// Native address for a PC in `[0, code_len]`
    pub fn address_of_pc(&self, pc: u32) -> Option<u64> {
        self.info
            .pc_map
            .native_offset(pc)
            .map(|off| self.code.address() + off as u64)
    }

    /// PC of the instruction covering a native address
    pub fn pc_at_address(&self, address: u64) -> Option<u32> {
        let offset = address.checked_sub(self.code.address())?;
        self.info.pc_map.pc_at(u32::try_from(offset).ok()?)
    }
}
