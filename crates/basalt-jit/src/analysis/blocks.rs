//! Basic-block discovery
//!
//! One linear pass decodes the method, collects leaders and per-local def/use
//! statistics, and validates every target. A second pass walks the reachable
//! instructions with an explicit stack, assigning sequential ids and
//! incoming-edge reference counts.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::{ExceptionEntry, MethodSource, Opcode, ValueType};

use super::decoder::{decode_method, DecodeError, InstrFlags, InstructionDescriptor};

/// Code generation progress of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPhase {
    /// No work item has referenced the block yet
    Unreached,
    /// At least one work item for the block is queued
    Pending,
    /// Entry state is being established from the parent
    Merging,
    /// Native code is being emitted
    Emitting,
    /// Code is final; the block is never generated again
    Sealed,
}

/// Per-leader block record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlockInfo {
    /// Leader PC
    pub start: u32,
    /// PC of the last instruction
    pub last_pc: u32,
    /// Leader PC of the following block, or the code length for the last block
    pub next_block: u32,
    pub phase: BlockPhase,
    pub is_handler: bool,
    pub is_subroutine: bool,
    /// Incoming edges from reachable code; 0 = unreachable
    pub ref_count: u32,
    /// Offset in the scratch buffer once generated
    pub scratch_offset: u32,
    /// Bytes of native code once generated
    pub code_size: u32,
    /// Offset in the final code block once laid out
    pub final_offset: Option<u32>,
    /// Operand stack depth on entry once generated
    pub entry_depth: Option<u16>,
    /// Operand stack types on entry once generated, bottom first
    pub entry_types: Vec<ValueType>,
}

impl BasicBlockInfo {
    fn new(start: u32, last_pc: u32, next_block: u32) -> Self {
        BasicBlockInfo {
            start,
            last_pc,
            next_block,
            phase: BlockPhase::Unreached,
            is_handler: false,
            is_subroutine: false,
            ref_count: 0,
            scratch_offset: 0,
            code_size: 0,
            final_offset: None,
            entry_depth: None,
            entry_types: Vec::new(),
        }
    }

    pub fn processed(&self) -> bool {
        self.phase == BlockPhase::Sealed
    }

    pub fn is_reachable(&self) -> bool {
        self.ref_count > 0
    }

    /// PC range `[start, next_block)` covered by the block
    pub fn pc_range(&self) -> std::ops::Range<u32> {
        self.start..self.next_block
    }
}

/// Best-effort static type of a local slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// Never accessed
    Unknown,
    Typed(ValueType),
    /// Accessed with disagreeing types; permanent
    Conflict,
}

impl SlotType {
    fn merge(self, ty: ValueType) -> SlotType {
        match self {
            SlotType::Unknown => SlotType::Typed(ty),
            SlotType::Typed(existing) if existing == ty => self,
            _ => SlotType::Conflict,
        }
    }

    pub fn value_type(self) -> Option<ValueType> {
        match self {
            SlotType::Typed(ty) => Some(ty),
            _ => None,
        }
    }
}

/// Def/use statistics for one local slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarUsage {
    pub defs: u32,
    pub uses: u32,
    pub ty: SlotType,
}

impl VarUsage {
    pub fn weight(&self) -> u32 {
        self.defs + self.uses
    }
}

impl Default for VarUsage {
    fn default() -> Self {
        VarUsage {
            defs: 0,
            uses: 0,
            ty: SlotType::Unknown,
        }
    }
}

/// Result of discovery for one method
#[derive(Debug, Clone)]
pub struct MethodAnalysis {
    pub code_len: u32,
    /// Instructions in PC order
    pub instrs: Vec<InstructionDescriptor>,
    pc_index: FxHashMap<u32, usize>,
    /// Blocks in leader-PC order; they partition `[0, code_len)`
    pub blocks: Vec<BasicBlockInfo>,
    block_index: FxHashMap<u32, usize>,
    /// Usage per local slot, `max_locals` entries
    pub vars: Vec<VarUsage>,
    pub handlers: Vec<ExceptionEntry>,
    /// Number of reachable instructions
    pub reachable: u32,
}

impl MethodAnalysis {
    pub fn instr_index(&self, pc: u32) -> Option<usize> {
        self.pc_index.get(&pc).copied()
    }

    pub fn instr_at(&self, pc: u32) -> Option<&InstructionDescriptor> {
        self.instr_index(pc).map(|i| &self.instrs[i])
    }

    pub fn is_leader(&self, pc: u32) -> bool {
        self.block_index.contains_key(&pc)
    }

    pub fn block(&self, pc: u32) -> Option<&BasicBlockInfo> {
        self.block_index.get(&pc).map(|&i| &self.blocks[i])
    }

    pub fn block_mut(&mut self, pc: u32) -> Option<&mut BasicBlockInfo> {
        self.block_index.get(&pc).map(|&i| &mut self.blocks[i])
    }

    /// Block whose PC range contains `pc`
    pub fn block_containing(&self, pc: u32) -> Option<&BasicBlockInfo> {
        let idx = self.blocks.partition_point(|b| b.start <= pc);
        idx.checked_sub(1)
            .map(|i| &self.blocks[i])
            .filter(|b| pc < b.next_block)
    }

    /// Instructions of the block led by `start`, in PC order
    pub fn block_instrs(&self, start: u32) -> &[InstructionDescriptor] {
        let block = self
            .block(start)
            .unwrap_or_else(|| panic!("pc {start} is not a block leader"));
        let first = self.pc_index[&block.start];
        let last = self.pc_index[&block.last_pc];
        &self.instrs[first..=last]
    }

    /// Indices into `instrs` of the block led by `start`
    pub fn block_instr_range(&self, start: u32) -> std::ops::RangeInclusive<usize> {
        let block = self
            .block(start)
            .unwrap_or_else(|| panic!("pc {start} is not a block leader"));
        self.pc_index[&block.start]..=self.pc_index[&block.last_pc]
    }

    pub fn leaders(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().map(|b| b.start)
    }
}

/// Discover basic blocks, local usage and reachability for a method
pub fn discover(method: &dyn MethodSource) -> Result<MethodAnalysis, DecodeError> {
    let code = method.code();
    let max_locals = method.max_locals();
    let params = &method.signature().params;
    if params.len() > max_locals as usize {
        return Err(DecodeError::TooManyParams {
            params: params.len(),
            max_locals,
        });
    }

    // Step 1: Decode the whole method
    let mut instrs = decode_method(code)?;
    let code_len = code.len() as u32;
    let pc_index: FxHashMap<u32, usize> =
        instrs.iter().enumerate().map(|(i, instr)| (instr.pc, i)).collect();

    // Step 2: Collect leaders and validate targets and locals
    let mut leaders: FxHashSet<u32> = FxHashSet::default();
    let mut subroutine_targets: FxHashSet<u32> = FxHashSet::default();
    leaders.insert(0);
    for instr in &instrs {
        for target in instr.targets() {
            if !pc_index.contains_key(&target) {
                return Err(DecodeError::BadTarget {
                    pc: instr.pc,
                    target: target as i64,
                });
            }
            leaders.insert(target);
        }
        if instr.flags.contains(InstrFlags::ENDS_BLOCK) && instr.next_pc < code_len {
            leaders.insert(instr.next_pc);
        }
        if instr.opcode == Opcode::Jsr {
            subroutine_targets.extend(instr.targets());
        }
        if let Some(access) = instr.var {
            if access.index >= max_locals {
                return Err(DecodeError::LocalOutOfRange {
                    pc: instr.pc,
                    index: access.index,
                    max_locals,
                });
            }
        }
    }

    let handlers = method.exception_table().to_vec();
    let mut handler_pcs: FxHashSet<u32> = FxHashSet::default();
    for (i, entry) in handlers.iter().enumerate() {
        let on_boundary = |pc: u32| pc_index.contains_key(&pc);
        let end_ok = entry.end_pc == code_len || on_boundary(entry.end_pc);
        if entry.start_pc >= entry.end_pc
            || !on_boundary(entry.start_pc)
            || !end_ok
            || !on_boundary(entry.handler_pc)
        {
            return Err(DecodeError::BadHandler(i));
        }
        leaders.insert(entry.handler_pc);
        handler_pcs.insert(entry.handler_pc);
    }

    for instr in &mut instrs {
        if leaders.contains(&instr.pc) {
            instr.flags.insert(InstrFlags::STARTS_BLOCK);
        }
    }

    // Step 3: Accumulate per-slot def/use counts and types
    let mut vars = vec![VarUsage::default(); max_locals as usize];
    for (slot, &ty) in params.iter().enumerate() {
        vars[slot].defs += 1;
        vars[slot].ty = vars[slot].ty.merge(ty);
    }
    for instr in &instrs {
        let Some(access) = instr.var else { continue };
        // The first store of a subroutine saves the return address
        let ty = if instr.opcode == Opcode::Astore && subroutine_targets.contains(&instr.pc) {
            ValueType::ReturnAddress
        } else {
            access.ty
        };
        let usage = &mut vars[access.index as usize];
        if access.defines {
            usage.defs += 1;
        }
        if access.uses {
            usage.uses += 1;
        }
        usage.ty = usage.ty.merge(ty);
    }

    // Step 4: Build blocks in leader order
    let mut sorted: Vec<u32> = leaders.into_iter().collect();
    sorted.sort_unstable();
    let mut blocks = Vec::with_capacity(sorted.len());
    for (i, &start) in sorted.iter().enumerate() {
        let next_block = sorted.get(i + 1).copied().unwrap_or(code_len);
        // Every leader is an instruction boundary, so the block is never empty
        let last_idx = instrs.partition_point(|instr| instr.pc < next_block) - 1;
        let mut block = BasicBlockInfo::new(start, instrs[last_idx].pc, next_block);
        block.is_subroutine = subroutine_targets.contains(&start);
        block.is_handler = handler_pcs.contains(&start);
        blocks.push(block);
    }
    let block_index: FxHashMap<u32, usize> =
        blocks.iter().enumerate().map(|(i, b)| (b.start, i)).collect();

    // Step 5: Reachability from the entry and every handler
    let mut work: Vec<usize> = Vec::new();
    let mut seq = 0u32;
    let mut visit = |instrs: &mut [InstructionDescriptor], idx: usize, work: &mut Vec<usize>| {
        instrs[idx].ref_count += 1;
        if instrs[idx].seq_id == 0 {
            seq += 1;
            instrs[idx].seq_id = seq;
            work.push(idx);
        }
    };
    for entry in handlers.iter().rev() {
        visit(&mut instrs, pc_index[&entry.handler_pc], &mut work);
    }
    visit(&mut instrs, 0, &mut work);

    while let Some(idx) = work.pop() {
        let instr = &instrs[idx];
        let mut successors = instr.targets();
        if instr.falls_through() && instr.next_pc < code_len {
            successors.push(instr.next_pc);
        }
        for target in successors {
            visit(&mut instrs, pc_index[&target], &mut work);
        }
    }

    let mut reachable = 0;
    for block in &mut blocks {
        block.ref_count = instrs[pc_index[&block.start]].ref_count;
    }
    for instr in &instrs {
        if instr.is_reachable() {
            reachable += 1;
        }
    }

    Ok(MethodAnalysis {
        code_len,
        instrs,
        pc_index,
        blocks,
        block_index,
        vars,
        handlers,
        reachable,
    })
}
