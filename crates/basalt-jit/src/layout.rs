//! Code layout
//!
//! Generation writes blocks into one scratch buffer in traversal order.
//! Layout assigns final offsets in increasing leader-PC order, copies sealed
//! blocks contiguously behind the prologue, and builds the PC map.

use crate::analysis::{BlockPhase, MethodAnalysis};
use crate::info::PcMap;

/// Assign a final offset to every sealed block; returns the total code size
///
/// The prologue occupies `[0, prologue_size)` and falls into the entry block,
/// which is always first in PC order.
pub fn assign_offsets(analysis: &mut MethodAnalysis, prologue_size: u32) -> u32 {
    let mut offset = prologue_size;
    for block in &mut analysis.blocks {
        if block.phase != BlockPhase::Sealed {
            continue;
        }
        assert!(
            block.final_offset.is_none(),
            "block {} laid out twice",
            block.start
        );
        block.final_offset = Some(offset);
        offset += block.code_size;
    }
    offset
}

/// Copy the prologue and every sealed block from scratch into final memory
pub fn copy_blocks(analysis: &MethodAnalysis, scratch: &[u8], prologue_size: u32, out: &mut [u8]) {
    let prologue = prologue_size as usize;
    out[..prologue].copy_from_slice(&scratch[..prologue]);
    for block in &analysis.blocks {
        let Some(dest) = block.final_offset else {
            continue;
        };
        let src = block.scratch_offset as usize;
        let len = block.code_size as usize;
        let dest = dest as usize;
        out[dest..dest + len].copy_from_slice(&scratch[src..src + len]);
    }
}

/// Build the PC map from the scratch offsets recorded per instruction
///
/// `instr_offsets` is indexed like `analysis.instrs`; `None` marks
/// instructions that were never generated.
pub fn build_pc_map(analysis: &MethodAnalysis, instr_offsets: &[Option<u32>], code_size: u32) -> PcMap {
    let mut live = Vec::with_capacity(analysis.reachable as usize);
    for block in &analysis.blocks {
        let Some(final_offset) = block.final_offset else {
            continue;
        };
        for idx in analysis.block_instr_range(block.start) {
            let Some(scratch) = instr_offsets[idx] else {
                continue;
            };
            let instr = &analysis.instrs[idx];
            let offset = final_offset + (scratch - block.scratch_offset);
            live.push((instr.pc, instr.next_pc, offset));
        }
    }
    PcMap::build(analysis.code_len, code_size, live)
}
