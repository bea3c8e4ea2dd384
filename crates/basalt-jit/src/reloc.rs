//! Deferred code references and the relocation patcher
//!
//! During generation every reference to a bytecode PC is emitted as a
//! placeholder field and recorded as a [`PendingRelocation`]. Once blocks have
//! final offsets, [`Patcher::apply`] rewrites every field in one pass and
//! fills the switch tables in the data block.

use rustc_hash::FxHashMap;

use crate::analysis::MethodAnalysis;

/// Payload bit marking a reference to a switch table instead of a PC
pub const SWITCH_TABLE_TAG: u32 = 1 << 31;

/// What a relocation field refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocTarget {
    /// Native address of the instruction at a PC
    Pc(u32),
    /// Address of the table for the switch at a PC
    SwitchTable(u32),
}

impl RelocTarget {
    pub fn encode(self) -> u32 {
        match self {
            RelocTarget::Pc(pc) => {
                debug_assert!(pc & SWITCH_TABLE_TAG == 0);
                pc
            }
            RelocTarget::SwitchTable(pc) => pc | SWITCH_TABLE_TAG,
        }
    }

    pub fn decode(payload: u32) -> Self {
        if payload & SWITCH_TABLE_TAG != 0 {
            RelocTarget::SwitchTable(payload & !SWITCH_TABLE_TAG)
        } else {
            RelocTarget::Pc(payload)
        }
    }
}

/// Encoding of a relocation field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Signed 32-bit displacement from the end of the field
    PcRel32,
    /// Absolute 64-bit address
    Abs64,
}

impl RelocKind {
    pub fn field_size(self) -> usize {
        match self {
            RelocKind::PcRel32 => 4,
            RelocKind::Abs64 => 8,
        }
    }
}

/// A field recorded by the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRelocation {
    /// Scratch-buffer offset of the field
    pub offset: u32,
    pub kind: RelocKind,
    /// Encoded [`RelocTarget`]
    pub payload: u32,
}

impl PendingRelocation {
    pub fn new(offset: u32, kind: RelocKind, target: RelocTarget) -> Self {
        PendingRelocation {
            offset,
            kind,
            payload: target.encode(),
        }
    }

    pub fn target(&self) -> RelocTarget {
        RelocTarget::decode(self.payload)
    }
}

/// Relocation tagged with the leader PC of the block that emitted it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRelocation {
    pub block: u32,
    pub reloc: PendingRelocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SwitchTable {
    pc: u32,
    cases: Vec<u32>,
}

/// Jump tables of a method, laid out back to back in the data block
#[derive(Debug, Clone, Default)]
pub struct SwitchTables {
    tables: Vec<SwitchTable>,
    index: FxHashMap<u32, usize>,
}

impl SwitchTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the case targets of the switch at `pc`
    pub fn add(&mut self, pc: u32, cases: Vec<u32>) {
        let previous = self.index.insert(pc, self.tables.len());
        assert!(previous.is_none(), "switch at pc {pc} registered twice");
        self.tables.push(SwitchTable { pc, cases });
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Size of all tables in bytes
    pub fn byte_len(&self, pointer_size: u8) -> usize {
        self.tables.iter().map(|t| t.cases.len()).sum::<usize>() * pointer_size as usize
    }

    /// Offset of the table for the switch at `pc` within the data block
    pub fn table_offset(&self, pc: u32, pointer_size: u8) -> Option<usize> {
        let idx = *self.index.get(&pc)?;
        let entries: usize = self.tables[..idx].iter().map(|t| t.cases.len()).sum();
        Some(entries * pointer_size as usize)
    }

    pub fn cases(&self, pc: u32) -> Option<&[u32]> {
        self.index.get(&pc).map(|&i| self.tables[i].cases.as_slice())
    }
}

/// Resolves relocations against laid-out blocks
pub struct Patcher<'a> {
    pub analysis: &'a MethodAnalysis,
    pub tables: &'a SwitchTables,
    pub code_base: u64,
    pub data_base: u64,
    pub pointer_size: u8,
}

impl Patcher<'_> {
    /// Final code offset of the instruction at a block leader
    fn block_offset(&self, pc: u32) -> u32 {
        let block = self
            .analysis
            .block(pc)
            .unwrap_or_else(|| panic!("relocation target pc {pc} is not a block leader"));
        block
            .final_offset
            .unwrap_or_else(|| panic!("relocation target pc {pc} is dead code"))
    }

    /// Final code offset of a scratch-buffer position inside `block`
    fn field_offset(&self, block: u32, scratch: u32) -> u32 {
        let info = self
            .analysis
            .block(block)
            .unwrap_or_else(|| panic!("relocation from unknown block {block}"));
        debug_assert!(scratch >= info.scratch_offset);
        self.block_offset(block) + (scratch - info.scratch_offset)
    }

    fn target_address(&self, target: RelocTarget) -> u64 {
        match target {
            RelocTarget::Pc(pc) => self.code_base + self.block_offset(pc) as u64,
            RelocTarget::SwitchTable(pc) => {
                let offset = self
                    .tables
                    .table_offset(pc, self.pointer_size)
                    .unwrap_or_else(|| panic!("no switch table for pc {pc}"));
                self.data_base + offset as u64
            }
        }
    }

    /// Rewrite every relocation field in `code` and fill the switch tables
    pub fn apply(&self, code: &mut [u8], data: Option<&mut [u8]>, relocs: &[BlockRelocation]) {
        for entry in relocs {
            let field = self.field_offset(entry.block, entry.reloc.offset) as usize;
            let target = self.target_address(entry.reloc.target());
            match entry.reloc.kind {
                RelocKind::PcRel32 => {
                    let field_end = self.code_base + field as u64 + 4;
                    let rel = i32::try_from(target as i64 - field_end as i64)
                        .expect("displacement exceeds 32 bits");
                    code[field..field + 4].copy_from_slice(&rel.to_le_bytes());
                }
                RelocKind::Abs64 => {
                    code[field..field + 8].copy_from_slice(&target.to_le_bytes());
                }
            }
        }

        if let Some(data) = data {
            let size = self.pointer_size as usize;
            let mut at = 0;
            for table in &self.tables.tables {
                for &case in &table.cases {
                    let address = self.code_base + self.block_offset(case) as u64;
                    data[at..at + size].copy_from_slice(&address.to_le_bytes()[..size]);
                    at += size;
                }
            }
        }
    }
}
