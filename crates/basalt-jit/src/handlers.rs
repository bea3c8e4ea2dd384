//! Exception-handler resolution
//!
//! Catch types are resolved before generation so a failure aborts the
//! compilation before any code exists. After layout each protected region is
//! mapped to native offsets; regions with no live code are dropped.

use crate::analysis::MethodAnalysis;
use crate::bytecode::{CatchType, ExceptionEntry, MethodSource, Opcode, ResolveError};
use crate::info::PcMap;

/// Exception table entry with its catch type resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedHandler {
    pub entry: ExceptionEntry,
    /// `None` catches everything
    pub catch_type: Option<CatchType>,
}

/// Handler entry in native terms; offsets are relative to the code block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeHandler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub catch_type: Option<CatchType>,
    /// The handler discards the caught object immediately
    pub exception_dead: bool,
}

impl NativeHandler {
    pub fn covers(&self, offset: u32) -> bool {
        (self.start..self.end).contains(&offset)
    }
}

/// Resolve every catch type of the exception table
pub fn resolve_catch_types(method: &dyn MethodSource) -> Result<Vec<ResolvedHandler>, ResolveError> {
    method
        .exception_table()
        .iter()
        .map(|&entry| {
            let catch_type = entry
                .catch_type
                .map(|index| method.resolve_catch_type(index))
                .transpose()?;
            Ok(ResolvedHandler { entry, catch_type })
        })
        .collect()
}

/// Map resolved handlers to native offsets, dropping regions without live code
pub fn resolve_native(
    handlers: &[ResolvedHandler],
    analysis: &MethodAnalysis,
    pc_map: &PcMap,
) -> Vec<NativeHandler> {
    let mut native = Vec::with_capacity(handlers.len());
    for resolved in handlers {
        let entry = &resolved.entry;
        let Some((_, start)) = pc_map.first_live_in(entry.start_pc..entry.end_pc) else {
            tracing::debug!(
                start_pc = entry.start_pc,
                end_pc = entry.end_pc,
                "dropping handler with dead protected region"
            );
            continue;
        };
        let end = pc_map.native_offset(entry.end_pc).unwrap_or(pc_map.code_size());
        let handler = analysis
            .block(entry.handler_pc)
            .and_then(|block| block.final_offset)
            .unwrap_or_else(|| panic!("handler at pc {} was not generated", entry.handler_pc));
        let exception_dead = analysis
            .instr_at(entry.handler_pc)
            .is_some_and(|instr| instr.opcode == Opcode::Pop);

        native.push(NativeHandler {
            start,
            end,
            handler,
            catch_type: resolved.catch_type,
            exception_dead,
        });
    }
    native
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::discover;
    use crate::bytecode::{BytecodeBuilder, ConstantPool, Method, MethodId};

    fn entry(start_pc: u32, end_pc: u32, handler_pc: u32, catch_type: Option<u16>) -> ExceptionEntry {
        ExceptionEntry {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        }
    }

    #[test]
    fn test_resolve_catch_types() {
        let mut pool = ConstantPool::new();
        let idx = pool.add_catch_type(CatchType(42));
        let method = Method::new(MethodId(1), "t", vec![Opcode::Return as u8])
            .with_pool(pool)
            .with_handler(entry(0, 1, 0, Some(idx)))
            .with_handler(entry(0, 1, 0, None));
        let resolved = resolve_catch_types(&method).unwrap();
        assert_eq!(resolved[0].catch_type, Some(CatchType(42)));
        assert_eq!(resolved[1].catch_type, None);
    }

    #[test]
    fn test_unresolvable_catch_type() {
        let method = Method::new(MethodId(1), "t", vec![Opcode::Return as u8])
            .with_handler(entry(0, 1, 0, Some(5)));
        assert!(resolve_catch_types(&method).is_err());
    }

    #[test]
    fn test_native_mapping() {
        // 0: nop  1: return  2: pop  3: return ; 4: nop 5: return (dead)
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Nop).op(Opcode::Return);
        b.op(Opcode::Pop).op(Opcode::Return);
        b.op(Opcode::Nop).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(0, 1)
            .with_handler(entry(0, 2, 2, None))
            .with_handler(entry(4, 6, 2, None));
        let mut analysis = discover(&method).unwrap();
        analysis.block_mut(0).unwrap().final_offset = Some(0);
        analysis.block_mut(2).unwrap().final_offset = Some(10);
        let pc_map = PcMap::build(6, 20, vec![(0, 1, 0), (1, 2, 2), (2, 3, 10), (3, 4, 14)]);

        let resolved = resolve_catch_types(&method).unwrap();
        let native = resolve_native(&resolved, &analysis, &pc_map);
        assert_eq!(native.len(), 1);
        assert_eq!(native[0].start, 0);
        assert_eq!(native[0].end, 10);
        assert_eq!(native[0].handler, 10);
        assert!(native[0].exception_dead);
        assert!(native[0].covers(2));
        assert!(!native[0].covers(10));
    }
}
