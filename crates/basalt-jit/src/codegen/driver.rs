//! Work-stack code generation driver
//!
//! Blocks are generated depth-first from an explicit stack of work items.
//! Each item names the block to generate and the parent whose exit state it
//! starts from. A block is generated at most once; later items that reach a
//! sealed block only release their claim on the parent's exit state and
//! check that the entry stacks agree.

use rustc_hash::FxHashMap;

use crate::analysis::{BlockPhase, InstructionDescriptor, MethodAnalysis, Operands, SlotType};
use crate::bytecode::{Opcode, Signature, ValueType};
use crate::config::JitConfig;
use crate::error::JitError;
use crate::info::{GcRoot, Safepoint};
use crate::masm::{MacroAssembler, Width};
use crate::reloc::{BlockRelocation, SwitchTables};
use crate::regalloc::Home;
use crate::target::TargetInfo;

use super::frame::FrameLayout;
use super::state::BlockState;
use super::symbols::Symbols;
use super::translate::FLUSH;

/// Where a work item takes its entry state from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// Method entry
    Entry,
    /// Exception-handler entry
    Handler,
    /// Exit state of the block led by this PC
    Block(u32),
    /// Continuation after the `jsr` at `caller` into subroutine `leader`
    SubroutineExit { leader: u32, caller: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub pc: u32,
    pub parent: Parent,
    /// Leader of the subroutine the block is generated in
    pub subroutine: Option<u32>,
}

/// How control leaves a block
#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockExit {
    Fallthrough(u32),
    Branch { target: u32, fallthrough: u32 },
    Goto(u32),
    Jsr { target: u32, continuation: u32 },
    Ret,
    Switch { default: u32, cases: Vec<u32> },
    Return,
    Throw,
}

impl BlockExit {
    fn classify(last: &InstructionDescriptor, next_block: u32) -> Self {
        let op = last.opcode;
        match (&last.operands, op) {
            (&Operands::Branch(target), Opcode::Goto) => BlockExit::Goto(target),
            (&Operands::Branch(target), Opcode::Jsr) => BlockExit::Jsr {
                target,
                continuation: last.next_pc,
            },
            (&Operands::Branch(target), _) if op.is_conditional_branch() => BlockExit::Branch {
                target,
                fallthrough: last.next_pc,
            },
            (_, Opcode::Ret) => BlockExit::Ret,
            (_, Opcode::Athrow) => BlockExit::Throw,
            (_, _) if op.is_return() => BlockExit::Return,
            (_, Opcode::Tableswitch | Opcode::Lookupswitch) => {
                let mut targets = last.targets();
                let default = targets.remove(0);
                BlockExit::Switch {
                    default,
                    cases: targets,
                }
            }
            (_, _) if !op.is_terminator() => BlockExit::Fallthrough(next_block),
            _ => panic!("no exit classification for {} at pc {}", op, last.pc),
        }
    }
}

/// Safepoint recorded during generation, relative to its block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSafepoint {
    pub block: u32,
    /// Scratch offset of the return point
    pub offset: u32,
    pub pc: u32,
    pub roots: Vec<GcRoot>,
}

impl PendingSafepoint {
    /// Rebase onto the final offset of its laid-out block
    pub fn finalize(self, analysis: &MethodAnalysis) -> Safepoint {
        let block = analysis
            .block(self.block)
            .unwrap_or_else(|| panic!("safepoint in unknown block {}", self.block));
        let base = block
            .final_offset
            .unwrap_or_else(|| panic!("safepoint in block {} that was not laid out", self.block));
        Safepoint {
            offset: base + (self.offset - block.scratch_offset),
            pc: self.pc,
            roots: self.roots,
        }
    }
}

/// Everything generation produces for layout
#[derive(Debug)]
pub struct CodegenOutput {
    pub scratch: Vec<u8>,
    pub prologue_size: u32,
    pub relocations: Vec<BlockRelocation>,
    pub safepoints: Vec<PendingSafepoint>,
    pub switch_tables: SwitchTables,
    /// Scratch offset per instruction, indexed like the analysis
    pub instr_offsets: Vec<Option<u32>>,
}

pub struct CodeGenerator<'a, A: MacroAssembler> {
    pub(super) asm: A,
    pub(super) target: &'a TargetInfo,
    pub(super) config: &'a JitConfig,
    pub(super) analysis: &'a mut MethodAnalysis,
    pub(super) frame: &'a FrameLayout,
    pub(super) symbols: &'a Symbols,
    signature: &'a Signature,
    max_stack: u16,
    work: Vec<WorkItem>,
    /// Exit state per block and the number of items still to consume it
    exits: FxHashMap<u32, (BlockState, u32)>,
    /// Exit state at `ret`, per subroutine leader
    snapshots: FxHashMap<u32, BlockState>,
    pub(super) relocations: Vec<BlockRelocation>,
    pub(super) safepoints: Vec<PendingSafepoint>,
    pub(super) tables: SwitchTables,
    instr_offsets: Vec<Option<u32>>,
    prologue_size: u32,
    /// Leader of the block being emitted
    pub(super) current: u32,
}

impl<'a, A: MacroAssembler> CodeGenerator<'a, A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        asm: A,
        target: &'a TargetInfo,
        config: &'a JitConfig,
        analysis: &'a mut MethodAnalysis,
        frame: &'a FrameLayout,
        symbols: &'a Symbols,
        signature: &'a Signature,
        max_stack: u16,
    ) -> Self {
        let instr_offsets = vec![None; analysis.instrs.len()];
        CodeGenerator {
            asm,
            target,
            config,
            analysis,
            frame,
            symbols,
            signature,
            max_stack,
            work: Vec::new(),
            exits: FxHashMap::default(),
            snapshots: FxHashMap::default(),
            relocations: Vec::new(),
            safepoints: Vec::new(),
            tables: SwitchTables::new(),
            instr_offsets,
            prologue_size: 0,
            current: 0,
        }
    }

    /// Generate every reachable block
    pub fn run(mut self) -> Result<CodegenOutput, JitError> {
        self.emit_prologue();

        // Handlers are seeded first so the entry block is generated first
        let handler_pcs: Vec<u32> = self.analysis.handlers.iter().rev().map(|h| h.handler_pc).collect();
        for pc in handler_pcs {
            self.push(WorkItem {
                pc,
                parent: Parent::Handler,
                subroutine: None,
            });
        }
        self.push(WorkItem {
            pc: 0,
            parent: Parent::Entry,
            subroutine: None,
        });

        while let Some(item) = self.work.pop() {
            self.process(item)?;
        }
        debug_assert!(self.exits.is_empty(), "unconsumed exit states");

        Ok(self.finish())
    }

    fn finish(mut self) -> CodegenOutput {
        let leftover = self.asm.take_relocations();
        debug_assert!(leftover.is_empty(), "relocations outside any block");
        CodegenOutput {
            scratch: self.asm.finish(),
            prologue_size: self.prologue_size,
            relocations: self.relocations,
            safepoints: self.safepoints,
            switch_tables: self.tables,
            instr_offsets: self.instr_offsets,
        }
    }

    fn emit_prologue(&mut self) {
        let frame = self.frame;
        self.asm.enter(frame.frame_size());
        for (k, &reg) in frame.saved().iter().enumerate() {
            self.asm.store(Width::W64, frame.save_mem(k), reg);
        }
        for (arg, &ty) in self.signature.params.iter().enumerate() {
            let arg = arg as u16;
            if let Some(reg) = frame.home(arg).register() {
                self.asm.load(frame.width(ty), reg, frame.incoming_mem(arg));
            }
        }
        // Reference locals are GC roots from the first safepoint on
        let params = self.signature.params.len();
        for local in params..self.analysis.vars.len() {
            let width = match self.analysis.vars[local].ty {
                SlotType::Typed(ValueType::Ref) => frame.pointer_width(),
                SlotType::Conflict => Width::W64,
                _ => continue,
            };
            let local = local as u16;
            match frame.home(local) {
                Home::Register(reg) => self.asm.mov_imm(width, reg, 0),
                Home::Frame => {
                    let s = self.target.scratch(false, FLUSH);
                    self.asm.mov_imm(width, s, 0);
                    self.asm.store(width, frame.local_mem(local), s);
                }
            }
        }
        self.prologue_size = self.asm.offset();
    }

    fn push(&mut self, item: WorkItem) {
        let block = self
            .analysis
            .block_mut(item.pc)
            .unwrap_or_else(|| panic!("work item for non-leader pc {}", item.pc));
        if block.phase == BlockPhase::Unreached {
            block.phase = BlockPhase::Pending;
        }
        self.work.push(item);
    }

    /// Consume one claim on a block's exit state
    fn take_exit(&mut self, pc: u32) -> BlockState {
        let (_, remaining) = self
            .exits
            .get_mut(&pc)
            .unwrap_or_else(|| panic!("no exit state for block {pc}"));
        *remaining -= 1;
        if *remaining == 0 {
            let (state, _) = self.exits.remove(&pc).unwrap_or_else(|| unreachable!());
            state
        } else {
            self.exits[&pc].0.clone()
        }
    }

    fn entry_state(&mut self, item: WorkItem) -> Result<BlockState, JitError> {
        let homes = self.frame.homes();
        let state = match item.parent {
            Parent::Entry => BlockState::entry(homes, self.max_stack),
            Parent::Handler => BlockState::handler(homes, self.max_stack),
            Parent::Block(pc) => self.take_exit(pc),
            Parent::SubroutineExit { leader, caller } => {
                let mut caller_state = self.take_exit(caller);
                match self.snapshots.get(&leader) {
                    Some(snapshot) => snapshot.clone(),
                    None => {
                        tracing::warn!(
                            subroutine = leader,
                            caller,
                            "subroutine never returns; continuing from the caller state"
                        );
                        // drop the return address pushed by the jsr
                        caller_state.pop_expect(caller, ValueType::ReturnAddress)?;
                        caller_state
                    }
                }
            }
        };
        Ok(state)
    }

    /// Handle one work item; a sealed block is never generated again
    pub(crate) fn process(&mut self, item: WorkItem) -> Result<(), JitError> {
        let (phase, is_handler) = {
            let block = self
                .analysis
                .block(item.pc)
                .unwrap_or_else(|| panic!("work item for non-leader pc {}", item.pc));
            (block.phase, block.is_handler)
        };
        if is_handler && item.parent != Parent::Handler {
            return Err(JitError::malformed(
                item.pc,
                "normal control flow enters an exception handler",
            ));
        }

        let state = self.entry_state(item)?;
        match phase {
            BlockPhase::Sealed => self.check_merge(item.pc, &state),
            BlockPhase::Unreached | BlockPhase::Pending => self.generate_block(item, state),
            BlockPhase::Merging | BlockPhase::Emitting => {
                panic!("block {} re-entered during its own generation", item.pc)
            }
        }
    }

    /// A sealed block's entry stack must match every later predecessor
    fn check_merge(&self, pc: u32, state: &BlockState) -> Result<(), JitError> {
        let block = self.analysis.block(pc).unwrap_or_else(|| unreachable!());
        if block.entry_depth != Some(state.depth()) {
            return Err(JitError::malformed(
                pc,
                format!(
                    "inconsistent stack depth at merge: {} vs {:?}",
                    state.depth(),
                    block.entry_depth
                ),
            ));
        }
        let mismatch = block
            .entry_types
            .iter()
            .zip(state.stack())
            .position(|(&expected, value)| expected != value.ty);
        if let Some(slot) = mismatch {
            return Err(JitError::malformed(
                pc,
                format!(
                    "type mismatch at merge in stack slot {slot}: {:?} vs {:?}",
                    state.stack()[slot].ty,
                    block.entry_types[slot]
                ),
            ));
        }
        Ok(())
    }

    fn set_phase(&mut self, pc: u32, phase: BlockPhase) {
        let block = self.analysis.block_mut(pc).unwrap_or_else(|| unreachable!());
        block.phase = phase;
    }

    fn generate_block(&mut self, item: WorkItem, mut state: BlockState) -> Result<(), JitError> {
        let pc = item.pc;
        self.current = pc;

        // Step 1: Merge
        self.set_phase(pc, BlockPhase::Merging);
        let (ref_count, is_handler, next_block) = {
            let block = self.analysis.block(pc).unwrap_or_else(|| unreachable!());
            (block.ref_count, block.is_handler, block.next_block)
        };
        if ref_count > 1 {
            state.forget_facts();
        }
        let scratch_offset = self.asm.offset();
        {
            let block = self.analysis.block_mut(pc).unwrap_or_else(|| unreachable!());
            block.entry_depth = Some(state.depth());
            block.entry_types = state.stack().iter().map(|value| value.ty).collect();
            block.scratch_offset = scratch_offset;
            block.phase = BlockPhase::Emitting;
        }

        let last_idx = *self.analysis.block_instr_range(pc).end();
        let exit = BlockExit::classify(&self.analysis.instrs[last_idx], next_block);
        if matches!(exit, BlockExit::Ret) && item.subroutine.is_none() {
            return Err(JitError::malformed(
                self.analysis.instrs[last_idx].pc,
                "ret outside a subroutine",
            ));
        }

        // Step 2: Emit
        if self.config.debug_checks {
            self.asm.check_frame(self.frame.frame_size());
        }
        if is_handler {
            self.store_exception();
        }
        for idx in self.analysis.block_instr_range(pc) {
            let before = self.asm.offset();
            self.instr_offsets[idx] = Some(before);
            let instr = self.analysis.instrs[idx].clone();
            self.translate(&instr, &mut state)?;
            if self.config.instrumentation && self.asm.offset() == before {
                self.asm.nop();
            }
        }
        if let BlockExit::Fallthrough(_) = exit {
            self.flush(&mut state);
        }
        if self.config.debug_checks {
            assert!(state.is_canonical(), "block {pc} exits with a non-canonical stack");
        }

        // Step 3: Seal
        for reloc in self.asm.take_relocations() {
            self.relocations.push(BlockRelocation { block: pc, reloc });
        }
        let code_size = self.asm.offset() - scratch_offset;
        {
            let block = self.analysis.block_mut(pc).unwrap_or_else(|| unreachable!());
            assert!(block.phase != BlockPhase::Sealed, "block {pc} sealed twice");
            block.code_size = code_size;
            block.phase = BlockPhase::Sealed;
        }
        if self.config.trace_codegen {
            tracing::trace!(pc, code_size, depth = state.depth(), ?exit, "sealed block");
        }

        // Step 4: Schedule successors
        self.schedule(item, exit, state);
        Ok(())
    }

    /// Push successors so that the default and branch targets are generated
    /// before the fallthrough
    fn schedule(&mut self, item: WorkItem, exit: BlockExit, state: BlockState) {
        let pc = item.pc;
        let successor = |target: u32| WorkItem {
            pc: target,
            parent: Parent::Block(pc),
            subroutine: item.subroutine,
        };
        let claims = match exit {
            BlockExit::Fallthrough(next) | BlockExit::Goto(next) => {
                self.push(successor(next));
                1
            }
            BlockExit::Branch {
                target,
                fallthrough,
            } => {
                self.push(successor(fallthrough));
                self.push(successor(target));
                2
            }
            BlockExit::Switch { default, cases } => {
                for &case in cases.iter().rev() {
                    self.push(successor(case));
                }
                self.push(successor(default));
                cases.len() as u32 + 1
            }
            BlockExit::Jsr {
                target,
                continuation,
            } => {
                self.push(WorkItem {
                    pc: continuation,
                    parent: Parent::SubroutineExit {
                        leader: target,
                        caller: pc,
                    },
                    subroutine: item.subroutine,
                });
                self.push(WorkItem {
                    pc: target,
                    parent: Parent::Block(pc),
                    subroutine: Some(target),
                });
                2
            }
            BlockExit::Ret => {
                if let Some(leader) = item.subroutine {
                    self.snapshots.insert(leader, state);
                }
                return;
            }
            BlockExit::Return | BlockExit::Throw => {
                if let Some(leader) = item.subroutine {
                    self.snapshots.entry(leader).or_insert(state);
                }
                return;
            }
        };
        self.exits.insert(pc, (state, claims));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::discover;
    use crate::bytecode::{
        BytecodeBuilder, ClassRef, ConstantPool, FieldRef, Method, MethodId, MethodSource,
    };
    use crate::masm::{PortableAssembler, PortableBackend};
    use crate::masm::CodegenBackend;
    use crate::regalloc::allocate;
    use crate::reloc::RelocTarget;

    struct Fixture {
        method: Method,
        analysis: MethodAnalysis,
        frame: FrameLayout,
        symbols: Symbols,
        target: TargetInfo,
        config: JitConfig,
    }

    impl Fixture {
        fn new(method: Method, config: JitConfig) -> Self {
            let analysis = discover(&method).unwrap();
            let target = TargetInfo::portable64();
            let allocation = allocate(&analysis.vars, &target, config.instrumentation);
            let symbols = Symbols::resolve(&method, &analysis).unwrap();
            let frame = FrameLayout::new(
                &target,
                &allocation,
                method.signature().params.len() as u16,
                method.max_stack(),
                symbols.outgoing_slots(),
            );
            Fixture {
                method,
                analysis,
                frame,
                symbols,
                target,
                config,
            }
        }

        fn generator(&mut self) -> CodeGenerator<'_, PortableAssembler> {
            CodeGenerator::new(
                PortableBackend::portable64().assembler(),
                &self.target,
                &self.config,
                &mut self.analysis,
                &self.frame,
                &self.symbols,
                &self.method.signature,
                self.method.max_stack,
            )
        }

        fn run(&mut self) -> Result<CodegenOutput, JitError> {
            self.generator().run()
        }
    }

    fn scenario_a() -> Method {
        let mut b = BytecodeBuilder::new();
        let l = b.new_label();
        b.op(Opcode::Iconst0).op(Opcode::Istore1).branch(Opcode::Goto, l);
        b.bind(l).op(Opcode::Iload1).op(Opcode::Ireturn);
        Method::new(MethodId(1), "a", b.finish().unwrap())
            .with_limits(2, 1)
            .with_signature(Signature::new(vec![], Some(ValueType::Int)))
    }

    #[test]
    fn test_generates_reachable_blocks_once() {
        let mut fx = Fixture::new(scenario_a(), JitConfig::default());
        let out = fx.run().unwrap();
        let entry = fx.analysis.block(0).unwrap();
        let target = fx.analysis.block(5).unwrap();
        assert_eq!(entry.phase, BlockPhase::Sealed);
        assert_eq!(target.phase, BlockPhase::Sealed);
        assert_eq!(entry.scratch_offset, out.prologue_size);
        assert!(target.scratch_offset >= entry.scratch_offset + entry.code_size);
        // the goto is the only relocation
        assert_eq!(out.relocations.len(), 1);
        assert_eq!(out.relocations[0].block, 0);
        assert_eq!(out.relocations[0].reloc.target(), RelocTarget::Pc(5));
        assert!(out.instr_offsets.iter().all(Option::is_some));
    }

    #[test]
    fn test_sealed_block_is_not_regenerated() {
        let mut fx = Fixture::new(scenario_a(), JitConfig::default());
        let mut generator = fx.generator();
        generator.emit_prologue();
        generator
            .process(WorkItem {
                pc: 0,
                parent: Parent::Entry,
                subroutine: None,
            })
            .unwrap();
        let after_first = generator.asm.offset();
        generator
            .process(WorkItem {
                pc: 0,
                parent: Parent::Entry,
                subroutine: None,
            })
            .unwrap();
        assert_eq!(generator.asm.offset(), after_first);
    }

    #[test]
    fn test_branch_targets_before_fallthrough() {
        // 0: iload_0; 1: ifeq 7; 4: iinc 0 1; 7: return
        let mut b = BytecodeBuilder::new();
        let skip = b.new_label();
        b.op(Opcode::Iload0).branch(Opcode::Ifeq, skip);
        b.iinc(0, 1);
        b.bind(skip).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(1, 1)
            .with_signature(Signature::new(vec![ValueType::Int], None));
        let mut fx = Fixture::new(method, JitConfig::default());
        fx.run().unwrap();
        let target = fx.analysis.block(7).unwrap().scratch_offset;
        let fallthrough = fx.analysis.block(4).unwrap().scratch_offset;
        assert!(target < fallthrough);
    }

    #[test]
    fn test_unreached_blocks_stay_unreached() {
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Return).op(Opcode::Nop).op(Opcode::Return);
        let mut fx = Fixture::new(Method::new(MethodId(1), "t", b.finish().unwrap()), JitConfig::default());
        let out = fx.run().unwrap();
        let dead = fx.analysis.block(1).unwrap();
        assert_eq!(dead.phase, BlockPhase::Unreached);
        assert_eq!(dead.code_size, 0);
        assert_eq!(out.instr_offsets[1], None);
    }

    #[test]
    fn test_instrumentation_pads_empty_instructions() {
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Nop).op(Opcode::Nop).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap());
        let mut fx = Fixture::new(method, JitConfig::instrumented());
        let out = fx.run().unwrap();
        let offsets: Vec<u32> = out.instr_offsets.iter().map(|o| o.unwrap()).collect();
        assert!(offsets[0] < offsets[1] && offsets[1] < offsets[2]);
    }

    #[test]
    fn test_subroutine_snapshot_feeds_continuation() {
        // 0: jsr 4; 3: return; 4: astore_0 (return address); 6: iconst_1; 7: pop; 8: ret 0
        let mut b = BytecodeBuilder::new();
        let sub = b.new_label();
        b.branch(Opcode::Jsr, sub).op(Opcode::Return);
        b.bind(sub).op_u8(Opcode::Astore, 0).op(Opcode::Iconst1).op(Opcode::Pop);
        b.op_u8(Opcode::Ret, 0);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap()).with_limits(1, 1);
        let mut fx = Fixture::new(method, JitConfig::default());
        let out = fx.run().unwrap();
        let sub = fx.analysis.block(4).unwrap();
        let cont = fx.analysis.block(3).unwrap();
        assert!(sub.is_subroutine);
        // subroutine generated before its continuation
        assert!(sub.scratch_offset < cont.scratch_offset);
        assert_eq!(sub.entry_depth, Some(1));
        assert_eq!(cont.entry_depth, Some(0));
        assert!(out
            .relocations
            .iter()
            .any(|r| r.reloc.target() == RelocTarget::Pc(3)));
    }

    #[test]
    fn test_subroutine_without_ret_falls_back() {
        // 0: jsr 4; 3: return; 4: pop; 5: goto 5
        let mut b = BytecodeBuilder::new();
        let sub = b.new_label();
        let spin = b.new_label();
        b.branch(Opcode::Jsr, sub).op(Opcode::Return);
        b.bind(sub).op(Opcode::Pop);
        b.bind(spin).branch(Opcode::Goto, spin);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap()).with_limits(0, 1);
        let mut fx = Fixture::new(method, JitConfig::default());
        fx.run().unwrap();
        // caller state minus the return address
        assert_eq!(fx.analysis.block(3).unwrap().entry_depth, Some(0));
        assert_eq!(fx.analysis.block(5).unwrap().phase, BlockPhase::Sealed);
    }

    #[test]
    fn test_return_inside_subroutine_records_snapshot() {
        // 0: jsr 4; 3: return; 4: pop; 5: return
        let mut b = BytecodeBuilder::new();
        let sub = b.new_label();
        b.branch(Opcode::Jsr, sub).op(Opcode::Return);
        b.bind(sub).op(Opcode::Pop).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap()).with_limits(0, 1);
        let mut fx = Fixture::new(method, JitConfig::default());
        fx.run().unwrap();
        assert_eq!(fx.analysis.block(3).unwrap().entry_depth, Some(0));
    }

    #[test]
    fn test_handler_entry() {
        // 0: nop; 1: return; 2: pop (handler); 3: return
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Nop).op(Opcode::Return).op(Opcode::Pop).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(0, 1)
            .with_handler(crate::bytecode::ExceptionEntry {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 2,
                catch_type: None,
            });
        let mut fx = Fixture::new(method, JitConfig::default());
        fx.run().unwrap();
        let handler = fx.analysis.block(2).unwrap();
        assert_eq!(handler.phase, BlockPhase::Sealed);
        assert_eq!(handler.entry_depth, Some(1));
        // entry generated first
        assert!(fx.analysis.block(0).unwrap().scratch_offset < handler.scratch_offset);
    }

    #[test]
    fn test_fallthrough_into_handler_is_malformed() {
        // 0: iconst_0; 1: pop (handler, also reached by fallthrough); 2: return
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Iconst0).op(Opcode::Pop).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(0, 1)
            .with_handler(crate::bytecode::ExceptionEntry {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 1,
                catch_type: None,
            });
        let mut fx = Fixture::new(method, JitConfig::default());
        assert!(matches!(fx.run(), Err(JitError::Malformed { pc: 1, .. })));
    }

    #[test]
    fn test_inconsistent_merge_depth() {
        // 0: iload_0; 1: ifeq 6; 4: iconst_1; 5: nop; 6: return
        // block 6 is reached with depth 0 and depth 1
        let mut b = BytecodeBuilder::new();
        let join = b.new_label();
        b.op(Opcode::Iload0).branch(Opcode::Ifeq, join);
        b.op(Opcode::Iconst1).op(Opcode::Nop);
        b.bind(join).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(1, 1)
            .with_signature(Signature::new(vec![ValueType::Int], None));
        let mut fx = Fixture::new(method, JitConfig::default());
        assert!(matches!(fx.run(), Err(JitError::Malformed { pc: 6, .. })));
    }

    #[test]
    fn test_debug_checks_emit_frame_checks() {
        let mut fx = Fixture::new(scenario_a(), JitConfig {
            debug_checks: true,
            ..JitConfig::default()
        });
        let out = fx.run().unwrap();
        let entry = fx.analysis.block(0).unwrap();
        assert_eq!(
            out.scratch[entry.scratch_offset as usize],
            crate::masm::portable::tag::CHECK_FRAME
        );
    }

    /// Method whose reference local 1 is live across a call before its first store
    fn late_reference_local() -> Method {
        let mut pool = ConstantPool::new();
        let class = pool.add_class(ClassRef(3));
        // 0: new; 3: pop; 4: aconst_null; 5: astore 1; 7: return
        let mut b = BytecodeBuilder::new();
        b.op_u16(Opcode::New, class).op(Opcode::Pop);
        b.op(Opcode::AconstNull).op_u8(Opcode::Astore, 1).op(Opcode::Return);
        Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(2, 1)
            .with_pool(pool)
    }

    fn assert_prologue_clears_local_1(config: JitConfig) {
        let mut fx = Fixture::new(late_reference_local(), config);
        assert_eq!(fx.analysis.vars[1].ty, SlotType::Typed(ValueType::Ref));
        let out = fx.run().unwrap();

        let width = fx.frame.pointer_width();
        let mut expected = PortableAssembler::new();
        match fx.frame.home(1) {
            Home::Register(reg) => expected.mov_imm(width, reg, 0),
            Home::Frame => {
                let s = fx.target.scratch(false, FLUSH);
                expected.mov_imm(width, s, 0);
                expected.store(width, fx.frame.local_mem(1), s);
            }
        }
        let expected = expected.finish();
        let prologue = &out.scratch[..out.prologue_size as usize];
        assert!(
            prologue.windows(expected.len()).any(|w| w == expected.as_slice()),
            "prologue does not clear local 1"
        );

        let call = out.safepoints.iter().find(|sp| sp.pc == 0).unwrap();
        let location = fx.frame.local_location(1);
        assert!(call.roots.iter().any(|r| r.location == location && !r.conservative));
    }

    #[test]
    fn test_prologue_clears_reference_locals() {
        assert_prologue_clears_local_1(JitConfig::default());
    }

    #[test]
    fn test_prologue_clears_frame_reference_locals() {
        // no register homes when instrumenting
        assert_prologue_clears_local_1(JitConfig::instrumented());
    }

    #[test]
    fn test_ret_outside_subroutine_is_malformed() {
        let mut b = BytecodeBuilder::new();
        b.op_u8(Opcode::Ret, 0);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(1, 0)
            .with_signature(Signature::new(vec![ValueType::Int], None));
        let mut fx = Fixture::new(method, JitConfig::default());
        assert!(matches!(fx.run(), Err(JitError::Malformed { pc: 0, .. })));
    }

    #[test]
    fn test_inconsistent_merge_types() {
        // 0: iload_0; 1: ifeq 8; 4: aconst_null; 5: goto 9; 8: iconst_0; 9: pop; 10: return
        // block 9 is reached with an int and with a reference
        let mut b = BytecodeBuilder::new();
        let int = b.new_label();
        let join = b.new_label();
        b.op(Opcode::Iload0).branch(Opcode::Ifeq, int);
        b.op(Opcode::AconstNull).branch(Opcode::Goto, join);
        b.bind(int).op(Opcode::Iconst0);
        b.bind(join).op(Opcode::Pop).op(Opcode::Return);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(1, 1)
            .with_signature(Signature::new(vec![ValueType::Int], None));
        let mut fx = Fixture::new(method, JitConfig::default());
        assert!(matches!(fx.run(), Err(JitError::Malformed { pc: 9, .. })));
        assert_eq!(fx.analysis.block(9).unwrap().entry_types, vec![ValueType::Int]);
    }

    #[test]
    fn test_merge_clears_null_facts() {
        let mut pool = ConstantPool::new();
        let field = pool.add_field(FieldRef {
            ty: ValueType::Int,
            offset: 16,
        });
        // 0: iload_1; 1: ifne 7; 4: goto 12
        // 7: aload_0; 8: getfield; 11: pop
        // 12: aload_0; 13: getfield; 16: ireturn
        let mut b = BytecodeBuilder::new();
        let checked = b.new_label();
        let join = b.new_label();
        b.op(Opcode::Iload1).branch(Opcode::Ifne, checked);
        b.branch(Opcode::Goto, join);
        b.bind(checked).op(Opcode::Aload0).op_u16(Opcode::Getfield, field).op(Opcode::Pop);
        b.bind(join).op(Opcode::Aload0).op_u16(Opcode::Getfield, field).op(Opcode::Ireturn);
        let method = Method::new(MethodId(1), "t", b.finish().unwrap())
            .with_limits(2, 1)
            .with_signature(Signature::new(
                vec![ValueType::Ref, ValueType::Int],
                Some(ValueType::Int),
            ))
            .with_pool(pool);
        let mut fx = Fixture::new(method, JitConfig::default());
        let out = fx.run().unwrap();

        // the join is generated straight after the null-checked block
        let checked = fx.analysis.block(7).unwrap();
        let join = fx.analysis.block(12).unwrap();
        assert_eq!(join.scratch_offset, checked.scratch_offset + checked.code_size);
        let start = join.scratch_offset as usize;
        let end = start + join.code_size as usize;
        let traps = out.scratch[start..end]
            .iter()
            .filter(|&&b| b == crate::masm::portable::tag::TRAP_IF)
            .count();
        assert_eq!(traps, 1);
    }
}
