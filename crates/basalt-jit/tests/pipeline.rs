//! End-to-end compilation tests over the portable backend

use basalt_jit::analysis::discover;
use basalt_jit::bytecode::{
    BytecodeBuilder, CatchType, ConstantPool, ExceptionEntry, Method, MethodId, Opcode, Signature,
    ValueType,
};
use basalt_jit::runtime::BlockKind;
use basalt_jit::{
    CompiledMethod, HeapRuntime, JitConfig, JitContext, JitError, JitPipeline, PortableBackend,
};

fn compile_with(method: &Method, config: JitConfig) -> (std::sync::Arc<CompiledMethod>, HeapRuntime) {
    let pipeline = JitPipeline::new(PortableBackend::portable64(), config);
    let ctx = JitContext::new();
    let runtime = HeapRuntime::new();
    let outcome = pipeline
        .compile(&ctx, &runtime, method)
        .expect("compilation failed");
    assert!(outcome.is_installed());
    (outcome.method().clone(), runtime)
}

fn compile(method: &Method) -> (std::sync::Arc<CompiledMethod>, HeapRuntime) {
    compile_with(method, JitConfig::default())
}

/// Every PC in `[0, code_len]` maps to an offset inside the code or its end
fn assert_pc_map_total(compiled: &CompiledMethod, code_len: u32) {
    let map = &compiled.info.pc_map;
    for pc in 0..=code_len {
        let offset = map
            .native_offset(pc)
            .unwrap_or_else(|| panic!("pc {pc} has no native offset"));
        assert!(offset <= compiled.code.len() as u32);
    }
    assert_eq!(map.native_offset(code_len), Some(compiled.code.len() as u32));
}

#[test]
fn test_straight_line_goto() {
    // 0: iconst_0; 1: istore_1; 2: goto 5; 5: iload_1; 6: ireturn
    let mut b = BytecodeBuilder::new();
    let target = b.new_label();
    b.op(Opcode::Iconst0).op(Opcode::Istore1).branch(Opcode::Goto, target);
    b.bind(target).op(Opcode::Iload1).op(Opcode::Ireturn);
    let method = Method::new(MethodId(1), "straight", b.finish().unwrap())
        .with_limits(2, 1)
        .with_signature(Signature::new(vec![], Some(ValueType::Int)));

    let analysis = discover(&method).unwrap();
    assert_eq!(analysis.leaders().collect::<Vec<_>>(), vec![0, 5]);

    let (compiled, runtime) = compile(&method);
    let first = compiled.address_of_pc(0).unwrap();
    let second = compiled.address_of_pc(5).unwrap();
    // prologue precedes the entry block, which precedes its successor
    assert!(compiled.entry_address() < first);
    assert!(first < second);
    assert_pc_map_total(&compiled, 7);
    assert!(compiled.handlers.is_empty());
    assert_eq!(runtime.allocations(BlockKind::Data), 0);
}

#[test]
fn test_handler_over_dead_region_is_dropped() {
    // 0: goto 4; 3: nop (dead); 4: return; 5: pop; 6: return
    let mut b = BytecodeBuilder::new();
    let live = b.new_label();
    b.branch(Opcode::Goto, live).op(Opcode::Nop);
    b.bind(live).op(Opcode::Return);
    b.op(Opcode::Pop).op(Opcode::Return);

    let mut pool = ConstantPool::new();
    let catch = pool.add_catch_type(CatchType(77));
    let method = Method::new(MethodId(2), "dead_region", b.finish().unwrap())
        .with_limits(0, 1)
        .with_pool(pool)
        .with_handler(ExceptionEntry {
            start_pc: 3,
            end_pc: 4,
            handler_pc: 5,
            catch_type: Some(catch),
        })
        .with_handler(ExceptionEntry {
            start_pc: 0,
            end_pc: 3,
            handler_pc: 5,
            catch_type: None,
        });

    let (compiled, runtime) = compile(&method);
    assert_eq!(compiled.handlers.len(), 1);
    let handler = compiled.handlers[0];
    assert_eq!(handler.catch_type, None);
    assert!(handler.exception_dead);
    assert_eq!(Some(handler.start), compiled.info.pc_map.live_offset(0));
    // the handler block starts by storing the exception, then runs pc 5
    let map = &compiled.info.pc_map;
    assert!(map.live_offset(4).unwrap() < handler.handler);
    assert!(handler.handler < map.live_offset(5).unwrap());
    assert_eq!(runtime.handlers(MethodId(2)), Some(compiled.handlers.clone()));

    // the dead nop bridges to the next live instruction
    assert_eq!(
        compiled.info.pc_map.native_offset(3),
        compiled.info.pc_map.live_offset(4)
    );
    assert_pc_map_total(&compiled, 7);
}

#[test]
fn test_tableswitch_entries_point_at_cases() {
    let mut b = BytecodeBuilder::new();
    let default = b.new_label();
    let cases: Vec<_> = (0..4).map(|_| b.new_label()).collect();
    b.op(Opcode::Iload0).tableswitch(0, default, &cases);
    let mut case_pcs = Vec::new();
    for &case in &cases {
        case_pcs.push(b.pc());
        b.bind(case).op(Opcode::Iconst1).op(Opcode::Ireturn);
    }
    b.bind(default).op(Opcode::Iconst0).op(Opcode::Ireturn);
    let method = Method::new(MethodId(3), "switch", b.finish().unwrap())
        .with_limits(1, 1)
        .with_signature(Signature::new(vec![ValueType::Int], Some(ValueType::Int)));

    let (compiled, runtime) = compile(&method);
    assert_eq!(runtime.allocations(BlockKind::Data), 1);
    let data = compiled.data.as_ref().expect("switch table block");
    assert_eq!(data.len(), 8 * case_pcs.len());

    for (i, &pc) in case_pcs.iter().enumerate() {
        let entry = u64::from_le_bytes(data.bytes()[i * 8..i * 8 + 8].try_into().unwrap());
        assert_eq!(Some(entry), compiled.address_of_pc(pc), "case {i}");
    }

    // the dispatch embeds the absolute table address
    let table = data.address().to_le_bytes();
    assert_eq!(
        compiled.code_bytes().windows(8).filter(|w| *w == table).count(),
        1
    );
}

#[test]
fn test_lookupswitch_needs_no_table() {
    let mut b = BytecodeBuilder::new();
    let default = b.new_label();
    let low = b.new_label();
    let high = b.new_label();
    b.op(Opcode::Iload0)
        .lookupswitch(default, &[(-5, low), (1000, high)]);
    b.bind(low).op(Opcode::Iconst0).op(Opcode::Ireturn);
    b.bind(high).op(Opcode::Iconst1).op(Opcode::Ireturn);
    b.bind(default).op(Opcode::Iload0).op(Opcode::Ireturn);
    let method = Method::new(MethodId(4), "lookup", b.finish().unwrap())
        .with_limits(1, 1)
        .with_signature(Signature::new(vec![ValueType::Int], Some(ValueType::Int)));

    let (compiled, runtime) = compile(&method);
    assert!(compiled.data.is_none());
    assert_eq!(runtime.allocations(BlockKind::Data), 0);
}

#[test]
fn test_subroutine_return_address_is_patched() {
    // 0: jsr 4; 3: return; 4: astore_0; 6: ret 0
    let mut b = BytecodeBuilder::new();
    let sub = b.new_label();
    b.branch(Opcode::Jsr, sub).op(Opcode::Return);
    b.bind(sub).op_u8(Opcode::Astore, 0).op_u8(Opcode::Ret, 0);
    let method = Method::new(MethodId(5), "finally", b.finish().unwrap()).with_limits(1, 1);

    let (compiled, _) = compile(&method);
    let continuation = compiled.address_of_pc(3).unwrap();
    let subroutine = compiled.address_of_pc(4).unwrap();
    assert!(continuation < subroutine);
    // the return address handed to the subroutine is the continuation
    let bytes = continuation.to_le_bytes();
    assert!(compiled.code_bytes().windows(8).any(|w| w == bytes));
    assert_pc_map_total(&compiled, 8);
}

#[test]
fn test_backward_branch_records_safepoint() {
    // 0: iload_0; 1: ifeq 7; 4: goto 0; 7: return
    let mut b = BytecodeBuilder::new();
    let head = b.new_label();
    let exit = b.new_label();
    b.bind(head).op(Opcode::Iload0).branch(Opcode::Ifeq, exit);
    b.branch(Opcode::Goto, head);
    b.bind(exit).op(Opcode::Return);
    let method = Method::new(MethodId(6), "loop", b.finish().unwrap())
        .with_limits(1, 1)
        .with_signature(Signature::new(vec![ValueType::Int], None));

    let (compiled, _) = compile(&method);
    let safepoints = compiled.info.safepoints.entries();
    assert_eq!(safepoints.len(), 1);
    assert_eq!(safepoints[0].pc, 4);
    assert_eq!(compiled.pc_at_address(compiled.code.address() + safepoints[0].offset as u64), Some(4));

    let (quiet, _) = compile_with(
        &method,
        JitConfig {
            backedge_polls: false,
            ..JitConfig::default()
        },
    );
    assert!(quiet.info.safepoints.is_empty());
}

#[test]
fn test_many_branches() {
    const BRANCHES: usize = 30_000;
    let mut b = BytecodeBuilder::new();
    for _ in 0..BRANCHES {
        let next = b.new_label();
        b.op(Opcode::Iload0).branch(Opcode::Ifeq, next);
        b.bind(next);
    }
    b.op(Opcode::Return);
    let code = b.finish().unwrap();
    let code_len = code.len() as u32;
    let method = Method::new(MethodId(7), "wide", code)
        .with_limits(1, 1)
        .with_signature(Signature::new(vec![ValueType::Int], None));

    let analysis = discover(&method).unwrap();
    assert_eq!(analysis.blocks.len(), BRANCHES + 1);

    let (compiled, _) = compile(&method);
    assert_pc_map_total(&compiled, code_len);
    // blocks are laid out in PC order
    let live = compiled.info.pc_map.live();
    assert_eq!(live.len(), 2 * BRANCHES + 1);
    assert!(live.windows(2).all(|pair| pair[0].1 <= pair[1].1));
}

#[test]
fn test_blocks_partition_the_code() {
    let mut b = BytecodeBuilder::new();
    let else_ = b.new_label();
    let join = b.new_label();
    b.op(Opcode::Iload0).branch(Opcode::Ifeq, else_);
    b.op(Opcode::Iconst1).branch(Opcode::Goto, join);
    b.bind(else_).op(Opcode::Iconst0);
    b.bind(join).op(Opcode::Ireturn);
    let method = Method::new(MethodId(8), "select", b.finish().unwrap())
        .with_limits(1, 1)
        .with_signature(Signature::new(vec![ValueType::Int], Some(ValueType::Int)));

    let analysis = discover(&method).unwrap();
    let mut expected_start = 0;
    for block in &analysis.blocks {
        assert_eq!(block.start, expected_start);
        assert!(block.last_pc < block.next_block);
        expected_start = block.next_block;
    }
    assert_eq!(expected_start, analysis.code_len);

    let (compiled, _) = compile(&method);
    assert_pc_map_total(&compiled, analysis.code_len);
}

#[test]
fn test_unresolvable_catch_type_installs_nothing() {
    let mut b = BytecodeBuilder::new();
    b.op(Opcode::Nop).op(Opcode::Return).op(Opcode::Pop).op(Opcode::Return);
    let method = Method::new(MethodId(9), "unresolved", b.finish().unwrap())
        .with_limits(0, 1)
        .with_handler(ExceptionEntry {
            start_pc: 0,
            end_pc: 1,
            handler_pc: 2,
            catch_type: Some(3),
        });

    let pipeline = JitPipeline::new(PortableBackend::portable64(), JitConfig::default());
    let ctx = JitContext::new();
    let runtime = HeapRuntime::new();
    let err = pipeline.compile(&ctx, &runtime, &method).unwrap_err();
    assert!(matches!(err, JitError::Resolution(_)));
    assert!(ctx.installed(MethodId(9)).is_none());
    assert_eq!(runtime.allocated_bytes(), 0);
    assert!(runtime.handlers(MethodId(9)).is_none());
    assert_eq!(ctx.stats().snapshot().failed, 1);
}

#[test]
fn test_instrumentation_maps_every_instruction_to_distinct_code() {
    let mut b = BytecodeBuilder::new();
    b.op(Opcode::Nop).op(Opcode::Iload0).op(Opcode::Istore1).op(Opcode::Return);
    let method = Method::new(MethodId(10), "counted", b.finish().unwrap())
        .with_limits(2, 1)
        .with_signature(Signature::new(vec![ValueType::Int], None));

    let (compiled, _) = compile_with(&method, JitConfig::instrumented());
    let live = compiled.info.pc_map.live();
    assert_eq!(live.len(), 4);
    assert!(live.windows(2).all(|pair| pair[0].1 < pair[1].1));
    // no callee-saved registers in instrumentation mode
    assert!(compiled.info.frame.saved.is_empty());
}
