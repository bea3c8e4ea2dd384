//! Compilation pipeline
//!
//! Runs a method through analysis, register allocation and code generation,
//! then commits the result under the context lock: layout, memory
//! allocation, patching, handler resolution and info encoding.

use std::sync::Arc;

use crate::analysis::discover;
use crate::bytecode::MethodSource;
use crate::codegen::{CodeGenerator, FrameLayout, Symbols};
use crate::config::JitConfig;
use crate::error::JitError;
use crate::handlers::{resolve_catch_types, resolve_native};
use crate::info::{CompiledMethod, MethodInfo, SafepointMap};
use crate::layout::{assign_offsets, build_pc_map, copy_blocks};
use crate::masm::CodegenBackend;
use crate::regalloc::allocate;
use crate::reloc::Patcher;
use crate::runtime::{BlockKind, JitContext, RuntimeServices};

/// Result of a successful compilation request
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    /// This request produced and installed the code
    Installed(Arc<CompiledMethod>),
    /// Another compilation installed the method first; its code is returned
    AlreadyInstalled(Arc<CompiledMethod>),
}

impl CompileOutcome {
    pub fn method(&self) -> &Arc<CompiledMethod> {
        match self {
            CompileOutcome::Installed(method) | CompileOutcome::AlreadyInstalled(method) => method,
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, CompileOutcome::Installed(_))
    }
}

/// Baseline compiler over a code generation backend
pub struct JitPipeline<B: CodegenBackend> {
    backend: B,
    config: JitConfig,
}

impl<B: CodegenBackend> JitPipeline<B> {
    pub fn new(backend: B, config: JitConfig) -> Self {
        JitPipeline { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compile `method` and install it in `ctx`
    ///
    /// Runtime memory is requested only after generation succeeds, and
    /// handlers are registered only when the commit completes.
    pub fn compile(
        &self,
        ctx: &JitContext,
        runtime: &dyn RuntimeServices,
        method: &dyn MethodSource,
    ) -> Result<CompileOutcome, JitError> {
        let guard = ctx.enter();
        let span = tracing::debug_span!(
            "compile",
            method = %method.id(),
            name = method.name(),
            nesting = guard.depth()
        );
        let _entered = span.enter();

        let result = self.compile_inner(ctx, runtime, method);
        if let Err(err) = &result {
            ctx.stats().record_failure();
            tracing::warn!(method = %method.id(), error = %err, "compilation failed");
        }
        result
    }

    fn compile_inner(
        &self,
        ctx: &JitContext,
        runtime: &dyn RuntimeServices,
        method: &dyn MethodSource,
    ) -> Result<CompileOutcome, JitError> {
        let id = method.id();
        let target = self.backend.target_info();

        // Step 1: Resolve catch types before any code exists
        let handlers = resolve_catch_types(method)?;

        // Step 2: Decode and discover blocks
        let mut analysis = discover(method)?;

        if let Some(existing) = ctx.installed(id) {
            tracing::debug!(method = %id, "already installed, skipping generation");
            return Ok(CompileOutcome::AlreadyInstalled(existing));
        }

        // Step 3: Allocate registers and lay out the frame
        let allocation = allocate(&analysis.vars, target, self.config.instrumentation);
        let symbols = Symbols::resolve(method, &analysis)?;
        let signature = method.signature();
        let frame = FrameLayout::new(
            target,
            &allocation,
            signature.params.len() as u16,
            method.max_stack(),
            symbols.outgoing_slots(),
        );

        // Step 4: Generate into the scratch buffer
        let output = CodeGenerator::new(
            self.backend.assembler(),
            target,
            &self.config,
            &mut analysis,
            &frame,
            &symbols,
            signature,
            method.max_stack(),
        )
        .run()?;

        // Step 5: Commit
        ctx.commit(id, || {
            let code_size = assign_offsets(&mut analysis, output.prologue_size);
            let mut code = runtime.allocate(BlockKind::Code, code_size as usize)?;
            let mut data = if output.switch_tables.is_empty() {
                None
            } else {
                let len = output.switch_tables.byte_len(target.pointer_size);
                Some(runtime.allocate(BlockKind::Data, len)?)
            };

            copy_blocks(&analysis, &output.scratch, output.prologue_size, code.bytes_mut());
            let pc_map = build_pc_map(&analysis, &output.instr_offsets, code_size);

            let patcher = Patcher {
                analysis: &analysis,
                tables: &output.switch_tables,
                code_base: code.address(),
                data_base: data.as_ref().map_or(0, |block| block.address()),
                pointer_size: target.pointer_size,
            };
            patcher.apply(
                code.bytes_mut(),
                data.as_mut().map(|block| block.bytes_mut()),
                &output.relocations,
            );

            let native_handlers = resolve_native(&handlers, &analysis, &pc_map);
            let safepoints = SafepointMap::new(
                output
                    .safepoints
                    .into_iter()
                    .map(|pending| pending.finalize(&analysis))
                    .collect(),
            );

            let info = MethodInfo {
                frame: frame.descriptor(),
                pc_map,
                safepoints,
            };
            let encoded = info.encode();
            let mut info_block = runtime.allocate(BlockKind::Info, encoded.len())?;
            info_block.bytes_mut().copy_from_slice(&encoded);

            runtime.register_handlers(id, code.address(), &native_handlers);

            tracing::debug!(
                method = %id,
                backend = self.backend.name(),
                code_size,
                blocks = analysis.blocks.iter().filter(|b| b.final_offset.is_some()).count(),
                handlers = native_handlers.len(),
                safepoints = info.safepoints.len(),
                frame_size = frame.frame_size(),
                "installed method"
            );

            Ok(CompiledMethod {
                id,
                name: method.name().to_string(),
                code,
                data,
                info_block,
                info,
                handlers: native_handlers,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Method, MethodId, Opcode, Signature, ValueType};
    use crate::masm::PortableBackend;
    use crate::runtime::HeapRuntime;

    fn identity() -> Method {
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Iload0).op(Opcode::Ireturn);
        Method::new(MethodId(7), "identity", b.finish().unwrap())
            .with_limits(1, 1)
            .with_signature(Signature::new(vec![ValueType::Int], Some(ValueType::Int)))
    }

    #[test]
    fn test_compile_installs() {
        let pipeline = JitPipeline::new(PortableBackend::portable64(), JitConfig::default());
        let ctx = JitContext::new();
        let runtime = HeapRuntime::new();

        let outcome = pipeline.compile(&ctx, &runtime, &identity()).unwrap();
        assert!(outcome.is_installed());
        let compiled = outcome.method();
        assert_eq!(compiled.name, "identity");
        assert!(!compiled.code.is_empty());
        assert!(compiled.data.is_none());
        assert_eq!(compiled.info_block.bytes(), compiled.info.encode().as_slice());
        assert_eq!(runtime.allocations(BlockKind::Code), 1);
        assert_eq!(runtime.allocations(BlockKind::Data), 0);
        assert_eq!(runtime.allocations(BlockKind::Info), 1);
        assert_eq!(runtime.handlers(MethodId(7)), Some(vec![]));
    }

    #[test]
    fn test_second_compile_reuses_installed() {
        let pipeline = JitPipeline::new(PortableBackend::portable64(), JitConfig::default());
        let ctx = JitContext::new();
        let runtime = HeapRuntime::new();

        let first = pipeline.compile(&ctx, &runtime, &identity()).unwrap();
        let second = pipeline.compile(&ctx, &runtime, &identity()).unwrap();
        assert!(!second.is_installed());
        assert!(Arc::ptr_eq(first.method(), second.method()));
        assert_eq!(runtime.allocations(BlockKind::Code), 1);
    }

    #[test]
    fn test_allocation_failure_counts_as_failed() {
        let pipeline = JitPipeline::new(PortableBackend::portable64(), JitConfig::default());
        let ctx = JitContext::new();
        let runtime = HeapRuntime::with_limit(0);

        let err = pipeline.compile(&ctx, &runtime, &identity()).unwrap_err();
        assert!(matches!(err, JitError::Allocation(_)));
        assert!(ctx.installed(MethodId(7)).is_none());
        assert_eq!(ctx.stats().snapshot().failed, 1);
    }

    #[test]
    fn test_malformed_method_is_rejected() {
        // pops from an empty stack
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Pop).op(Opcode::Return);
        let method = Method::new(MethodId(9), "bad", b.finish().unwrap()).with_limits(0, 1);

        let pipeline = JitPipeline::new(PortableBackend::portable64(), JitConfig::default());
        let ctx = JitContext::new();
        let runtime = HeapRuntime::new();
        let err = pipeline.compile(&ctx, &runtime, &method).unwrap_err();
        assert!(matches!(err, JitError::Malformed { .. }));
        assert_eq!(runtime.allocated_bytes(), 0);
    }
}
