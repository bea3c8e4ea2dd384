//! Basalt baseline JIT
//!
//! Translates a method's portable bytecode into native code in a single,
//! non-optimizing pass. It includes:
//! - Bytecode model (opcodes, metadata provider, builder)
//! - Analysis (instruction decoding, basic-block discovery, def/use typing)
//! - A greedy local register allocator
//! - A work-stack driven code generator with subroutine and handler support
//! - Code layout, relocation patching and exception-handler resolution
//! - A per-runtime context that serializes the commit phase
//! - A background compiler for concurrent compilation

pub mod analysis;
pub mod bytecode;
pub mod codegen;
pub mod config;
pub mod error;
pub mod handlers;
pub mod info;
pub mod layout;
pub mod masm;
pub mod regalloc;
pub mod reloc;
pub mod runtime;
pub mod target;

mod compiler;

pub use bytecode::{BytecodeBuilder, Method, MethodId, MethodSource, Opcode, ValueType};
pub use compiler::{CompileOutcome, JitPipeline};
pub use config::JitConfig;
pub use error::JitError;
pub use info::CompiledMethod;
pub use masm::{CodegenBackend, MacroAssembler, PortableBackend};
pub use runtime::{BackgroundCompiler, HeapRuntime, JitContext, RuntimeServices};
