//! Bytecode model: opcodes, method metadata and a builder for authoring methods

pub mod builder;
pub mod method;
pub mod opcode;

pub use builder::{BuildError, BytecodeBuilder, Label};
pub use method::{
    CatchType, ClassRef, ConstantPool, ExceptionEntry, FieldRef, Method, MethodId, MethodRef,
    MethodSource, ResolveError, Signature, ValueType,
};
pub use opcode::Opcode;
