//! Bytecode analysis: instruction decoding and basic-block discovery

pub mod blocks;
pub mod decoder;

pub use blocks::{discover, BasicBlockInfo, BlockPhase, MethodAnalysis, SlotType, VarUsage};
pub use decoder::{
    decode_at, decode_method, DecodeError, InstrFlags, InstructionDescriptor, Operands, VarAccess,
};
