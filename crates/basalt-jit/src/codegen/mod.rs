//! Baseline code generation
//!
//! Turns the analyzed bytecode of one method into position-dependent native
//! code in a scratch buffer, plus the relocations, safepoints and switch
//! tables that layout needs to finish it.

pub mod driver;
pub mod frame;
pub mod state;
pub mod symbols;
mod translate;

pub use driver::{CodeGenerator, CodegenOutput, Parent, PendingSafepoint, WorkItem};
pub use frame::FrameLayout;
pub use state::{BlockState, Location, StackValue, ValueFacts};
pub use symbols::Symbols;
