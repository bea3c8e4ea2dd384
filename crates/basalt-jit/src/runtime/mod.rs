//! Runtime-facing services
//!
//! The runtime supplies memory for the code, data and info blocks of a
//! compiled method and receives its native handler table. [`JitContext`]
//! owns the per-runtime commit lock and registry.

pub mod background;
pub mod context;

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::bytecode::MethodId;
use crate::handlers::NativeHandler;

pub use background::{BackgroundCompiler, CompilationRequest, CompilationResult};
pub use context::{JitContext, JitStats, JitStatsSnapshot, NestingGuard};

/// Kind of runtime-allocated memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Code,
    Data,
    Info,
}

impl BlockKind {
    fn index(self) -> usize {
        match self {
            BlockKind::Code => 0,
            BlockKind::Data => 1,
            BlockKind::Info => 2,
        }
    }
}

/// Memory handed out by the runtime
///
/// The address is stable for the lifetime of the block.
#[derive(Debug)]
pub struct NativeBlock {
    kind: BlockKind,
    bytes: Box<[u8]>,
}

impl NativeBlock {
    pub fn zeroed(kind: BlockKind, size: usize) -> Self {
        NativeBlock {
            kind,
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn address(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Error allocating runtime memory
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("Out of {kind:?} memory: requested {requested} bytes, {available} available")]
    Exhausted {
        kind: BlockKind,
        requested: usize,
        available: usize,
    },
}

/// Memory provider and handler registry supplied by the runtime
pub trait RuntimeServices: Send + Sync {
    fn allocate(&self, kind: BlockKind, size: usize) -> Result<NativeBlock, AllocError>;

    /// Publish the native handler table of an installed method
    fn register_handlers(&self, method: MethodId, code_base: u64, handlers: &[NativeHandler]);
}

/// Heap-backed runtime services with an optional byte budget
#[derive(Debug, Default)]
pub struct HeapRuntime {
    limit: Option<usize>,
    allocated: AtomicUsize,
    counts: [AtomicUsize; 3],
    handlers: Mutex<FxHashMap<MethodId, Vec<NativeHandler>>>,
}

impl HeapRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse allocations once `limit` bytes have been handed out
    pub fn with_limit(limit: usize) -> Self {
        HeapRuntime {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Number of blocks of `kind` allocated so far
    pub fn allocations(&self, kind: BlockKind) -> usize {
        self.counts[kind.index()].load(Ordering::Relaxed)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Handler table registered for a method
    pub fn handlers(&self, method: MethodId) -> Option<Vec<NativeHandler>> {
        self.handlers.lock().get(&method).cloned()
    }
}

impl RuntimeServices for HeapRuntime {
    fn allocate(&self, kind: BlockKind, size: usize) -> Result<NativeBlock, AllocError> {
        if let Some(limit) = self.limit {
            let reserved = self
                .allocated
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    current.checked_add(size).filter(|&total| total <= limit)
                });
            if let Err(current) = reserved {
                return Err(AllocError::Exhausted {
                    kind,
                    requested: size,
                    available: limit.saturating_sub(current),
                });
            }
        } else {
            self.allocated.fetch_add(size, Ordering::Relaxed);
        }
        self.counts[kind.index()].fetch_add(1, Ordering::Relaxed);
        Ok(NativeBlock::zeroed(kind, size))
    }

    fn register_handlers(&self, method: MethodId, _code_base: u64, handlers: &[NativeHandler]) {
        self.handlers.lock().insert(method, handlers.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_address_is_stable() {
        let block = NativeBlock::zeroed(BlockKind::Code, 16);
        let address = block.address();
        let moved = block;
        assert_eq!(moved.address(), address);
        assert_eq!(moved.len(), 16);
        assert!(moved.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_heap_runtime_counts() {
        let runtime = HeapRuntime::new();
        runtime.allocate(BlockKind::Code, 10).unwrap();
        runtime.allocate(BlockKind::Info, 5).unwrap();
        runtime.allocate(BlockKind::Code, 1).unwrap();
        assert_eq!(runtime.allocations(BlockKind::Code), 2);
        assert_eq!(runtime.allocations(BlockKind::Data), 0);
        assert_eq!(runtime.allocated_bytes(), 16);
    }

    #[test]
    fn test_heap_runtime_limit() {
        let runtime = HeapRuntime::with_limit(20);
        runtime.allocate(BlockKind::Code, 15).unwrap();
        let err = runtime.allocate(BlockKind::Data, 10).unwrap_err();
        assert_eq!(
            err,
            AllocError::Exhausted {
                kind: BlockKind::Data,
                requested: 10,
                available: 5
            }
        );
        assert_eq!(runtime.allocations(BlockKind::Data), 0);
    }

    #[test]
    fn test_register_handlers() {
        let runtime = HeapRuntime::new();
        assert!(runtime.handlers(MethodId(1)).is_none());
        runtime.register_handlers(MethodId(1), 0, &[]);
        assert_eq!(runtime.handlers(MethodId(1)), Some(vec![]));
    }
}
