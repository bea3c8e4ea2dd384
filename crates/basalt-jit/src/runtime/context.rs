//! Per-runtime JIT context
//!
//! Compilations run in parallel up to the commit phase. Committing (the
//! duplicate check, memory allocation, layout, patching, handler
//! registration and the registry insert) happens under one mutex, so a
//! method is installed at most once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::bytecode::MethodId;
use crate::compiler::CompileOutcome;
use crate::error::JitError;
use crate::info::CompiledMethod;

/// Counters describing the JIT's activity
#[derive(Debug, Default)]
pub struct JitStats {
    compiled: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    code_bytes: AtomicU64,
    max_nesting: AtomicUsize,
}

/// Point-in-time copy of [`JitStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitStatsSnapshot {
    pub compiled: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub code_bytes: u64,
    pub max_nesting: usize,
}

impl JitStats {
    pub fn snapshot(&self) -> JitStatsSnapshot {
        JitStatsSnapshot {
            compiled: self.compiled.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            code_bytes: self.code_bytes.load(Ordering::Relaxed),
            max_nesting: self.max_nesting.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the nesting counter when dropped
pub struct NestingGuard<'a> {
    ctx: &'a JitContext,
    depth: usize,
}

impl NestingGuard<'_> {
    /// Compilations in progress on this context, this one included
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        self.ctx.nesting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Commit lock, installed-method registry and statistics
#[derive(Debug, Default)]
pub struct JitContext {
    installed: Mutex<FxHashMap<MethodId, Arc<CompiledMethod>>>,
    nesting: AtomicUsize,
    stats: JitStats,
}

impl JitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one more compilation in progress; diagnostics only
    pub fn enter(&self) -> NestingGuard<'_> {
        let depth = self.nesting.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.max_nesting.fetch_max(depth, Ordering::Relaxed);
        NestingGuard { ctx: self, depth }
    }

    pub fn installed(&self, id: MethodId) -> Option<Arc<CompiledMethod>> {
        self.installed.lock().get(&id).cloned()
    }

    pub fn installed_count(&self) -> usize {
        self.installed.lock().len()
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    /// Run `install` under the commit lock unless `id` is already installed
    ///
    /// A method installed by a concurrent compilation is a success: the
    /// existing entry is returned and `install` never runs.
    pub fn commit<F>(&self, id: MethodId, install: F) -> Result<CompileOutcome, JitError>
    where
        F: FnOnce() -> Result<CompiledMethod, JitError>,
    {
        let mut installed = self.installed.lock();
        if let Some(existing) = installed.get(&id) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(method = %id, "discarding duplicate compilation");
            return Ok(CompileOutcome::AlreadyInstalled(existing.clone()));
        }

        let method = Arc::new(install()?);
        self.stats.compiled.fetch_add(1, Ordering::Relaxed);
        self.stats
            .code_bytes
            .fetch_add(method.code.len() as u64, Ordering::Relaxed);
        installed.insert(id, method.clone());
        Ok(CompileOutcome::Installed(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{FrameDescriptor, MethodInfo, PcMap, SafepointMap};
    use crate::runtime::{BlockKind, NativeBlock};

    fn compiled(id: u64, size: usize) -> CompiledMethod {
        CompiledMethod {
            id: MethodId(id),
            name: "t".into(),
            code: NativeBlock::zeroed(BlockKind::Code, size),
            data: None,
            info_block: NativeBlock::zeroed(BlockKind::Info, 0),
            info: MethodInfo {
                frame: FrameDescriptor {
                    arg_slots: 0,
                    max_locals: 0,
                    max_stack: 0,
                    frame_size: 16,
                    saved: vec![],
                    locals: vec![],
                },
                pc_map: PcMap::build(1, size as u32, vec![(0, 1, 0)]),
                safepoints: SafepointMap::default(),
            },
            handlers: vec![],
        }
    }

    #[test]
    fn test_commit_installs_once() {
        let ctx = JitContext::new();
        let first = ctx.commit(MethodId(1), || Ok(compiled(1, 8))).unwrap();
        assert!(matches!(first, CompileOutcome::Installed(_)));

        let second = ctx
            .commit(MethodId(1), || panic!("duplicate must not be built"))
            .unwrap();
        assert!(matches!(second, CompileOutcome::AlreadyInstalled(_)));

        let stats = ctx.stats().snapshot();
        assert_eq!(stats.compiled, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.code_bytes, 8);
        assert_eq!(ctx.installed_count(), 1);
    }

    #[test]
    fn test_failed_install_leaves_nothing() {
        let ctx = JitContext::new();
        let result = ctx.commit(MethodId(2), || Err(JitError::malformed(0, "boom")));
        assert!(result.is_err());
        assert!(ctx.installed(MethodId(2)).is_none());
    }

    #[test]
    fn test_nesting_is_tracked() {
        let ctx = JitContext::new();
        {
            let outer = ctx.enter();
            let inner = ctx.enter();
            assert_eq!(outer.depth(), 1);
            assert_eq!(inner.depth(), 2);
        }
        let _again = ctx.enter();
        assert_eq!(ctx.stats().snapshot().max_nesting, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&JitStatsSnapshot::default()).unwrap();
        assert!(json.contains("\"duplicates\":0"));
    }
}
