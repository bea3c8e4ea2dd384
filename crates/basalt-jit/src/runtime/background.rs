//! Background compilation workers
//!
//! Requests are queued on a bounded channel and picked up by a fixed pool of
//! named worker threads. Workers share one pipeline, context and runtime, so
//! concurrent requests for the same method race to the commit lock and
//! exactly one of them installs it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::bytecode::{MethodId, MethodSource};
use crate::compiler::{CompileOutcome, JitPipeline};
use crate::error::JitError;
use crate::masm::CodegenBackend;
use crate::runtime::{JitContext, RuntimeServices};

/// A method queued for compilation
pub struct CompilationRequest {
    pub method: Arc<dyn MethodSource>,
}

/// Outcome of one queued request
#[derive(Debug)]
pub struct CompilationResult {
    pub id: MethodId,
    pub result: Result<CompileOutcome, JitError>,
}

/// Pool of compiler threads fed through a bounded queue
pub struct BackgroundCompiler {
    tx: Option<Sender<CompilationRequest>>,
    results: Receiver<CompilationResult>,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundCompiler {
    /// Start `worker_count` compiler threads
    ///
    /// If `worker_count` is 0, defaults to the number of CPU cores.
    pub fn start<B>(
        pipeline: Arc<JitPipeline<B>>,
        ctx: Arc<JitContext>,
        runtime: Arc<dyn RuntimeServices>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self
    where
        B: CodegenBackend + 'static,
    {
        let worker_count = if worker_count == 0 {
            num_cpus::get()
        } else {
            worker_count
        };
        let (tx, rx) = channel::bounded::<CompilationRequest>(queue_capacity);
        let (result_tx, results) = channel::unbounded();

        let workers = (0..worker_count)
            .map(|id| {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                let pipeline = pipeline.clone();
                let ctx = ctx.clone();
                let runtime = runtime.clone();
                thread::Builder::new()
                    .name(format!("basalt-jit-{}", id))
                    .spawn(move || {
                        for request in rx.iter() {
                            let method = request.method;
                            let result = pipeline.compile(&ctx, runtime.as_ref(), method.as_ref());
                            let done = CompilationResult {
                                id: method.id(),
                                result,
                            };
                            if result_tx.send(done).is_err() {
                                tracing::trace!(worker = id, "result receiver dropped");
                            }
                        }
                        tracing::trace!(worker = id, "compiler worker exiting");
                    })
                    .expect("Failed to spawn compiler worker thread")
            })
            .collect();

        tracing::debug!(workers = worker_count, queue_capacity, "background compiler started");

        BackgroundCompiler {
            tx: Some(tx),
            results,
            workers,
        }
    }

    /// Queue a compilation request (non-blocking)
    ///
    /// Returns false if the queue is full or the compiler is shut down.
    pub fn try_submit(&self, method: Arc<dyn MethodSource>) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(CompilationRequest { method }).is_ok(),
            None => false,
        }
    }

    /// Completed compilations, in completion order
    pub fn results(&self) -> &Receiver<CompilationResult> {
        &self.results
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting requests and wait for queued ones to finish
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("compiler worker panicked");
            }
        }
    }
}

impl Drop for BackgroundCompiler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Method, Opcode, Signature, ValueType};
    use crate::config::JitConfig;
    use crate::masm::PortableBackend;
    use crate::runtime::HeapRuntime;

    fn method(id: u64) -> Arc<dyn MethodSource> {
        let mut b = BytecodeBuilder::new();
        b.op(Opcode::Iconst1).op(Opcode::Ireturn);
        Arc::new(
            Method::new(MethodId(id), "one", b.finish().unwrap())
                .with_limits(0, 1)
                .with_signature(Signature::new(vec![], Some(ValueType::Int))),
        )
    }

    fn compiler(workers: usize, capacity: usize) -> (BackgroundCompiler, Arc<JitContext>) {
        let pipeline = Arc::new(JitPipeline::new(
            PortableBackend::portable64(),
            JitConfig::default(),
        ));
        let ctx = Arc::new(JitContext::new());
        let runtime: Arc<dyn RuntimeServices> = Arc::new(HeapRuntime::new());
        (
            BackgroundCompiler::start(pipeline, ctx.clone(), runtime, workers, capacity),
            ctx,
        )
    }

    #[test]
    fn test_compiles_submitted_methods() {
        let (mut bg, ctx) = compiler(2, 16);
        for id in 0..4 {
            assert!(bg.try_submit(method(id)));
        }
        bg.shutdown();

        let results: Vec<CompilationResult> = bg.results().try_iter().collect();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| matches!(r.result, Ok(CompileOutcome::Installed(_)))));
        assert_eq!(ctx.installed_count(), 4);
    }

    #[test]
    fn test_duplicate_requests_install_once() {
        let (mut bg, ctx) = compiler(4, 16);
        for _ in 0..8 {
            assert!(bg.try_submit(method(42)));
        }
        bg.shutdown();

        let installed = bg
            .results()
            .try_iter()
            .filter(|r| matches!(r.result, Ok(CompileOutcome::Installed(_))))
            .count();
        assert_eq!(installed, 1);
        assert_eq!(ctx.installed_count(), 1);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let (mut bg, _) = compiler(1, 1);
        bg.shutdown();
        assert!(!bg.try_submit(method(1)));
        assert_eq!(bg.worker_count(), 0);
    }

    #[test]
    fn test_zero_workers_uses_cpu_count() {
        let (bg, _) = compiler(0, 1);
        assert_eq!(bg.worker_count(), num_cpus::get());
    }
}
