// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

///
/// Carries the caller's workunit store handle into a spawned task, so that workunits started by
/// the task are parented under the caller's workunit.
///
/// NB: The capture must happen synchronously on the calling thread, which is why this is not an
/// `async fn`.
///
fn future_with_correct_context<F: Future>(future: F) -> impl Future<Output = F::Output> {
    let workunit_store_handle = workunit_store::get_workunit_store_handle();
    workunit_store::scope_task_workunit_store_handle(workunit_store_handle, future)
}

///
/// A handle to a tokio Runtime used to run rule and node computations.
///
/// An Executor is either:
/// * "borrowed": created with `Self::new()` or `Self::to_borrowed()`. The Runtime belongs to
///   someone else (usually a `#[tokio::test]` or `#[tokio::main]` macro), and `shutdown` is a
///   no-op.
/// * "owned": created with `Self::new_owned()`. The Runtime is shut down either explicitly via
///   `shutdown`, or when the last clone is dropped.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Borrows the Runtime of the current context. Panics if called outside of a Runtime.
    ///
    pub fn new() -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Starts a new multi-threaded Runtime owned by the returned Executor.
    ///
    /// `max_threads` bounds the worker threads plus the blocking pool, and so must be larger than
    /// `num_worker_threads`.
    ///
    pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
        if max_threads <= num_worker_threads {
            return Err(format!(
                "max_threads ({max_threads}) must be greater than num_worker_threads ({num_worker_threads})."
            ));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads - num_worker_threads)
            .thread_name("rule-engine-worker")
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// A clone of this Executor that shares its Runtime, but which cannot shut it down.
    ///
    pub fn to_borrowed(&self) -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    ///
    /// Spawns the given Future as a new Task, and returns a Future for its output.
    ///
    /// If the Task panics or is cancelled, `rescue_join_error` converts the JoinError into an
    /// output. Dropping the returned Future does not cancel the Task.
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Spawns the given Future as a new Task, returning tokio's JoinHandle for it.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future_with_correct_context(future))
    }

    ///
    /// Runs the given Future to completion on the current thread.
    ///
    /// Must not be called from within a Task: it is intended for the synchronous entrypoints of
    /// the engine.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future_with_correct_context(future))
    }

    ///
    /// Runs the given closure on the blocking pool, and returns a Future for its output.
    ///
    /// As with `spawn`, `rescue_join_error` handles panics.
    ///
    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R> {
        self.native_spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        let workunit_store_handle = workunit_store::get_workunit_store_handle();
        self.handle.spawn_blocking(move || {
            workunit_store::set_thread_workunit_store_handle(workunit_store_handle);
            f()
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// Shuts down an owned Runtime, waiting up to `timeout` for running Tasks. Tasks that are
    /// still running after the timeout are leaked.
    ///
    /// Has no effect for a borrowed Executor.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took longer than {timeout:?}: tasks were likely leaked.");
        }
    }

    /// True if `shutdown` has been called. Always true for a borrowed Executor.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}
