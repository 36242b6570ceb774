//! The shared worker pool and its serialising strands.

mod strand;
mod timer;

pub use strand::Strand;
pub use timer::DeadlineTimer;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

use crate::Error;

/// The shared worker pool.
///
/// Owns a tokio multi-thread runtime sized by `settings.threads`, or borrows
/// the ambient runtime when the engine is embedded in one
/// ([`Executor::current`]). All tasks (read loops, sessions, strand
/// dispatchers, timers) are spawned here.
#[derive(Clone)]
pub struct Executor {
    handle: Handle,
    runtime: Arc<Mutex<Option<Runtime>>>,
    strand_ids: Arc<AtomicU64>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("owned", &self.is_owned())
            .finish()
    }
}

impl Executor {
    /// Build an owned pool with `threads` workers (at least one).
    pub fn new(threads: u32) -> Result<Executor, Error> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1) as usize)
            .thread_name("bitcoin-network")
            .enable_all()
            .build()
            .map_err(|err| {
                tracing::error!(?err, "failed to build worker pool");
                Error::OperationFailed
            })?;
        Ok(Executor {
            handle: runtime.handle().clone(),
            runtime: Arc::new(Mutex::new(Some(runtime))),
            strand_ids: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Borrow the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime context.
    pub fn current() -> Executor {
        Executor {
            handle: Handle::current(),
            runtime: Arc::new(Mutex::new(None)),
            strand_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    /// True when this executor owns its runtime (and [`shutdown`] joins it).
    ///
    /// [`shutdown`]: Executor::shutdown
    pub fn is_owned(&self) -> bool {
        self.runtime
            .lock()
            .expect("mutex should be unpoisoned")
            .is_some()
    }

    /// Spawn a task on the pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Create a new strand over this pool.
    pub fn strand(&self) -> Strand {
        let id = self.strand_ids.fetch_add(1, Ordering::Relaxed) + 1;
        Strand::start(self, id)
    }

    /// Stop the owned runtime, waiting up to `timeout` for workers to
    /// coalesce. A borrowed runtime is left running.
    ///
    /// Must be called from a thread that is not a worker in this pool; when
    /// called from a worker the runtime is released in the background
    /// instead of joined.
    pub fn shutdown(&self, timeout: Duration) {
        let runtime = self
            .runtime
            .lock()
            .expect("mutex should be unpoisoned")
            .take();
        let Some(runtime) = runtime else { return };

        // Joining blocks, which a runtime worker may not do; from any async
        // context the pool is released in the background instead.
        if Handle::try_current().is_ok() {
            tracing::warn!("shutdown called from an async context, not joining");
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_executor_runs_and_joins() {
        let executor = Executor::new(2).expect("pool should build");
        assert!(executor.is_owned());

        let (tx, rx) = std::sync::mpsc::channel();
        executor.spawn(async move {
            let _ = tx.send(1usize);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));

        executor.shutdown(Duration::from_secs(5));
        assert!(!executor.is_owned());
        // Idempotent.
        executor.shutdown(Duration::from_secs(5));
    }

    #[tokio::test]
    async fn borrowed_executor_spawns_on_ambient_runtime() {
        let executor = Executor::current();
        assert!(!executor.is_owned());
        let value = executor.spawn(async { 42 }).await.expect("task");
        assert_eq!(value, 42);
        // Shutdown of a borrowed runtime is a no-op.
        executor.shutdown(Duration::ZERO);
    }
}
