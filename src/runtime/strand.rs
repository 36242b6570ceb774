//! Serialising virtual single-threaded executors.

use tokio::sync::{mpsc, oneshot};

use super::Executor;
use crate::Error;

tokio::task_local! {
    static ACTIVE_STRAND: u64;
}

type Job = Box<dyn FnOnce() + Send>;

/// A strand: tasks posted to the same strand run one at a time, in post
/// order, on the shared pool.
///
/// A dedicated dispatcher task drains an unbounded queue; jobs are plain
/// closures and run to completion before the next job starts. Asynchronous
/// work is never performed *on* a strand: I/O and timers run elsewhere and
/// post their completions here, so code between posts runs uninterrupted.
#[derive(Clone, Debug)]
pub struct Strand {
    tx: mpsc::UnboundedSender<Job>,
    id: u64,
}

impl Strand {
    pub(super) fn start(executor: &Executor, id: u64) -> Strand {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        executor.spawn(async move {
            while let Some(job) = rx.recv().await {
                ACTIVE_STRAND.sync_scope(id, job);
            }
        });
        Strand { tx, id }
    }

    /// Queue a job. Jobs run in post order, never concurrently with another
    /// job on the same strand.
    ///
    /// Posting to a strand whose pool has shut down silently drops the job.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }

    /// Queue a job and await its result.
    ///
    /// Returns [`Error::ServiceStopped`] when the pool has shut down before
    /// the job ran. Must not be called from the strand itself.
    pub async fn run<R, F>(&self, job: F) -> Result<R, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        debug_assert!(!self.running_in_this_strand(), "strand re-entry");
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(job());
        });
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    /// True when called from a job running on this strand.
    pub fn running_in_this_strand(&self) -> bool {
        ACTIVE_STRAND
            .try_with(|active| *active == self.id)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn jobs_run_in_post_order() {
        let executor = Executor::current();
        let strand = executor.strand();

        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..1_000usize {
            let order = order.clone();
            strand.post(move || {
                order.lock().expect("mutex should be unpoisoned").push(index)
            });
        }
        // The barrier job runs after everything posted before it.
        strand.run(|| ()).await.expect("barrier");

        let observed = order.lock().expect("mutex should be unpoisoned");
        assert_eq!(*observed, (0..1_000).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn jobs_on_one_strand_never_overlap() {
        let executor = Executor::current();
        let strand = executor.strand();

        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        for _ in 0..500usize {
            let running = running.clone();
            let overlapped = overlapped.clone();
            strand.post(move || {
                if running.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::yield_now();
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        strand.run(|| ()).await.expect("barrier");
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_in_this_strand_is_observable() {
        let executor = Executor::current();
        let strand = executor.strand();
        let other = executor.strand();

        assert!(!strand.running_in_this_strand());

        let probe = strand.clone();
        let cross = other.clone();
        let (own, foreign) = strand
            .run(move || (probe.running_in_this_strand(), cross.running_in_this_strand()))
            .await
            .expect("job");
        assert!(own);
        assert!(!foreign);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_returns_the_job_result() {
        let executor = Executor::current();
        let strand = executor.strand();
        assert_eq!(strand.run(|| 6 * 7).await.expect("job"), 42);
    }
}
