//! A cancellable one-shot timer bound to a strand.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::AbortHandle;

use super::{Executor, Strand};
use crate::Error;

type Handler = Box<dyn FnOnce(Result<(), Error>) + Send>;

struct Armed {
    handler: Handler,
    abort: Option<AbortHandle>,
}

struct TimerState {
    generation: u64,
    armed: Option<Armed>,
}

/// A deadline timer.
///
/// At most one handler is armed at a time. Expiry posts `Ok(())` to the
/// strand; cancellation (by [`stop`] or by re-arming) posts
/// `Err(OperationCanceled)`. Expiry and cancellation are mutually exclusive
/// for a given arm, so a handler fires exactly once.
///
/// [`stop`]: DeadlineTimer::stop
pub struct DeadlineTimer {
    executor: Executor,
    strand: Strand,
    duration: Duration,
    state: Arc<Mutex<TimerState>>,
}

impl std::fmt::Debug for DeadlineTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineTimer")
            .field("duration", &self.duration)
            .finish()
    }
}

impl DeadlineTimer {
    /// Construct a timer with a default duration.
    pub fn new(executor: &Executor, strand: Strand, duration: Duration) -> DeadlineTimer {
        DeadlineTimer {
            executor: executor.clone(),
            strand,
            duration,
            state: Arc::new(Mutex::new(TimerState {
                generation: 0,
                armed: None,
            })),
        }
    }

    /// Arm with the default duration.
    pub fn start(&self, handler: impl FnOnce(Result<(), Error>) + Send + 'static) {
        self.start_with(self.duration, handler);
    }

    /// Arm (or re-arm) with an explicit duration. A previously armed handler
    /// is cancelled and receives `OperationCanceled`.
    pub fn start_with(
        &self,
        duration: Duration,
        handler: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) {
        let mut state = self.state.lock().expect("mutex should be unpoisoned");

        if let Some(previous) = state.armed.take() {
            if let Some(abort) = previous.abort {
                abort.abort();
            }
            let cancelled = previous.handler;
            self.strand.post(move || cancelled(Err(Error::OperationCanceled)));
        }

        state.generation += 1;
        let generation = state.generation;

        let shared = Arc::clone(&self.state);
        let strand = self.strand.clone();
        let task = self.executor.spawn(async move {
            tokio::time::sleep(duration).await;
            let handler = {
                let mut state = shared.lock().expect("mutex should be unpoisoned");
                if state.generation != generation {
                    return;
                }
                match state.armed.take() {
                    Some(armed) => armed.handler,
                    None => return,
                }
            };
            strand.post(move || handler(Ok(())));
        });

        state.armed = Some(Armed {
            handler: Box::new(handler),
            abort: Some(task.abort_handle()),
        });
    }

    /// Cancel a pending arm; the armed handler (if any) receives
    /// `OperationCanceled`. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("mutex should be unpoisoned");
        state.generation += 1;
        if let Some(armed) = state.armed.take() {
            if let Some(abort) = armed.abort {
                abort.abort();
            }
            let cancelled = armed.handler;
            self.strand.post(move || cancelled(Err(Error::OperationCanceled)));
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn fixture() -> (Executor, Strand) {
        let executor = Executor::current();
        let strand = executor.strand();
        (executor, strand)
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_posts_success_once() {
        let (executor, strand) = fixture();
        let timer = DeadlineTimer::new(&executor, strand, Duration::from_secs(5));

        let (tx, mut rx) = mpsc::unbounded_channel();
        timer.start(move |result| {
            let _ = tx.send(result);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(Ok(())));
        // No second event for the same arm.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_posts_cancellation_instead_of_expiry() {
        let (executor, strand) = fixture();
        let timer = DeadlineTimer::new(&executor, strand, Duration::from_secs(5));

        let (tx, mut rx) = mpsc::unbounded_channel();
        timer.start(move |result| {
            let _ = tx.send(result);
        });
        timer.stop();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.recv().await, Some(Err(Error::OperationCanceled)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_cancels_the_prior_handler() {
        let (executor, strand) = fixture();
        let timer = DeadlineTimer::new(&executor, strand, Duration::from_secs(5));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        timer.start(move |result| {
            let _ = first.send(("first", result));
        });
        timer.start_with(Duration::from_secs(1), move |result| {
            let _ = tx.send(("second", result));
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(("first", Err(Error::OperationCanceled))));
        assert_eq!(rx.recv().await, Some(("second", Ok(()))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_arm_is_a_no_op() {
        let (executor, strand) = fixture();
        let timer = DeadlineTimer::new(&executor, strand, Duration::from_secs(5));
        timer.stop();
        timer.stop();
    }
}
