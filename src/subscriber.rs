//! Typed multi-handler fan-out with stop semantics.

use std::sync::{Arc, Mutex};

use crate::Error;

/// The key identifying one subscription.
pub type Key = u64;

/// A subscription event: a value, or the terminal code.
pub type Event<T> = Result<Arc<T>, Error>;

type Handler<T> = Box<dyn FnMut(Event<T>) -> bool + Send>;

struct Inner<T> {
    handlers: Vec<(Key, Handler<T>)>,
    next_key: Key,
    stopped: Option<Error>,
}

/// An ordered collection of event handlers.
///
/// Handlers fan out in subscription order and return `true` to stay
/// subscribed. [`stop`] delivers the terminal code to every handler exactly
/// once and drops them; later subscriptions fail with `SubscriberStopped`.
///
/// Handlers are moved out of the internal lock for the duration of a
/// fan-out, so a handler may call back into its own subscriber (including
/// [`stop`]) without deadlocking; a stop that lands mid-fan-out is delivered
/// to the surviving handlers when the fan-out completes.
///
/// [`stop`]: Subscriber::stop
pub struct Subscriber<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Subscriber<T> {
    fn default() -> Self {
        Subscriber::new()
    }
}

impl<T> std::fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't block if the subscriber is mid-notification.
        f.debug_struct("Subscriber")
            .field("state", &self.inner.try_lock().map(|_| "idle"))
            .finish()
    }
}

impl<T> Subscriber<T> {
    /// An empty, running subscriber.
    pub fn new() -> Subscriber<T> {
        Subscriber {
            inner: Mutex::new(Inner {
                handlers: Vec::new(),
                next_key: 0,
                stopped: None,
            }),
        }
    }

    /// Register a handler under the next internal key.
    pub fn subscribe(
        &self,
        handler: impl FnMut(Event<T>) -> bool + Send + 'static,
    ) -> Result<Key, Error> {
        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        if inner.stopped.is_some() {
            return Err(Error::SubscriberStopped);
        }
        // At one key per subscription this overflows after ~2^64; report and
        // restart numbering.
        inner.next_key = inner.next_key.wrapping_add(1);
        if inner.next_key == 0 {
            tracing::error!("subscription key overflow");
            inner.next_key = 1;
        }
        let key = inner.next_key;
        inner.handlers.push((key, Box::new(handler)));
        Ok(key)
    }

    /// Register a handler under a caller-provided key.
    ///
    /// Returns `SubscriberExists` when the key is already registered.
    pub fn subscribe_with_key(
        &self,
        key: Key,
        handler: impl FnMut(Event<T>) -> bool + Send + 'static,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        if inner.stopped.is_some() {
            return Err(Error::SubscriberStopped);
        }
        if inner.handlers.iter().any(|(existing, _)| *existing == key) {
            return Err(Error::SubscriberExists);
        }
        inner.handlers.push((key, Box::new(handler)));
        Ok(())
    }

    /// Fan an event out to every handler, in subscription order, dropping
    /// handlers that return `false`.
    pub fn notify(&self, event: Event<T>) {
        let mut active = {
            let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
            if inner.stopped.is_some() {
                return;
            }
            std::mem::take(&mut inner.handlers)
        };

        active.retain_mut(|(_, handler)| handler(event.clone()));

        let orphaned = {
            let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
            match inner.stopped {
                // A stop landed during the fan-out and drained an empty
                // list; deliver the terminal code to the survivors here.
                Some(code) => Some((code, active)),
                None => {
                    // Keep fan-out order ahead of handlers subscribed during
                    // the notification.
                    let subscribed_during = std::mem::take(&mut inner.handlers);
                    inner.handlers = active;
                    inner.handlers.extend(subscribed_during);
                    None
                }
            }
        };

        if let Some((code, survivors)) = orphaned {
            for (_, mut handler) in survivors {
                let _ = handler(Err(code));
            }
        }
    }

    /// Deliver an event to one handler, dropping it if it returns `false`.
    ///
    /// Returns `true` when the key was found.
    pub fn notify_one(&self, key: Key, event: Event<T>) -> bool {
        let handler = {
            let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
            match inner.handlers.iter().position(|(existing, _)| *existing == key) {
                Some(index) => inner.handlers.remove(index),
                None => return false,
            }
        };

        let (key, mut callback) = handler;
        let retain = callback(event);

        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        if retain && inner.stopped.is_none() {
            inner.handlers.push((key, callback));
        } else if retain {
            // Stopped while the handler was out; deliver its terminal.
            let code = inner.stopped.unwrap_or(Error::SubscriberStopped);
            drop(inner);
            let _ = callback(Err(code));
        }
        true
    }

    /// Deliver `code` to every handler exactly once and drop them all.
    /// Subsequent subscriptions fail with `SubscriberStopped`. Idempotent.
    pub fn stop(&self, code: Error) {
        let drained = {
            let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
            if inner.stopped.is_some() {
                return;
            }
            inner.stopped = Some(code);
            std::mem::take(&mut inner.handlers)
        };

        for (_, mut handler) in drained {
            let _ = handler(Err(code));
        }
    }

    /// The terminal code, if stopped.
    pub fn stop_code(&self) -> Option<Error> {
        self.inner.lock().expect("mutex should be unpoisoned").stopped
    }

    /// The number of live subscriptions.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("mutex should be unpoisoned")
            .handlers
            .len()
    }

    /// True when no handlers are subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
