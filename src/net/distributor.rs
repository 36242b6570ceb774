//! Per-channel demultiplexing of inbound frames to typed subscribers.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::trace;

use crate::{
    protocol::message::{Identifier, Payload},
    subscriber::{Event, Key, Subscriber},
    Error,
};

/// The type-erased hooks over one message type's [`Subscriber`].
struct Slot {
    subscriber: Arc<dyn Any + Send + Sync>,
    notify: Box<dyn Fn(u32, &[u8]) -> Result<(), Error> + Send + Sync>,
    stop: Box<dyn Fn(Error) + Send + Sync>,
}

impl Slot {
    fn new<M: Payload>() -> Slot {
        let subscriber = Arc::new(Subscriber::<M>::new());

        let notifier = subscriber.clone();
        let notify = Box::new(move |version: u32, payload: &[u8]| {
            // Avoid deserialization when no subscriber wants the type.
            if notifier.is_empty() {
                return Ok(());
            }
            let message = M::deserialize(version, payload)?;
            trace!(?message, "dispatching");
            notifier.notify(Ok(Arc::new(message)));
            Ok(())
        });

        let stopper = subscriber.clone();
        let stop = Box::new(move |code: Error| stopper.stop(code));

        Slot {
            subscriber,
            notify,
            stop,
        }
    }

    fn subscriber<M: Payload>(&self) -> Arc<Subscriber<M>> {
        self.subscriber
            .clone()
            .downcast::<Subscriber<M>>()
            .expect("slot subscriber type matches its identifier")
    }
}

/// The set of typed subscribers for one channel, one per message
/// identifier.
///
/// Inbound frames deserialize only when at least one subscriber exists for
/// their identifier; frames for absent identifiers are discarded with
/// success. Subscribers see either a message or the channel's terminal code,
/// never both.
pub struct Distributor {
    inner: Mutex<DistributorInner>,
}

struct DistributorInner {
    slots: HashMap<Identifier, Arc<Slot>>,
    stopped: Option<Error>,
}

impl Default for Distributor {
    fn default() -> Self {
        Distributor::new()
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor").finish_non_exhaustive()
    }
}

impl Distributor {
    /// An empty, running distributor.
    pub fn new() -> Distributor {
        Distributor {
            inner: Mutex::new(DistributorInner {
                slots: HashMap::new(),
                stopped: None,
            }),
        }
    }

    /// Register a typed handler for `M`'s identifier.
    pub fn subscribe<M: Payload>(
        &self,
        handler: impl FnMut(Event<M>) -> bool + Send + 'static,
    ) -> Result<Key, Error> {
        let slot = {
            let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
            if inner.stopped.is_some() {
                return Err(Error::SubscriberStopped);
            }
            inner
                .slots
                .entry(M::IDENTIFIER)
                .or_insert_with(|| Arc::new(Slot::new::<M>()))
                .clone()
        };
        slot.subscriber::<M>().subscribe(handler)
    }

    /// Deserialize and fan out one inbound frame.
    ///
    /// A frame with no subscribers for its identifier is discarded with
    /// success; a frame whose body fails to parse is [`Error::InvalidMessage`],
    /// which the channel treats as a protocol violation.
    pub fn notify(&self, id: Identifier, version: u32, payload: &[u8]) -> Result<(), Error> {
        let slot = {
            let inner = self.inner.lock().expect("mutex should be unpoisoned");
            if inner.stopped.is_some() {
                return Ok(());
            }
            match inner.slots.get(&id) {
                Some(slot) => slot.clone(),
                None => {
                    trace!(%id, bytes = payload.len(), "no subscribers, discarding");
                    return Ok(());
                }
            }
        };
        (slot.notify)(version, payload)
    }

    /// Fan the terminal code out to every typed subscriber and refuse
    /// subsequent subscriptions. Idempotent.
    pub fn stop(&self, code: Error) {
        let slots = {
            let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
            if inner.stopped.is_some() {
                return;
            }
            inner.stopped = Some(code);
            std::mem::take(&mut inner.slots)
        };
        for slot in slots.values() {
            (slot.stop)(code);
        }
    }

    /// The terminal code, if stopped.
    pub fn stop_code(&self) -> Option<Error> {
        self.inner.lock().expect("mutex should be unpoisoned").stopped
    }
}
