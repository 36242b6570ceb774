//! Fan-out of a single message to all open channels.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::{net::Channel, protocol::message::Payload, Error};

/// The registry of live channels, keyed by channel nonce, and the broadcast
/// fan-out over it.
///
/// Registration mirrors supervisor channel counting: a channel is present
/// exactly while it is counted, so a broadcast reaches every open channel
/// and no stopped one.
pub struct Broadcaster {
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Broadcaster::new()
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("channels", &self.len())
            .finish()
    }
}

impl Broadcaster {
    /// An empty registry.
    pub fn new() -> Broadcaster {
        Broadcaster {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register a live channel.
    pub fn register(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock().expect("mutex should be unpoisoned");
        if channels.insert(channel.nonce(), channel.clone()).is_some() {
            debug!(nonce = channel.nonce(), "replaced a registered channel");
        }
    }

    /// Remove a channel by nonce.
    pub fn unregister(&self, nonce: u64) {
        self.channels
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&nonce);
    }

    /// The number of registered channels.
    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .expect("mutex should be unpoisoned")
            .len()
    }

    /// True when no channels are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the registered channels.
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels
            .lock()
            .expect("mutex should be unpoisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Send one message to every registered channel, concurrently.
    ///
    /// Per-channel failures stop that channel (via its send path) and are
    /// absorbed; the count of successful sends is returned.
    pub async fn broadcast<M: Payload>(&self, message: M) -> usize {
        let channels = self.snapshot();
        let command = M::IDENTIFIER;
        trace!(%command, channels = channels.len(), "broadcasting");

        let mut sends: FuturesUnordered<_> = channels
            .iter()
            .map(|channel| {
                let message = message.clone();
                async move { channel.send(&message).await }
            })
            .collect();

        let mut delivered = 0;
        while let Some(result) = sends.next().await {
            match result {
                Ok(()) => delivered += 1,
                Err(code) => debug!(%code, "broadcast send failed"),
            }
        }
        delivered
    }

    /// Stop every registered channel with `code` and clear the registry.
    pub fn stop(&self, code: Error) {
        let channels: Vec<Arc<Channel>> = {
            let mut channels = self.channels.lock().expect("mutex should be unpoisoned");
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.stop(code);
        }
    }
}
