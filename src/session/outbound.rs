//! The outbound session: batched connect races over the host pool.

use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    net::{Channel, Connector},
    p2p::NetworkInner,
    protocol::addr::AddressItem,
    session::{attach_post_handshake, run_channel},
    Error,
};

/// Maintains the configured number of outbound slots.
///
/// Each slot runs a batched connect cycle: `connect_batch_size` connectors
/// race over distinct candidates drawn from the host pool, the first
/// success is adopted and the rest are stopped with their candidates
/// restored. An empty pool parks the slot against the pool's count watch
/// instead of spinning; a wholly failed batch retries after the retry
/// timeout.
pub struct OutboundSession {
    inner: Arc<NetworkInner>,
    stop: CancellationToken,
}

impl OutboundSession {
    pub(crate) fn new(inner: Arc<NetworkInner>) -> OutboundSession {
        let stop = inner.stop_token.child_token();
        OutboundSession { inner, stop }
    }

    /// Spawn the outbound slots.
    ///
    /// Returns `Bypassed` when outbound connections are disabled.
    pub(crate) async fn start(&self) -> Result<(), Error> {
        let settings = &self.inner.settings;
        if settings.outbound_connections == 0 || !settings.outbound_enabled() {
            return Err(Error::Bypassed);
        }

        info!(
            slots = settings.outbound_connections,
            batch = settings.connect_batch_size,
            "starting outbound connections"
        );
        for slot in 0..settings.outbound_connections {
            let inner = self.inner.clone();
            let stop = self.stop.clone();
            self.inner.executor.spawn(async move {
                batch_loop(inner, stop, slot).await;
            });
        }
        Ok(())
    }

    /// Stop every slot.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }
}

async fn batch_loop(inner: Arc<NetworkInner>, stop: CancellationToken, slot: u16) {
    let settings = inner.settings.clone();
    let batch_size = usize::from(settings.connect_batch_size.max(1));
    let mut counts = inner.hosts.subscribe_count();

    loop {
        if stop.is_cancelled() || inner.closed() {
            return;
        }

        // Draw distinct candidates for the batch.
        let mut drawn: Vec<AddressItem> = Vec::with_capacity(batch_size);
        while drawn.len() < batch_size {
            match inner.hosts.take() {
                Ok(address) => {
                    if settings.blacklisted(&address) {
                        debug!(authority = %address.authority(), "dropping blocked candidate");
                        continue;
                    }
                    drawn.push(address);
                }
                Err(_) => break,
            }
        }

        if drawn.is_empty() {
            // Park against the pool instead of spinning on it.
            tokio::select! {
                _ = stop.cancelled() => return,
                changed = counts.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        match race(&inner, &stop, drawn).await {
            None => {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(settings.retry_timeout()) => continue,
                }
            }
            Some(channel) => {
                let authority = channel.authority();
                let code =
                    run_channel(&inner, channel, |channel| attach_post_handshake(&inner, channel))
                        .await;
                debug!(slot, %authority, %code, "outbound channel stopped");
            }
        }
    }
}

/// Race one batch of connectors; the first success wins.
async fn race(
    inner: &Arc<NetworkInner>,
    stop: &CancellationToken,
    drawn: Vec<AddressItem>,
) -> Option<Arc<Channel>> {
    let batch = stop.child_token();
    let mut attempts: FuturesUnordered<_> = drawn
        .into_iter()
        .map(|address| {
            let connector =
                Connector::new(inner.settings.clone(), inner.executor.clone(), &batch);
            async move { (address, connector.connect_authority(address.authority()).await) }
        })
        .collect();

    let mut winner = None;
    while let Some((address, outcome)) = attempts.next().await {
        match outcome {
            Ok(channel) if winner.is_none() => {
                // Cancel the rest of the batch; their completions land as
                // `ChannelStopped` below.
                batch.cancel();
                winner = Some(channel);
            }
            Ok(channel) => {
                // A second success that crossed the cancellation.
                channel.stop(Error::ChannelStopped);
                inner.hosts.restore(&address);
            }
            Err(Error::ChannelStopped) => {
                // A cancelled loser; its candidate was never used.
                inner.hosts.restore(&address);
            }
            Err(code) => {
                debug!(authority = %address.authority(), %code, "outbound attempt failed");
            }
        }
    }
    winner
}
