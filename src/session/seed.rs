//! The seed session: short-lived address discovery.

use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::Endpoint,
    net::Connector,
    p2p::NetworkInner,
    protocols::SeedProtocol,
    session::run_channel,
    Error,
};

/// Connects to the configured DNS seed endpoints on quiet channels,
/// exchanges addresses into the host pool, and stops.
///
/// The session completes when the pool first reaches the address quorum or
/// when the last seed finishes, whichever is first. Per-seed failures are
/// absorbed.
pub struct SeedSession {
    inner: Arc<NetworkInner>,
    stop: CancellationToken,
}

impl SeedSession {
    pub(crate) fn new(inner: Arc<NetworkInner>) -> SeedSession {
        let stop = inner.stop_token.child_token();
        SeedSession { inner, stop }
    }

    /// Run the seeding round.
    ///
    /// Returns `Bypassed` when the host pool is disabled,
    /// `SeedingUnsuccessful` when seeding could not grow the pool.
    pub(crate) async fn start(&self) -> Result<(), Error> {
        let settings = &self.inner.settings;
        if settings.host_pool_capacity == 0 {
            return Err(Error::Bypassed);
        }

        let minimum = settings.minimum_address_count();
        let start_count = self.inner.hosts.count();
        if start_count >= minimum {
            debug!(count = start_count, "host pool already populated");
            return Ok(());
        }
        if settings.seeds.is_empty() {
            debug!("no seeds configured");
            return Err(Error::SeedingUnsuccessful);
        }

        info!(seeds = settings.seeds.len(), "seeding the host pool");
        let mut rounds: FuturesUnordered<_> = settings
            .seeds
            .iter()
            .cloned()
            .map(|seed| self.seed(seed))
            .collect();
        let mut counts = self.inner.hosts.subscribe_count();

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Err(Error::ServiceStopped),
                changed = counts.changed() => {
                    if changed.is_ok() && *counts.borrow() >= minimum {
                        info!(count = *counts.borrow(), "address quorum reached");
                        return Ok(());
                    }
                }
                outcome = rounds.next() => if outcome.is_none() { break },
            }
        }

        let count = self.inner.hosts.count();
        if count > start_count {
            info!(count, "seeding complete");
            Ok(())
        } else {
            Err(Error::SeedingUnsuccessful)
        }
    }

    /// Contact one seed; absorb its failures.
    async fn seed(&self, seed: Endpoint) {
        let connector = Connector::new(
            self.inner.settings.clone(),
            self.inner.executor.clone(),
            &self.stop,
        );
        debug!(%seed, "contacting seed");
        let channel = match connector.connect_endpoint(&seed).await {
            Ok(channel) => channel,
            Err(code) => {
                debug!(%seed, %code, "seed connection failed");
                return;
            }
        };
        channel.set_quiet();

        let inner = self.inner.clone();
        let lifecycle = {
            let channel = channel.clone();
            self.inner.executor.spawn(async move {
                run_channel(&inner, channel.clone(), |channel| {
                    let _ = SeedProtocol::start(channel, &inner.settings, &inner.hosts);
                })
                .await
            })
        };

        let mut lifecycle = lifecycle;
        tokio::select! {
            outcome = &mut lifecycle => {
                if let Ok(code) = outcome {
                    debug!(%seed, %code, "seed channel stopped");
                }
            }
            _ = tokio::time::sleep(self.inner.settings.channel_germination()) => {
                debug!(%seed, "seeding timed out");
                channel.stop(Error::OperationTimeout);
                let _ = lifecycle.await;
            }
        }
    }
}
