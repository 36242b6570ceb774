//! The manual session: user-specified endpoints with unbounded retry.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::Endpoint,
    net::{Channel, Connector},
    p2p::NetworkInner,
    session::{attach_post_handshake, run_channel},
    subscriber::Event,
    Error,
};

/// A caller-provided observer of one maintained endpoint.
///
/// Invoked with the channel on each successful connection, starting with
/// the first; returning `false` stops further invocations (reconnection
/// itself continues). Invoked once with the terminal code when the session
/// stops maintaining the endpoint.
pub type ChannelHandler = Box<dyn FnMut(Event<Channel>) -> bool + Send>;

/// Maintains a connection per configured endpoint, reconnecting forever:
/// a failed connect retries after the connect timeout, a stopped channel
/// reconnects immediately.
pub struct ManualSession {
    inner: Arc<NetworkInner>,
    stop: CancellationToken,
}

impl ManualSession {
    pub(crate) fn new(inner: Arc<NetworkInner>) -> ManualSession {
        let stop = inner.stop_token.child_token();
        ManualSession { inner, stop }
    }

    /// Maintain a connection to `endpoint`.
    pub(crate) fn connect(&self, endpoint: Endpoint) {
        self.connect_with(endpoint, None);
    }

    /// Maintain a connection to `endpoint`, observing it with `handler`.
    pub(crate) fn connect_with(&self, endpoint: Endpoint, handler: Option<ChannelHandler>) {
        let inner = self.inner.clone();
        let stop = self.stop.clone();
        self.inner.executor.spawn(async move {
            maintain(inner, stop, endpoint, handler).await;
        });
    }

    /// Stop maintaining every endpoint.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }
}

async fn maintain(
    inner: Arc<NetworkInner>,
    stop: CancellationToken,
    endpoint: Endpoint,
    mut handler: Option<ChannelHandler>,
) {
    info!(%endpoint, "maintaining manual connection");
    loop {
        if stop.is_cancelled() || inner.closed() {
            break;
        }

        let connector = Connector::new(inner.settings.clone(), inner.executor.clone(), &stop);
        match connector.connect_endpoint(&endpoint).await {
            Err(Error::ChannelStopped) => break,
            Err(code) => {
                debug!(%endpoint, %code, "manual connection failed");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(inner.settings.connect_timeout()) => continue,
                }
            }
            Ok(channel) => {
                info!(
                    %endpoint,
                    authority = %channel.authority(),
                    "connected manual channel"
                );
                let code = run_channel(&inner, channel, |channel| {
                    let keep = match handler.as_mut() {
                        Some(callback) => callback(Ok(channel.clone())),
                        None => true,
                    };
                    if !keep {
                        handler = None;
                    }
                    attach_post_handshake(&inner, channel);
                })
                .await;
                debug!(%endpoint, %code, "manual channel stopped");

                // Already connected to this authority elsewhere: leave the
                // existing channel alone rather than fight over it.
                if code == Error::AddressInUse {
                    break;
                }
                // A stopped channel reconnects without delay.
            }
        }
    }
    if let Some(mut callback) = handler.take() {
        let _ = callback(Err(Error::ServiceStopped));
    }
}
