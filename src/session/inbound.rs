//! The inbound session: one acceptor per configured bind.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    net::Acceptor,
    p2p::NetworkInner,
    session::{attach_post_handshake, run_channel},
    Error,
};

/// Accepts inbound connections on every configured bind.
///
/// Each accepted socket is gated before the handshake: the service must be
/// open, the inbound slots not oversubscribed, and the authority not
/// blocked by the black/white lists. Gated-out channels are stopped with
/// the specific code; survivors run the standard channel lifecycle.
pub struct InboundSession {
    inner: Arc<NetworkInner>,
    stop: CancellationToken,
}

impl InboundSession {
    pub(crate) fn new(inner: Arc<NetworkInner>) -> InboundSession {
        let stop = inner.stop_token.child_token();
        InboundSession { inner, stop }
    }

    /// Bind the configured listeners and spawn their accept loops.
    ///
    /// Returns `Bypassed` when inbound connections are disabled, and
    /// surfaces `ListenFailed` when a bind cannot be taken.
    pub(crate) async fn start(&self) -> Result<(), Error> {
        let settings = &self.inner.settings;
        if settings.inbound_connections == 0 || settings.binds.is_empty() {
            return Err(Error::Bypassed);
        }

        info!(
            binds = settings.binds.len(),
            limit = settings.inbound_connections,
            "starting inbound connections"
        );
        for bind in settings.binds.iter().copied() {
            let acceptor = Acceptor::new(
                settings.clone(),
                self.inner.executor.clone(),
                &self.stop,
            );
            acceptor.listen(bind).await?;

            let inner = self.inner.clone();
            let stop = self.stop.clone();
            self.inner.executor.spawn(async move {
                accept_loop(inner, stop, acceptor).await;
            });
        }
        Ok(())
    }

    /// Stop every acceptor.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }
}

async fn accept_loop(inner: Arc<NetworkInner>, stop: CancellationToken, acceptor: Acceptor) {
    loop {
        if stop.is_cancelled() || inner.closed() {
            return;
        }

        let channel = match acceptor.accept().await {
            Ok(channel) => channel,
            Err(Error::ChannelStopped) => return,
            Err(code) => {
                debug!(%code, "inbound accept failed");
                continue;
            }
        };
        let authority = channel.authority();

        if inner.closed() {
            channel.stop(Error::ServiceStopped);
            return;
        }
        if inner.inbound_channel_count()
            >= usize::from(inner.settings.inbound_connections)
        {
            debug!(%authority, "oversubscribed, dropping inbound connection");
            channel.stop(Error::Oversubscribed);
            continue;
        }
        if inner.settings.blocked(&authority) {
            debug!(%authority, "dropping blocked inbound connection");
            channel.stop(Error::AddressBlocked);
            continue;
        }

        let lifecycle_inner = inner.clone();
        inner.executor.spawn(async move {
            let code = run_channel(&lifecycle_inner, channel, |channel| {
                attach_post_handshake(&lifecycle_inner, channel)
            })
            .await;
            debug!(%authority, %code, "inbound channel stopped");
        });
    }
}
