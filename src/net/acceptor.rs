//! The inbound bind/listen/accept loop support.

use std::sync::{Arc, OnceLock};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::{Authority, Settings},
    net::{Channel, Socket},
    runtime::Executor,
    Error,
};

/// An inbound acceptor: one per configured bind.
///
/// [`accept`](Acceptor::accept) yields one inbound channel per call; the
/// caller re-arms by calling again.
pub struct Acceptor {
    settings: Arc<Settings>,
    executor: Executor,
    listener: OnceLock<TcpListener>,
    stop: CancellationToken,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("bound", &self.local_authority())
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl Acceptor {
    /// Construct an acceptor whose lifetime is bounded by `parent`.
    pub fn new(
        settings: Arc<Settings>,
        executor: Executor,
        parent: &CancellationToken,
    ) -> Acceptor {
        Acceptor {
            settings,
            executor,
            listener: OnceLock::new(),
            stop: parent.child_token(),
        }
    }

    /// Bind and listen on the configured authority.
    pub async fn listen(&self, bind: Authority) -> Result<(), Error> {
        let listener = TcpListener::bind(bind.0).await.map_err(|err| {
            info!(%bind, ?err, "failed to bind listener");
            Error::ListenFailed
        })?;
        info!(%bind, "listening for inbound connections");
        self.listener
            .set(listener)
            .map_err(|_| Error::ListenFailed)?;
        Ok(())
    }

    /// The bound local authority, once listening.
    pub fn local_authority(&self) -> Option<Authority> {
        self.listener
            .get()
            .and_then(|listener| listener.local_addr().ok())
            .map(Authority::from)
    }

    /// Accept one inbound connection as a channel.
    pub async fn accept(&self) -> Result<Arc<Channel>, Error> {
        let listener = self.listener.get().ok_or(Error::ListenFailed)?;
        let (stream, address) = tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::ChannelStopped),
            result = listener.accept() => result.map_err(|err| {
                debug!(?err, "failed to accept");
                Error::AcceptFailed
            })?,
        };
        debug!(%address, "accepted inbound connection");
        let socket = Arc::new(Socket::new(stream));
        Ok(Channel::new(
            &self.executor,
            socket,
            self.settings.clone(),
            true,
        ))
    }

    /// Cancel a pending accept. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    fn fixture() -> (Arc<Settings>, Executor, CancellationToken) {
        (
            Arc::new(Settings::default()),
            Executor::current(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn accepts_an_inbound_channel() {
        let (settings, executor, parent) = fixture();
        let acceptor = Acceptor::new(settings, executor, &parent);
        acceptor
            .listen("127.0.0.1:0".parse().expect("authority"))
            .await
            .expect("listen");
        let bound = acceptor.local_authority().expect("bound");

        let (accepted, connected) = tokio::join!(acceptor.accept(), TcpStream::connect(bound.0));
        let channel = accepted.expect("accept");
        let connected = connected.expect("connect");
        assert!(channel.inbound());
        assert_eq!(
            channel.authority().0,
            connected.local_addr().expect("local addr")
        );
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_accept() {
        let (settings, executor, parent) = fixture();
        let acceptor = Arc::new(Acceptor::new(settings, executor, &parent));
        acceptor
            .listen("127.0.0.1:0".parse().expect("authority"))
            .await
            .expect("listen");

        let pending = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        acceptor.stop();
        assert_eq!(pending.await.expect("join"), Err(Error::ChannelStopped));
    }

    #[tokio::test]
    async fn accept_before_listen_fails() {
        let (settings, executor, parent) = fixture();
        let acceptor = Acceptor::new(settings, executor, &parent);
        assert!(matches!(acceptor.accept().await, Err(Error::ListenFailed)));
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() {
        let (settings, executor, parent) = fixture();
        let holder = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let taken = holder.local_addr().expect("local addr");

        let acceptor = Acceptor::new(settings, executor, &parent);
        assert_eq!(
            acceptor.listen(Authority::from(taken)).await,
            Err(Error::ListenFailed)
        );
    }
}
