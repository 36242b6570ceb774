//! Outbound resolve-and-connect with a randomised deadline.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::{Authority, Endpoint, Settings},
    constants::DNS_LOOKUP_TIMEOUT,
    net::{Channel, Socket},
    runtime::Executor,
    Error,
};

/// An outbound connector.
///
/// One connection attempt runs at a time per connector; completion is
/// exactly-once by construction, with the deadline, the stop token, and the
/// attempt racing inside [`connect`](Connector::connect). Sessions create
/// fresh connectors per attempt round and stop the losers of a batch.
pub struct Connector {
    settings: Arc<Settings>,
    executor: Executor,
    stop: CancellationToken,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl Connector {
    /// Construct a connector whose lifetime is bounded by `parent`.
    pub fn new(
        settings: Arc<Settings>,
        executor: Executor,
        parent: &CancellationToken,
    ) -> Connector {
        Connector {
            settings,
            executor,
            stop: parent.child_token(),
        }
    }

    /// Cancel the in-flight (and any future) attempt; the attempt completes
    /// with `ChannelStopped`.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Connect to a configured endpoint.
    pub async fn connect_endpoint(&self, endpoint: &Endpoint) -> Result<Arc<Channel>, Error> {
        self.connect(&endpoint.host, endpoint.port).await
    }

    /// Connect to a known authority.
    pub async fn connect_authority(&self, authority: Authority) -> Result<Arc<Channel>, Error> {
        self.connect(&authority.ip().to_string(), authority.port()).await
    }

    /// Resolve `host` and connect, under one deadline randomised to 50–100%
    /// of the configured connect timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Arc<Channel>, Error> {
        if self.stop.is_cancelled() {
            return Err(Error::ChannelStopped);
        }

        let deadline = self.settings.connect_timeout();
        let attempt = self.attempt(host, port);

        tokio::select! {
            _ = self.stop.cancelled() => Err(Error::ChannelStopped),
            result = tokio::time::timeout(deadline, attempt) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::ChannelTimeout),
            },
        }
    }

    async fn attempt(&self, host: &str, port: u16) -> Result<Arc<Channel>, Error> {
        let resolved = tokio::time::timeout(DNS_LOOKUP_TIMEOUT, tokio::net::lookup_host((host, port)))
            .await
            .map_err(|_| Error::ResolveFailed)?
            .map_err(|err| {
                debug!(?host, ?err, "failed to resolve");
                Error::ResolveFailed
            })?;

        let candidates: Vec<SocketAddr> = resolved
            .filter(|address| self.settings.enable_ipv6 || address.is_ipv4())
            .collect();
        if candidates.is_empty() {
            return Err(Error::AddressNotFound);
        }

        let mut failure = Error::ConnectFailed;
        for address in candidates {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    let socket = Arc::new(Socket::new(stream));
                    return Ok(Channel::new(
                        &self.executor,
                        socket,
                        self.settings.clone(),
                        false,
                    ));
                }
                Err(err) => {
                    debug!(?address, ?err, "failed to connect");
                    failure = Error::ConnectFailed;
                }
            }
        }
        Err(failure)
    }
}
