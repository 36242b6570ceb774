//! The top-level supervisor: composes the executor, the host pool, the four
//! sessions, connection counting, loopback detection, and the top-level
//! subscribers.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{Endpoint, Settings},
    constants::SHUTDOWN_TIMEOUT,
    hosts::Hosts,
    net::{Broadcaster, Channel},
    protocol::{addr::AddressItem, message::Payload},
    runtime::Executor,
    session::{ChannelHandler, InboundSession, ManualSession, OutboundSession, SeedSession},
    subscriber::{Event, Key, Subscriber},
    Error,
};

/// The state shared between the supervisor and its sessions.
pub(crate) struct NetworkInner {
    pub(crate) settings: Arc<Settings>,
    pub(crate) executor: Executor,
    pub(crate) hosts: Arc<Hosts>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) stop_token: CancellationToken,
    closed: AtomicBool,
    nonces: Mutex<HashSet<u64>>,
    inbound_channel_count: AtomicUsize,
    total_channel_count: AtomicUsize,
    top_height: AtomicU32,
    stop_subscriber: Subscriber<()>,
    connect_subscriber: Subscriber<Channel>,
    keys: AtomicU64,
}

impl NetworkInner {
    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Latch closed; true when this call did the latching.
    fn latch_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn inbound_channel_count(&self) -> usize {
        self.inbound_channel_count.load(Ordering::Acquire)
    }

    pub(crate) fn total_channel_count(&self) -> usize {
        self.total_channel_count.load(Ordering::Acquire)
    }

    pub(crate) fn top_height(&self) -> u32 {
        self.top_height.load(Ordering::Acquire)
    }

    // Loopback detection.
    //
    // Outbound channels store their nonce before sending `version`; an
    // incoming `version` carrying a stored nonce is our own echo. Inbound
    // channels, and loopback-enabled configurations, skip both sides.

    pub(crate) fn store_nonce(&self, channel: &Channel) -> bool {
        if self.settings.enable_loopback || channel.inbound() {
            return true;
        }
        let stored = self
            .nonces
            .lock()
            .expect("mutex should be unpoisoned")
            .insert(channel.nonce());
        if !stored {
            warn!(authority = %channel.authority(), "failed to store channel nonce");
        }
        stored
    }

    pub(crate) fn unstore_nonce(&self, channel: &Channel) {
        if self.settings.enable_loopback || channel.inbound() {
            return;
        }
        if !self
            .nonces
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&channel.nonce())
        {
            warn!(authority = %channel.authority(), "failed to unstore channel nonce");
        }
    }

    pub(crate) fn is_loopback(&self, channel: &Channel) -> bool {
        if self.settings.enable_loopback || !channel.inbound() {
            return false;
        }
        match channel.peer_version() {
            Some(version) => self
                .nonces
                .lock()
                .expect("mutex should be unpoisoned")
                .contains(&version.nonce),
            None => false,
        }
    }

    // Channel counting with address deconfliction. These keep the counters
    // and the authority reservations consistent; `uncount_channel` mirrors
    // a successful `count_channel` exactly once.

    pub(crate) fn count_channel(&self, channel: &Channel) -> Result<(), Error> {
        if self.closed() {
            return Err(Error::ServiceStopped);
        }
        if self.is_loopback(channel) {
            debug!(authority = %channel.authority(), "loopback connection detected");
            return Err(Error::AcceptFailed);
        }
        if channel.inbound()
            && self.inbound_channel_count() >= usize::from(self.settings.inbound_connections)
        {
            return Err(Error::Oversubscribed);
        }
        if !self.hosts.reserve(channel.authority()) {
            debug!(authority = %channel.authority(), "duplicate connection");
            return Err(Error::AddressInUse);
        }

        if channel.inbound() {
            self.inbound_channel_count.fetch_add(1, Ordering::AcqRel);
        }
        if !channel.quiet() {
            self.total_channel_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub(crate) fn uncount_channel(&self, channel: &Channel) {
        self.hosts.unreserve(channel.authority());
        if channel.inbound() {
            let _ = self
                .inbound_channel_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    count.checked_sub(1)
                });
        }
        if !channel.quiet() {
            let _ = self
                .total_channel_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    count.checked_sub(1)
                });
        }
    }

    pub(crate) fn notify_connect(&self, channel: &Arc<Channel>) {
        self.connect_subscriber.notify(Ok(channel.clone()));
    }

    // At one key per subscription this overflows in centuries; report and
    // continue.
    fn create_key(&self) -> Key {
        let key = self.keys.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if key == 0 {
            warn!("subscription key overflow");
        }
        key
    }
}

/// The process-wide p2p supervisor.
///
/// Lifecycle: construct, [`start`](P2p::start) (hosts load, manual and seed
/// sessions), [`run`](P2p::run) (configured peers, inbound and outbound
/// sessions), then [`close`](P2p::close) (stop everything, join the pool,
/// persist hosts). `close` is idempotent and must not be called from a pool
/// worker.
pub struct P2p {
    inner: Arc<NetworkInner>,
    sessions: Mutex<Sessions>,
}

#[derive(Default)]
struct Sessions {
    manual: Option<Arc<ManualSession>>,
    inbound: Option<Arc<InboundSession>>,
    outbound: Option<Arc<OutboundSession>>,
}

impl std::fmt::Debug for P2p {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2p")
            .field("closed", &self.inner.closed())
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl P2p {
    /// Construct a supervisor owning a worker pool of `settings.threads`.
    pub fn new(settings: Settings) -> Result<P2p, Error> {
        let executor = Executor::new(settings.threads)?;
        Ok(P2p::with_executor(settings, executor))
    }

    /// Construct a supervisor over an existing executor (embedding, tests).
    pub fn with_executor(mut settings: Settings, executor: Executor) -> P2p {
        if settings.friends.is_empty() {
            settings.initialize();
        }
        let settings = Arc::new(settings);
        let hosts = Arc::new(Hosts::new(settings.clone()));
        P2p {
            inner: Arc::new(NetworkInner {
                settings,
                executor,
                hosts,
                broadcaster: Broadcaster::new(),
                stop_token: CancellationToken::new(),
                closed: AtomicBool::new(false),
                nonces: Mutex::new(HashSet::new()),
                inbound_channel_count: AtomicUsize::new(0),
                total_channel_count: AtomicUsize::new(0),
                top_height: AtomicU32::new(0),
                stop_subscriber: Subscriber::new(),
                connect_subscriber: Subscriber::new(),
                keys: AtomicU64::new(0),
            }),
            sessions: Mutex::new(Sessions::default()),
        }
    }

    // Start/run sequences.

    /// Load the hosts file, start the manual session, and run the seeding
    /// round. Seeding bypass (a disabled host pool) is success.
    pub async fn start(&self) -> Result<(), Error> {
        if self.inner.closed() {
            return Err(Error::ServiceStopped);
        }

        self.inner.hosts.load()?;

        let manual = Arc::new(ManualSession::new(self.inner.clone()));
        self.sessions
            .lock()
            .expect("mutex should be unpoisoned")
            .manual = Some(manual);

        match SeedSession::new(self.inner.clone()).start().await {
            Err(Error::Bypassed) => Ok(()),
            outcome => outcome,
        }
    }

    /// Connect the configured peers and start the inbound and outbound
    /// sessions. Bypass codes from disabled sessions are success.
    ///
    /// Seeding may still be ongoing when `run` is called; the outbound
    /// session parks on the host pool until addresses arrive.
    pub async fn run(&self) -> Result<(), Error> {
        if self.inner.closed() {
            return Err(Error::ServiceStopped);
        }

        for peer in self.inner.settings.peers.clone() {
            self.connect(peer);
        }

        let inbound = Arc::new(InboundSession::new(self.inner.clone()));
        let started = inbound.start().await;
        self.sessions
            .lock()
            .expect("mutex should be unpoisoned")
            .inbound = Some(inbound);
        match started {
            Ok(()) | Err(Error::Bypassed) => {}
            Err(code) => return Err(code),
        }

        let outbound = Arc::new(OutboundSession::new(self.inner.clone()));
        let started = outbound.start().await;
        self.sessions
            .lock()
            .expect("mutex should be unpoisoned")
            .outbound = Some(outbound);
        match started {
            Ok(()) | Err(Error::Bypassed) => Ok(()),
            Err(code) => Err(code),
        }
    }

    // Shutdown.

    /// Stop all sessions and channels, drain the subscribers, join the
    /// owned worker pool, and persist the hosts file.
    ///
    /// Idempotent. Must be called from a thread that is not a pool worker;
    /// from a worker the pool is released without joining.
    pub fn close(&self) -> Result<(), Error> {
        if !self.inner.latch_closed() {
            return Ok(());
        }
        info!("closing p2p network");

        // Sessions and their connectors/acceptors observe the token;
        // channels are stopped through the registry.
        self.inner.stop_token.cancel();
        let sessions =
            std::mem::take(&mut *self.sessions.lock().expect("mutex should be unpoisoned"));
        if let Some(manual) = sessions.manual {
            manual.stop();
        }
        if let Some(inbound) = sessions.inbound {
            inbound.stop();
        }
        if let Some(outbound) = sessions.outbound {
            outbound.stop();
        }
        self.inner.broadcaster.stop(Error::ServiceStopped);

        self.inner.stop_subscriber.stop(Error::ServiceStopped);
        self.inner.connect_subscriber.stop(Error::ServiceStopped);

        self.inner.executor.shutdown(SHUTDOWN_TIMEOUT);
        self.inner.hosts.store()
    }

    // Manual connections.

    /// Maintain a connection to `endpoint` through the manual session.
    pub fn connect(&self, endpoint: Endpoint) {
        let manual = self
            .sessions
            .lock()
            .expect("mutex should be unpoisoned")
            .manual
            .clone();
        if let Some(manual) = manual {
            manual.connect(endpoint);
        }
    }

    /// Maintain a connection to `endpoint`, observing it with `handler`.
    ///
    /// The handler fires with the channel on each successful connection
    /// until it returns `false`, and once with the terminal code when the
    /// endpoint is abandoned.
    pub fn connect_with(&self, endpoint: Endpoint, handler: ChannelHandler) {
        let manual = self
            .sessions
            .lock()
            .expect("mutex should be unpoisoned")
            .manual
            .clone();
        match manual {
            Some(manual) => manual.connect_with(endpoint, Some(handler)),
            None => {
                let mut handler = handler;
                let _ = handler(Err(Error::ServiceStopped));
            }
        }
    }

    // Broadcast.

    /// Send one message to every open channel.
    pub fn broadcast<M: Payload>(&self, message: M) {
        let inner = self.inner.clone();
        let command = M::IDENTIFIER;
        self.inner.executor.spawn(async move {
            let delivered = inner.broadcaster.broadcast(message).await;
            debug!(%command, delivered, "broadcast complete");
        });
    }

    // Subscriptions.

    /// Subscribe to channel registrations. Returns the subscription key.
    pub fn subscribe_connect(
        &self,
        handler: impl FnMut(Event<Channel>) -> bool + Send + 'static,
    ) -> Result<Key, Error> {
        if self.inner.closed() {
            return Err(Error::ServiceStopped);
        }
        let key = self.inner.create_key();
        self.inner
            .connect_subscriber
            .subscribe_with_key(key, handler)?;
        Ok(key)
    }

    /// Remove a connect subscription; its handler receives `Desubscribed`.
    pub fn unsubscribe_connect(&self, key: Key) {
        self.inner
            .connect_subscriber
            .notify_one(key, Err(Error::Desubscribed));
    }

    /// Subscribe to service shutdown. Returns the subscription key.
    pub fn subscribe_close(
        &self,
        handler: impl FnMut(Event<()>) -> bool + Send + 'static,
    ) -> Result<Key, Error> {
        if self.inner.closed() {
            return Err(Error::ServiceStopped);
        }
        let key = self.inner.create_key();
        self.inner.stop_subscriber.subscribe_with_key(key, handler)?;
        Ok(key)
    }

    /// Remove a close subscription; its handler receives `Desubscribed`.
    pub fn unsubscribe_close(&self, key: Key) {
        self.inner
            .stop_subscriber
            .notify_one(key, Err(Error::Desubscribed));
    }

    // Properties and hosts delegation.

    /// The configuration.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// The host pool.
    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.inner.hosts
    }

    /// Remove and return a random unreserved candidate address.
    pub fn take(&self) -> Result<AddressItem, Error> {
        self.inner.hosts.take()
    }

    /// Return an unused candidate address to the pool.
    pub fn restore(&self, address: &AddressItem) {
        self.inner.hosts.restore(address);
    }

    /// A random pooled address, without removal.
    ///
    /// Accelerates shutdown: fails once the service is closed.
    pub fn fetch(&self) -> Result<AddressItem, Error> {
        if self.inner.closed() {
            return Err(Error::ServiceStopped);
        }
        self.inner.hosts.fetch()
    }

    /// Fold addresses into the pool through the configured filters,
    /// returning the number accepted.
    ///
    /// Accelerates shutdown: accepts nothing once the service is closed.
    pub fn save(&self, addresses: &[AddressItem]) -> usize {
        if self.inner.closed() {
            return 0;
        }
        self.inner.hosts.save(addresses)
    }

    /// The number of pooled addresses.
    pub fn address_count(&self) -> usize {
        self.inner.hosts.count()
    }

    /// The number of reserved authorities (live channels).
    pub fn reserved_count(&self) -> usize {
        self.inner.hosts.reserved_count()
    }

    /// The number of non-quiet channels.
    pub fn channel_count(&self) -> usize {
        self.inner.total_channel_count()
    }

    /// The number of inbound channels.
    pub fn inbound_channel_count(&self) -> usize {
        self.inner.inbound_channel_count()
    }

    /// The best block height advertised in outgoing `version` messages.
    pub fn top_height(&self) -> u32 {
        self.inner.top_height()
    }

    /// Update the best block height for future handshakes.
    pub fn set_top_height(&self, height: u32) {
        self.inner.top_height.store(height, Ordering::Release);
    }
}

impl Drop for P2p {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Socket;
    use tokio::net::{TcpListener, TcpStream};

    fn test_p2p(settings: Settings) -> P2p {
        P2p::with_executor(settings, Executor::current())
    }

    async fn loopback_channel(inbound: bool) -> (Arc<Channel>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let (outbound, accepted) =
            tokio::join!(TcpStream::connect(address), listener.accept());
        let socket = Arc::new(Socket::new(outbound.expect("connect")));
        let channel = Channel::new(
            &Executor::current(),
            socket,
            Arc::new(Settings::default()),
            inbound,
        );
        (channel, accepted.expect("accept").0)
    }

    #[tokio::test]
    async fn count_channel_reserves_and_counts() {
        let p2p = test_p2p(Settings {
            inbound_connections: 8,
            ..Settings::default()
        });
        let (channel, _peer) = loopback_channel(false).await;

        p2p.inner.count_channel(&channel).expect("count");
        assert_eq!(p2p.channel_count(), 1);
        assert_eq!(p2p.reserved_count(), 1);

        // The same authority cannot be counted twice.
        assert_eq!(
            p2p.inner.count_channel(&channel),
            Err(Error::AddressInUse)
        );

        p2p.inner.uncount_channel(&channel);
        assert_eq!(p2p.channel_count(), 0);
        assert_eq!(p2p.reserved_count(), 0);
    }

    #[tokio::test]
    async fn quiet_channels_do_not_count_toward_the_total() {
        let p2p = test_p2p(Settings::default());
        let (channel, _peer) = loopback_channel(false).await;
        channel.set_quiet();

        p2p.inner.count_channel(&channel).expect("count");
        assert_eq!(p2p.channel_count(), 0);
        assert_eq!(p2p.reserved_count(), 1);
        p2p.inner.uncount_channel(&channel);
    }

    #[tokio::test]
    async fn loopback_nonce_is_detected_on_inbound_channels() {
        use crate::protocol::{addr::AddressItem, message::Version};

        let p2p = test_p2p(Settings {
            inbound_connections: 8,
            ..Settings::default()
        });
        let (ours, _peer_a) = loopback_channel(false).await;
        let (echo, _peer_b) = loopback_channel(true).await;

        assert!(p2p.inner.store_nonce(&ours));

        // The inbound channel's peer version carries our own nonce back.
        echo.set_peer_version(Arc::new(Version {
            version: crate::constants::MAXIMUM_PROTOCOL,
            services: 1,
            timestamp: 0,
            address_receive: AddressItem::from_authority(echo.authority(), 0, 0),
            address_sender: AddressItem::from_authority(echo.authority(), 0, 0),
            nonce: ours.nonce(),
            user_agent: String::new(),
            start_height: 0,
            relay: false,
        }));

        assert!(p2p.inner.is_loopback(&echo));
        assert_eq!(p2p.inner.count_channel(&echo), Err(Error::AcceptFailed));
        assert_eq!(p2p.channel_count(), 0);

        p2p.inner.unstore_nonce(&ours);
        assert!(!p2p.inner.is_loopback(&echo));
    }

    #[tokio::test]
    async fn inbound_cap_is_enforced_by_counting() {
        let p2p = test_p2p(Settings {
            inbound_connections: 1,
            ..Settings::default()
        });
        let (first, _peer_a) = loopback_channel(true).await;
        let (second, _peer_b) = loopback_channel(true).await;

        p2p.inner.count_channel(&first).expect("count");
        assert_eq!(
            p2p.inner.count_channel(&second),
            Err(Error::Oversubscribed)
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_subscribers() {
        let p2p = test_p2p(Settings::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        p2p.subscribe_close(move |event| {
            if let Err(code) = event {
                let _ = tx.send(code);
            }
            false
        })
        .expect("subscribe");

        p2p.close().expect("close");
        p2p.close().expect("close again");

        assert_eq!(rx.recv().await, Some(Error::ServiceStopped));
        assert_eq!(rx.try_recv().ok(), None);
        assert!(matches!(p2p.start().await, Err(Error::ServiceStopped)));
        assert_eq!(
            p2p.subscribe_close(|_| true),
            Err(Error::ServiceStopped)
        );
    }
}
