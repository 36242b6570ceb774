//! One live peer connection: framing, dispatch, liveness, and stop
//! semantics.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, Weak,
};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{
    config::{Authority, Settings},
    constants::HEADING_SIZE,
    net::{Distributor, Socket},
    protocol::{
        codec::{self, Heading},
        message::{Payload, Version},
        types::{Magic, Nonce, Services},
    },
    runtime::{DeadlineTimer, Executor, Strand},
    subscriber::{Event, Key, Subscriber},
    Error,
};

/// A peer channel.
///
/// Owns the socket, the distributor, a strand ordering all dispatch and
/// stop fan-out, and the three liveness timers. The read loop runs as its
/// own task, pausing only at message boundaries; the next read is issued
/// only after the previous dispatch returns, which is the engine's inbound
/// backpressure.
///
/// Version state (`peer_version`, `negotiated_version`, `start_height`) is
/// written only before or during the handshake; `negotiated_version` is
/// monotonically nonincreasing and frozen once the handshake completes.
///
/// `stop` latches the first terminal code; every distributor subscriber and
/// every stop subscriber observes that code exactly once.
pub struct Channel {
    weak_self: Weak<Channel>,
    settings: Arc<Settings>,
    socket: Arc<Socket>,
    distributor: Distributor,
    strand: Strand,
    executor: Executor,
    nonce: u64,
    inbound: bool,
    quiet: AtomicBool,
    start_height: AtomicU32,
    negotiated_version: AtomicU32,
    peer_version: Mutex<Option<Arc<Version>>>,
    stop_code: Mutex<Option<Error>>,
    stop_subscriber: Subscriber<()>,
    paused: watch::Sender<bool>,
    reading: AtomicBool,
    handshaked: AtomicBool,
    expiration_armed: AtomicBool,
    handshake_timer: DeadlineTimer,
    inactivity_timer: DeadlineTimer,
    expiration_timer: DeadlineTimer,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("authority", &self.authority())
            .field("nonce", &self.nonce)
            .field("inbound", &self.inbound)
            .field("stopped", &self.stopped())
            .finish()
    }
}

impl Channel {
    /// Construct a channel over a connected socket.
    ///
    /// The channel is created paused; reading starts on the first
    /// [`resume`](Channel::resume), after the session has attached the
    /// handshake protocol.
    pub fn new(
        executor: &Executor,
        socket: Arc<Socket>,
        settings: Arc<Settings>,
        inbound: bool,
    ) -> Arc<Channel> {
        let strand = executor.strand();
        let (paused, _) = watch::channel(true);
        Arc::new_cyclic(|weak_self| Channel {
            weak_self: weak_self.clone(),
            handshake_timer: DeadlineTimer::new(
                executor,
                strand.clone(),
                settings.channel_handshake(),
            ),
            inactivity_timer: DeadlineTimer::new(
                executor,
                strand.clone(),
                settings.channel_inactivity(),
            ),
            expiration_timer: DeadlineTimer::new(
                executor,
                strand.clone(),
                settings.channel_expiration(),
            ),
            negotiated_version: AtomicU32::new(settings.protocol_maximum),
            nonce: Nonce::random().0,
            settings,
            socket,
            distributor: Distributor::new(),
            strand,
            executor: executor.clone(),
            inbound,
            quiet: AtomicBool::new(false),
            start_height: AtomicU32::new(0),
            peer_version: Mutex::new(None),
            stop_code: Mutex::new(None),
            stop_subscriber: Subscriber::new(),
            paused,
            reading: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            expiration_armed: AtomicBool::new(false),
        })
    }

    // Identity.

    /// The channel's unique nonce, generated at construction.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// True for accepted (inbound) channels.
    pub fn inbound(&self) -> bool {
        self.inbound
    }

    /// The remote authority.
    pub fn authority(&self) -> Authority {
        self.socket.authority()
    }

    /// True for channels that do not count toward the total (seed).
    pub fn quiet(&self) -> bool {
        self.quiet.load(Ordering::Acquire)
    }

    /// Mark the channel quiet. Written only before the handshake.
    pub fn set_quiet(&self) {
        self.quiet.store(true, Ordering::Release);
    }

    /// The strand ordering this channel's dispatch and stop fan-out.
    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    // Version state.

    /// Our best-height hint for the outgoing `version` message.
    pub fn start_height(&self) -> u32 {
        self.start_height.load(Ordering::Acquire)
    }

    /// Set the height hint. Written only before the handshake.
    pub fn set_start_height(&self, height: u32) {
        self.start_height.store(height, Ordering::Release);
    }

    /// The negotiated protocol version. Initialized to the configured
    /// maximum, narrowed during the handshake.
    pub fn negotiated_version(&self) -> u32 {
        self.negotiated_version.load(Ordering::Acquire)
    }

    /// Narrow the negotiated version.
    pub fn set_negotiated_version(&self, version: u32) {
        debug_assert!(
            !self.handshaked.load(Ordering::Acquire),
            "negotiated version is frozen after handshake"
        );
        // Monotonic nonincreasing.
        self.negotiated_version
            .fetch_min(version, Ordering::AcqRel);
    }

    /// True when the negotiated version is at least `level`.
    pub fn is_negotiated(&self, level: u32) -> bool {
        self.negotiated_version() >= level
    }

    /// The peer's `version` message, once received.
    pub fn peer_version(&self) -> Option<Arc<Version>> {
        self.peer_version
            .lock()
            .expect("mutex should be unpoisoned")
            .clone()
    }

    /// Record the peer's `version` message. Set once, during the handshake.
    pub fn set_peer_version(&self, version: Arc<Version>) {
        let mut slot = self.peer_version.lock().expect("mutex should be unpoisoned");
        if slot.is_some() {
            warn!(authority = %self.authority(), "duplicate peer version ignored");
            return;
        }
        *slot = Some(version);
    }

    /// True when the peer advertised `service`.
    pub fn is_peer_service(&self, service: Services) -> bool {
        self.peer_version()
            .map(|version| version.services & service.bits() == service.bits())
            .unwrap_or(false)
    }

    // Subscriptions.

    /// Subscribe a typed handler to inbound messages.
    ///
    /// Handlers are invoked on the channel strand, in subscription order.
    pub fn subscribe<M: Payload>(
        &self,
        handler: impl FnMut(Event<M>) -> bool + Send + 'static,
    ) -> Result<Key, Error> {
        self.distributor.subscribe(handler)
    }

    /// Subscribe to the channel's terminal notification.
    pub fn subscribe_stop(
        &self,
        handler: impl FnMut(Event<()>) -> bool + Send + 'static,
    ) -> Result<Key, Error> {
        self.stop_subscriber.subscribe(handler)
    }

    // Lifecycle.

    /// Mark the handshake complete: the negotiated version freezes and
    /// resume switches from the handshake timer to the liveness timers.
    pub fn complete_handshake(&self) {
        self.handshaked.store(true, Ordering::Release);
    }

    /// True once the handshake has completed.
    pub fn handshaked(&self) -> bool {
        self.handshaked.load(Ordering::Acquire)
    }

    /// Pause reading at the next message boundary.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Start (or restart) reading; arms the stage-appropriate timers.
    pub fn resume(&self) {
        if self.stopped() {
            return;
        }
        if self.handshaked() {
            self.handshake_timer.stop();
            self.start_liveness_timers();
        } else {
            self.start_handshake_timer();
        }
        if !self.reading.swap(true, Ordering::AcqRel) {
            self.spawn_read_task();
        }
        self.paused.send_replace(false);
    }

    /// The latched terminal code, once stopped.
    pub fn stop_code(&self) -> Option<Error> {
        *self.stop_code.lock().expect("mutex should be unpoisoned")
    }

    /// True once [`stop`](Channel::stop) has latched a code.
    pub fn stopped(&self) -> bool {
        self.stop_code().is_some()
    }

    /// Stop the channel with a terminal code. First writer wins; later
    /// calls are no-ops. Cancels timers and outstanding I/O, then notifies
    /// every subscriber exactly once, on the channel strand.
    pub fn stop(&self, code: Error) {
        {
            let mut latch = self.stop_code.lock().expect("mutex should be unpoisoned");
            if latch.is_some() {
                return;
            }
            *latch = Some(code);
        }
        debug!(authority = %self.authority(), %code, "stopping channel");

        self.socket.stop();
        self.handshake_timer.stop();
        self.inactivity_timer.stop();
        self.expiration_timer.stop();

        // Notification runs as its own strand job: a handler currently
        // mid-dispatch can call stop without re-entering its subscriber.
        match self.weak_self.upgrade() {
            Some(channel) => self.strand.post(move || {
                channel.distributor.stop(code);
                channel.stop_subscriber.stop(code);
            }),
            None => {
                self.distributor.stop(code);
                self.stop_subscriber.stop(code);
            }
        }

        // Release a paused read task so it can observe the stop and exit.
        self.paused.send_replace(false);
    }

    // Sending.

    /// Serialize and write one message.
    ///
    /// The frame carries the configured magic and the current negotiated
    /// version. Writes serialise through the socket, so concurrent sends
    /// never interleave frames. A write failure stops the channel with the
    /// mapped code and returns it.
    pub async fn send<M: Payload>(&self, message: &M) -> Result<(), Error> {
        if let Some(code) = self.stop_code() {
            return Err(code);
        }
        let magic = Magic::from_identifier(self.settings.identifier);
        let frame = codec::serialize_message(magic, self.negotiated_version(), message)?;
        let command = M::IDENTIFIER;
        trace!(
            authority = %self.authority(),
            %command,
            bytes = frame.len(),
            "sending"
        );
        if let Err(code) = self.socket.write_all(&frame).await {
            self.stop(code);
            return Err(code);
        }
        Ok(())
    }

    // Timers.

    fn start_handshake_timer(&self) {
        let weak = self.weak_self.clone();
        self.handshake_timer.start(move |result| {
            if let (Ok(()), Some(channel)) = (result, weak.upgrade()) {
                if !channel.handshaked() {
                    channel.stop(Error::OperationTimeout);
                }
            }
        });
    }

    fn start_liveness_timers(&self) {
        self.bump_inactivity();
        // The expiration timer is armed exactly once, to a random point in
        // [0, channel_expiration], staggering reconnects across channels.
        if !self.expiration_armed.swap(true, Ordering::AcqRel) {
            let ceiling = self.settings.channel_expiration().as_millis() as u64;
            let lifetime =
                std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling));
            let weak = self.weak_self.clone();
            self.expiration_timer.start_with(lifetime, move |result| {
                if let (Ok(()), Some(channel)) = (result, weak.upgrade()) {
                    channel.stop(Error::ChannelExpired);
                }
            });
        }
    }

    fn bump_inactivity(&self) {
        let weak = self.weak_self.clone();
        self.inactivity_timer.start(move |result| {
            if let (Ok(()), Some(channel)) = (result, weak.upgrade()) {
                channel.stop(Error::ChannelInactive);
            }
        });
    }

    fn signal_activity(&self) {
        if self.handshaked() && !self.stopped() {
            self.bump_inactivity();
        }
    }

    // Reading.

    fn spawn_read_task(&self) {
        let Some(channel) = self.weak_self.upgrade() else {
            return;
        };
        self.executor.spawn(async move {
            channel.read_loop().await;
        });
    }

    async fn read_loop(self: Arc<Self>) {
        let mut heading_buffer = [0u8; HEADING_SIZE];
        loop {
            if !self.wait_resumed().await {
                break;
            }
            if let Err(code) = self.read_message(&mut heading_buffer).await {
                self.stop(code);
                break;
            }
        }
        trace!(authority = %self.authority(), "read loop ended");
    }

    /// Wait until reading is resumed; false when the channel stopped.
    async fn wait_resumed(&self) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if self.stopped() || self.socket.is_stopped() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            if paused.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Read one heading and payload, and dispatch on the strand.
    async fn read_message(&self, heading_buffer: &mut [u8; HEADING_SIZE]) -> Result<(), Error> {
        self.socket.read_exact(heading_buffer).await?;
        let heading = Heading::parse(heading_buffer)?;

        if heading.magic != Magic::from_identifier(self.settings.identifier) {
            return Err(Error::InvalidMagic);
        }
        let length = heading.payload_size as usize;
        if length > self.settings.maximum_payload() {
            return Err(Error::OversizedPayload);
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            self.socket.read_exact(&mut payload).await?;
        }
        if self.settings.validate_checksum && heading.checksum != codec::checksum(&payload) {
            return Err(Error::InvalidChecksum);
        }

        let Some(id) = heading.identifier() else {
            // Unknown commands are read and discarded: the connection is
            // unauthenticated and closing it on unexpected traffic invites
            // denial of service.
            debug!(
                authority = %self.authority(),
                command = %String::from_utf8_lossy(&heading.command),
                bytes = length,
                "unknown message command from peer"
            );
            self.signal_activity();
            return Ok(());
        };

        trace!(authority = %self.authority(), %id, bytes = length, "received");
        let version = self.negotiated_version();
        let channel = self.weak_self.upgrade().ok_or(Error::ChannelDropped)?;
        self.strand
            .run(move || channel.distributor.notify(id, version, &payload))
            .await??;

        self.signal_activity();
        Ok(())
    }
}
