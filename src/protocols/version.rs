//! The version handshake.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    config::{Authority, Settings},
    net::Channel,
    protocol::{
        addr::AddressItem,
        message::{Version, VersionAcknowledge},
        types::Services,
    },
    subscriber::Event,
    Error,
};

#[derive(Default)]
struct HandshakeState {
    version_received: bool,
    verack_received: bool,
    verack_sent: bool,
}

/// The handshake protocol: sends our `version`, validates the peer's,
/// narrows the negotiated version, and exchanges `verack`.
///
/// Completion is signalled once, through the receiver returned by
/// [`start`](VersionProtocol::start): success after our `verack` is sent and
/// the peer's received, or the first failure code observed. On success the
/// channel is left paused so the session can attach the post-handshake
/// protocols before resuming.
pub struct VersionProtocol {
    channel: Arc<Channel>,
    settings: Arc<Settings>,
    state: Mutex<HandshakeState>,
    completion: Mutex<Option<oneshot::Sender<Result<(), Error>>>>,
}

impl VersionProtocol {
    /// Attach the handshake to a channel and send our `version`.
    ///
    /// Call before the channel's first resume; the caller stores the channel
    /// nonce for loopback detection beforehand.
    pub fn start(
        channel: &Arc<Channel>,
        settings: &Arc<Settings>,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();
        let protocol = Arc::new(VersionProtocol {
            channel: channel.clone(),
            settings: settings.clone(),
            state: Mutex::new(HandshakeState::default()),
            completion: Mutex::new(Some(tx)),
        });

        let on_version = protocol.clone();
        let subscribed = channel.subscribe::<Version>(move |event| {
            Self::handle_version(&on_version, event);
            false
        });
        if subscribed.is_err() {
            protocol.complete(Err(channel.stop_code().unwrap_or(Error::ChannelStopped)));
            return rx;
        }

        let on_verack = protocol.clone();
        let subscribed = channel.subscribe::<VersionAcknowledge>(move |event| {
            Self::handle_verack(&on_verack, event);
            false
        });
        if subscribed.is_err() {
            protocol.complete(Err(channel.stop_code().unwrap_or(Error::ChannelStopped)));
            return rx;
        }

        let sender = protocol.clone();
        channel.executor().spawn(async move { sender.send_version().await });
        rx
    }

    async fn send_version(self: Arc<Self>) {
        let message = self.own_version();
        if let Err(code) = self.channel.send(&message).await {
            self.complete(Err(code));
        }
    }

    fn own_version(&self) -> Version {
        let settings = &self.settings;
        let sender = settings
            .first_self()
            .unwrap_or_else(Authority::unspecified);
        Version {
            version: settings.protocol_maximum,
            services: settings.services_maximum,
            timestamp: Utc::now().timestamp(),
            address_receive: AddressItem::from_authority(self.channel.authority(), 0, 0),
            address_sender: AddressItem::from_authority(sender, settings.services_maximum, 0),
            nonce: self.channel.nonce(),
            user_agent: settings.user_agent.clone(),
            start_height: self.channel.start_height(),
            relay: settings.enable_relay,
        }
    }

    fn handle_version(this: &Arc<Self>, event: Event<Version>) {
        let message = match event {
            Ok(message) => message,
            Err(code) => return this.complete(Err(code)),
        };

        if let Err(code) = this.validate(&message) {
            debug!(
                authority = %this.channel.authority(),
                %code,
                version = message.version,
                services = message.services,
                "handshake rejected"
            );
            this.channel.stop(code);
            this.complete(Err(code));
            return;
        }

        let negotiated = this.settings.protocol_maximum.min(message.version);
        debug!(
            authority = %this.channel.authority(),
            peer = message.version,
            negotiated,
            agent = %message.user_agent,
            "peer version received"
        );
        this.channel.set_peer_version(message);
        this.channel.set_negotiated_version(negotiated);
        this.state
            .lock()
            .expect("mutex should be unpoisoned")
            .version_received = true;

        let acknowledger = this.clone();
        this.channel.executor().spawn(async move {
            match acknowledger.channel.send(&VersionAcknowledge).await {
                Ok(()) => {
                    acknowledger
                        .state
                        .lock()
                        .expect("mutex should be unpoisoned")
                        .verack_sent = true;
                    acknowledger.try_complete();
                }
                Err(code) => acknowledger.complete(Err(code)),
            }
        });
    }

    fn handle_verack(this: &Arc<Self>, event: Event<VersionAcknowledge>) {
        match event {
            Ok(_) => {
                this.state
                    .lock()
                    .expect("mutex should be unpoisoned")
                    .verack_received = true;
                this.try_complete();
            }
            Err(code) => this.complete(Err(code)),
        }
    }

    fn validate(&self, message: &Version) -> Result<(), Error> {
        let settings = &self.settings;
        if message.version < settings.protocol_minimum {
            return Err(Error::PeerUnsupported);
        }
        if message.services & settings.invalid_services != 0 {
            return Err(Error::PeerUnsupported);
        }

        // The peer must serve the network, and witness data if we advertise
        // witness ourselves.
        let required = settings.services_minimum
            | Services::NODE_NETWORK.bits()
            | (settings.services_maximum & Services::NODE_WITNESS.bits());
        if message.services & required != required {
            return Err(Error::PeerInsufficient);
        }

        let skew = Utc::now().timestamp().abs_diff(message.timestamp);
        if skew > settings.maximum_skew().as_secs() {
            return Err(Error::PeerTimestamp);
        }
        Ok(())
    }

    fn try_complete(&self) {
        {
            let state = self.state.lock().expect("mutex should be unpoisoned");
            if !(state.version_received && state.verack_sent && state.verack_received) {
                return;
            }
        }
        // Hold further dispatch until the session has attached the
        // post-handshake protocols.
        self.channel.pause();
        self.complete(Ok(()));
    }

    fn complete(&self, result: Result<(), Error>) {
        if let Some(completion) = self
            .completion
            .lock()
            .expect("mutex should be unpoisoned")
            .take()
        {
            let _ = completion.send(result);
        }
    }
}
