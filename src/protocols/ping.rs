//! The ping/pong liveness protocol.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::{
    config::Settings,
    constants::BIP31_VERSION,
    net::Channel,
    protocol::{
        message::{Ping, Pong},
        types::Nonce,
    },
    runtime::DeadlineTimer,
    subscriber::Event,
    Error,
};

/// The heartbeat protocol.
///
/// Below BIP31 a heartbeat sends an empty `ping` and inbound pings need no
/// reply. At BIP31 and above each heartbeat sends a nonced `ping` and
/// subscribes for the matching `pong`: a mismatched nonce is a protocol
/// violation, and a heartbeat that finds the previous nonce still
/// outstanding stops the channel as timed out. Inbound `ping`s are answered
/// with the echoed nonce.
pub struct PingProtocol {
    channel: Arc<Channel>,
    timer: DeadlineTimer,
    pending: Mutex<Option<u64>>,
    modern: bool,
}

impl PingProtocol {
    /// Attach to a handshaken channel and send the initial ping.
    pub fn start(channel: &Arc<Channel>, settings: &Arc<Settings>) {
        let protocol = Arc::new(PingProtocol {
            channel: channel.clone(),
            timer: DeadlineTimer::new(
                channel.executor(),
                channel.strand().clone(),
                settings.channel_heartbeat(),
            ),
            pending: Mutex::new(None),
            modern: channel.is_negotiated(BIP31_VERSION),
        });

        let on_ping = protocol.clone();
        if channel
            .subscribe::<Ping>(move |event| on_ping.handle_ping(event))
            .is_err()
        {
            return;
        }

        // The initial ping is the first heartbeat.
        Self::heartbeat(&protocol);
        Self::schedule(&protocol);
    }

    fn schedule(this: &Arc<Self>) {
        // The timer handler holds a weak reference: the distributor's ping
        // subscription keeps the protocol alive until the channel stops.
        let weak = Arc::downgrade(this);
        this.timer.start(move |result| {
            if let (Ok(()), Some(protocol)) = (result, weak.upgrade()) {
                Self::heartbeat(&protocol);
                Self::schedule(&protocol);
            }
        });
    }

    fn heartbeat(this: &Arc<Self>) {
        if this.channel.stopped() {
            return;
        }

        if !this.modern {
            let channel = this.channel.clone();
            this.channel.executor().spawn(async move {
                let _ = channel.send(&Ping { nonce: 0 }).await;
            });
            return;
        }

        let nonce = {
            let mut pending = this.pending.lock().expect("mutex should be unpoisoned");
            if pending.is_some() {
                drop(pending);
                warn!(
                    authority = %this.channel.authority(),
                    "no pong before next heartbeat"
                );
                this.channel.stop(Error::ChannelTimeout);
                return;
            }
            let nonce = Nonce::random().0;
            *pending = Some(nonce);
            nonce
        };

        let on_pong = this.clone();
        if this
            .channel
            .subscribe::<Pong>(move |event| {
                on_pong.handle_pong(event);
                false
            })
            .is_err()
        {
            return;
        }

        let channel = this.channel.clone();
        this.channel.executor().spawn(async move {
            let _ = channel.send(&Ping { nonce }).await;
        });
    }

    fn handle_ping(&self, event: Event<Ping>) -> bool {
        let Ok(ping) = event else { return false };
        debug!(authority = %self.channel.authority(), "ping received");
        if self.modern {
            let nonce = ping.nonce;
            let channel = self.channel.clone();
            self.channel.executor().spawn(async move {
                let _ = channel.send(&Pong { nonce }).await;
            });
        }
        true
    }

    fn handle_pong(&self, event: Event<Pong>) {
        let Ok(pong) = event else { return };
        let mut pending = self.pending.lock().expect("mutex should be unpoisoned");
        match pending.take() {
            Some(expected) if expected == pong.nonce => {}
            expected => {
                *pending = expected;
                drop(pending);
                warn!(
                    authority = %self.channel.authority(),
                    received = pong.nonce,
                    "unexpected pong nonce"
                );
                self.channel.stop(Error::ProtocolViolation);
            }
        }
    }
}
