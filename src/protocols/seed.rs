//! The seeding exchange run on quiet channels.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    config::Settings,
    hosts::Hosts,
    net::Channel,
    protocol::{
        addr::AddressItem,
        message::{Address, GetAddress},
    },
    subscriber::Event,
    Error,
};

/// How many exchange events complete a seed channel: our address sent (or
/// skipped), `getaddr` sent, and gossiped addresses stored.
const SEED_EVENTS: u8 = 3;

/// The seed protocol.
///
/// After the handshake on a quiet channel: advertise our own address when
/// configured, request addresses, store one gossip response, then stop the
/// channel. Completion fires once, on the third event or the first error.
pub struct SeedProtocol {
    channel: Arc<Channel>,
    settings: Arc<Settings>,
    hosts: Arc<Hosts>,
    events: Mutex<u8>,
    completion: Mutex<Option<oneshot::Sender<Result<(), Error>>>>,
}

impl SeedProtocol {
    /// Attach to a handshaken seed channel and begin the exchange.
    pub fn start(
        channel: &Arc<Channel>,
        settings: &Arc<Settings>,
        hosts: &Arc<Hosts>,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();
        let protocol = Arc::new(SeedProtocol {
            channel: channel.clone(),
            settings: settings.clone(),
            hosts: hosts.clone(),
            events: Mutex::new(0),
            completion: Mutex::new(Some(tx)),
        });

        let on_address = protocol.clone();
        if channel
            .subscribe::<Address>(move |event| {
                Self::handle_address(&on_address, event);
                false
            })
            .is_err()
        {
            protocol.complete(Err(channel.stop_code().unwrap_or(Error::ChannelStopped)));
            return rx;
        }

        Self::send_own_address(&protocol);

        let requester = protocol.clone();
        channel.executor().spawn(async move {
            match requester.channel.send(&GetAddress).await {
                Ok(()) => Self::event(&requester),
                Err(code) => requester.complete(Err(code)),
            }
        });

        rx
    }

    fn send_own_address(this: &Arc<Self>) {
        if !this.settings.advertise_enabled() {
            Self::event(this);
            return;
        }
        let Some(authority) = this.settings.first_self() else {
            Self::event(this);
            return;
        };

        let item = AddressItem::from_authority(
            authority,
            this.settings.services_maximum,
            Utc::now().timestamp() as u32,
        );
        let advertiser = this.clone();
        this.channel.executor().spawn(async move {
            match advertiser
                .channel
                .send(&Address {
                    addresses: vec![item],
                })
                .await
            {
                Ok(()) => Self::event(&advertiser),
                Err(code) => advertiser.complete(Err(code)),
            }
        });
    }

    fn handle_address(this: &Arc<Self>, event: Event<Address>) {
        match event {
            Ok(message) => {
                let accepted = this.hosts.save(&message.addresses);
                debug!(
                    authority = %this.channel.authority(),
                    received = message.addresses.len(),
                    accepted,
                    "storing addresses from seed"
                );
                Self::event(this);
            }
            Err(code) => this.complete(Err(code)),
        }
    }

    fn event(this: &Arc<Self>) {
        let done = {
            let mut events = this.events.lock().expect("mutex should be unpoisoned");
            *events += 1;
            *events >= SEED_EVENTS
        };
        if done {
            debug!(authority = %this.channel.authority(), "seed exchange complete");
            this.complete(Ok(()));
            this.channel.stop(Error::SeedingComplete);
        }
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
