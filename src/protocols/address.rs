//! Address gossip: serve `getaddr`, absorb `addr`.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::{
    config::Settings,
    hosts::Hosts,
    net::Channel,
    protocol::message::{Address, GetAddress},
    subscriber::Event,
};

/// The address protocol.
///
/// Responds to `getaddr` with a random sample of the host pool (between the
/// configured lower and upper advertisement bounds) and folds inbound `addr`
/// items into the pool through the exclusion filters.
pub struct AddressProtocol {
    channel: Arc<Channel>,
    settings: Arc<Settings>,
    hosts: Arc<Hosts>,
}

impl AddressProtocol {
    /// Attach to a handshaken channel.
    pub fn start(channel: &Arc<Channel>, settings: &Arc<Settings>, hosts: &Arc<Hosts>) {
        let protocol = Arc::new(AddressProtocol {
            channel: channel.clone(),
            settings: settings.clone(),
            hosts: hosts.clone(),
        });

        let on_get_address = protocol.clone();
        let _ = channel.subscribe::<GetAddress>(move |event| {
            on_get_address.handle_get_address(event)
        });

        let on_address = protocol;
        let _ = channel.subscribe::<Address>(move |event| on_address.handle_address(event));
    }

    fn handle_get_address(&self, event: Event<GetAddress>) -> bool {
        if event.is_err() {
            return false;
        }
        let lower = usize::from(self.settings.address_lower);
        let upper = usize::from(self.settings.address_upper).max(lower);
        let count = rand::thread_rng().gen_range(lower..=upper);
        let addresses = self.hosts.sample(count);
        debug!(
            authority = %self.channel.authority(),
            count = addresses.len(),
            "advertising addresses"
        );

        let channel = self.channel.clone();
        self.channel.executor().spawn(async move {
            let _ = channel.send(&Address { addresses }).await;
        });
        true
    }

    fn handle_address(&self, event: Event<Address>) -> bool {
        let Ok(message) = event else { return false };
        let accepted = self.hosts.save(&message.addresses);
        debug!(
            authority = %self.channel.authority(),
            received = message.addresses.len(),
            accepted,
            "storing gossiped addresses"
        );
        true
    }
}
