//! Session support: the channel lifecycle shared by every session family.

mod inbound;
mod manual;
mod outbound;
mod seed;

pub use inbound::InboundSession;
pub use manual::{ChannelHandler, ManualSession};
pub use outbound::OutboundSession;
pub use seed::SeedSession;

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    constants::{ALERT_VERSION, BIP61_VERSION},
    net::Channel,
    p2p::NetworkInner,
    protocols::{AddressProtocol, AlertProtocol, PingProtocol, RejectProtocol, VersionProtocol},
    Error,
};

/// Drive one channel from its creation to its terminal code.
///
/// The sequence is the same for every session family: store the loopback
/// nonce, attach and await the handshake, register with the supervisor
/// (loopback, capacity and duplicate-authority checks), attach the
/// session's post-handshake protocols while paused, resume, then wait for
/// the terminal code and mirror the registration down.
///
/// Returns the channel's terminal code; `attach` runs only when the
/// handshake and registration succeed.
pub(crate) async fn run_channel<F>(
    inner: &Arc<NetworkInner>,
    channel: Arc<Channel>,
    attach: F,
) -> Error
where
    F: FnOnce(&Arc<Channel>),
{
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut slot = Some(stop_tx);
    let subscribed = channel.subscribe_stop(move |event| {
        if let Err(code) = event {
            if let Some(tx) = slot.take() {
                let _ = tx.send(code);
            }
        }
        false
    });
    if subscribed.is_err() {
        return channel.stop_code().unwrap_or(Error::ChannelStopped);
    }

    // The nonce must be stored before our version message carries it out.
    if !inner.store_nonce(&channel) {
        channel.stop(Error::ChannelConflict);
        let _ = stop_rx.await;
        return Error::ChannelConflict;
    }

    channel.set_start_height(inner.top_height());
    let handshake = VersionProtocol::start(&channel, &inner.settings);
    channel.resume();
    let handshaken = handshake.await.unwrap_or(Err(Error::ChannelStopped));

    if let Err(code) = handshaken {
        channel.stop(code);
        let _ = stop_rx.await;
        inner.unstore_nonce(&channel);
        return code;
    }

    if let Err(code) = inner.count_channel(&channel) {
        debug!(authority = %channel.authority(), %code, "channel rejected");
        channel.stop(code);
        let _ = stop_rx.await;
        inner.unstore_nonce(&channel);
        return code;
    }

    channel.complete_handshake();
    inner.broadcaster.register(&channel);
    inner.notify_connect(&channel);
    attach(&channel);
    channel.resume();

    let code = stop_rx.await.unwrap_or(Error::ChannelStopped);

    inner.broadcaster.unregister(channel.nonce());
    inner.uncount_channel(&channel);
    inner.unstore_nonce(&channel);
    code
}

/// Attach the standard post-handshake protocols for a non-quiet channel,
/// selecting version-level variants from the negotiated version.
pub(crate) fn attach_post_handshake(inner: &Arc<NetworkInner>, channel: &Arc<Channel>) {
    let settings = &inner.settings;

    PingProtocol::start(channel, settings);

    if settings.enable_reject && channel.is_negotiated(BIP61_VERSION) {
        RejectProtocol::start(channel);
    }
    if settings.enable_alert && channel.is_negotiated(ALERT_VERSION) {
        AlertProtocol::start(channel);
    }
    if settings.enable_address {
        AddressProtocol::start(channel, settings, &inner.hosts);
    }
}
