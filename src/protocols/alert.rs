//! Logging of legacy `alert` messages.

use std::sync::Arc;

use tracing::debug;

use crate::{net::Channel, protocol::message::Alert};

/// The alert protocol: logs only.
pub struct AlertProtocol;

impl AlertProtocol {
    /// Attach to a handshaken channel, when alerts are enabled.
    pub fn start(channel: &Arc<Channel>) {
        let authority = channel.authority();
        let _ = channel.subscribe::<Alert>(move |event| match event {
            Ok(alert) => {
                debug!(%authority, bytes = alert.payload.len(), "peer alert received");
                true
            }
            Err(_) => false,
        });
    }
}
