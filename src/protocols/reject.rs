//! Logging of peer `reject` notices (BIP61).

use std::sync::Arc;

use tracing::debug;

use crate::{net::Channel, protocol::message::Reject};

/// The reject protocol: logs and forwards nothing; no state change.
pub struct RejectProtocol;

impl RejectProtocol {
    /// Attach to a handshaken channel negotiated at BIP61 or above.
    pub fn start(channel: &Arc<Channel>) {
        let authority = channel.authority();
        let _ = channel.subscribe::<Reject>(move |event| match event {
            Ok(reject) => {
                debug!(
                    %authority,
                    message = %reject.message,
                    code = ?reject.code,
                    reason = %reject.reason,
                    hashed = reject.data.is_some(),
                    "peer rejected a message"
                );
                true
            }
            Err(_) => false,
        });
    }
}
