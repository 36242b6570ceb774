//! Definitions of constants.

use std::time::Duration;

/// The length of a Bitcoin message heading:
/// magic(4) + command(12) + payload length(4) + checksum(4).
pub const HEADING_SIZE: usize = 24;

/// The length of the zero-padded command field in a message heading.
pub const COMMAND_SIZE: usize = 12;

/// The oldest protocol version this crate will negotiate.
pub const MINIMUM_PROTOCOL: u32 = 31402;

/// The newest protocol version this crate speaks, advertised in our
/// `version` message and used as the initial negotiated version.
pub const MAXIMUM_PROTOCOL: u32 = 70016;

/// The protocol version that introduced the `alert` message.
pub const ALERT_VERSION: u32 = 311;

/// The protocol version that introduced the `pong` reply and the ping
/// nonce (BIP31).
pub const BIP31_VERSION: u32 = 60001;

/// The protocol version that introduced the `reject` message (BIP61).
pub const BIP61_VERSION: u32 = 70002;

/// The maximum payload size accepted from peers that do not serve witness
/// data.
pub const MAX_PAYLOAD_WITHOUT_WITNESS: usize = 1_800_003;

/// The maximum payload size accepted from witness-serving peers.
pub const MAX_PAYLOAD_WITH_WITNESS: usize = 4_000_000;

/// The maximum number of address items in one `addr` message.
pub const MAX_ADDRESSES_PER_MESSAGE: usize = 1_000;

/// The timeout for DNS lookups.
///
/// [6.1.3.3 Efficient Resource Usage] from [RFC 1123: Requirements for
/// Internet Hosts] suggests no less than 5 seconds for resolving timeout.
///
/// [RFC 1123: Requirements for Internet Hosts]: https://tools.ietf.org/rfcmarkup?doc=1123
/// [6.1.3.3  Efficient Resource Usage]: https://tools.ietf.org/rfcmarkup?doc=1123#page-77
pub const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for worker threads to coalesce before abandoning
/// them.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    /// Make sure the protocol thresholds are ordered as negotiated.
    #[test]
    fn ensure_levels_consistent() {
        assert!(ALERT_VERSION < MINIMUM_PROTOCOL);
        assert!(MINIMUM_PROTOCOL < BIP31_VERSION);
        assert!(BIP31_VERSION < BIP61_VERSION);
        assert!(BIP61_VERSION < MAXIMUM_PROTOCOL);
    }

    /// The witness ceiling bounds the non-witness ceiling.
    #[test]
    fn ensure_payload_ceilings_consistent() {
        assert!(MAX_PAYLOAD_WITHOUT_WITNESS < MAX_PAYLOAD_WITH_WITNESS);
    }
}
