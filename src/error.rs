//! The error taxonomy shared by every component of the networking engine.
//!
//! A single [`Error`] value is used both as an operation result and as the
//! terminal code fanned out to channel and session subscribers, so the type
//! is `Copy` and carries no payload. Context (addresses, commands, byte
//! counts) is logged at the point of failure instead.

use thiserror::Error;

/// A networking error or terminal notification code.
#[derive(Error, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    // Addresses.
    /// The address could not be parsed or is semantically invalid.
    #[error("invalid address")]
    AddressInvalid,
    /// No candidate address is available from the host pool.
    #[error("address not found")]
    AddressNotFound,
    /// The address family is disabled by configuration (IPv6).
    #[error("address disabled by configuration")]
    AddressDisabled,
    /// The address advertises a service bit configured as invalid.
    #[error("address advertises unsupported services")]
    AddressUnsupported,
    /// The address lacks a required service bit.
    #[error("address advertises insufficient services")]
    AddressInsufficient,
    /// The address is blacklisted or not whitelisted.
    #[error("address blocked by configuration")]
    AddressBlocked,
    /// A live channel already exists for this authority.
    #[error("address already in use")]
    AddressInUse,

    // Seeding.
    /// The seeding round completed without growing the host pool.
    #[error("seeding unsuccessful")]
    SeedingUnsuccessful,
    /// The seeding exchange on one channel ran to completion.
    #[error("seeding complete")]
    SeedingComplete,

    // File system.
    /// The hosts cache failed to load.
    #[error("failed to load hosts file")]
    FileLoad,
    /// The hosts cache failed to save.
    #[error("failed to save hosts file")]
    FileSave,

    // General I/O failures.
    /// The stream produced or accepted fewer bytes than required.
    #[error("bad data stream")]
    BadStream,
    /// A channel counter would overflow.
    #[error("channel count overflow")]
    ChannelOverflow,
    /// A channel counter would underflow.
    #[error("channel count underflow")]
    ChannelUnderflow,

    // Peer behavior.
    /// The remote peer closed the connection.
    #[error("peer disconnected")]
    PeerDisconnect,
    /// The peer speaks a protocol version below the configured minimum.
    #[error("peer version unsupported")]
    PeerUnsupported,
    /// The peer does not advertise the required services.
    #[error("peer services insufficient")]
    PeerInsufficient,
    /// The peer clock is skewed beyond the configured tolerance.
    #[error("peer timestamp invalid")]
    PeerTimestamp,
    /// The peer violated the negotiated protocol.
    #[error("peer protocol violation")]
    ProtocolViolation,

    // Incoming connection failures.
    /// A listener could not be bound or started.
    #[error("failed to listen")]
    ListenFailed,
    /// An incoming connection could not be accepted or registered.
    #[error("failed to accept")]
    AcceptFailed,
    /// The inbound connection limit is reached.
    #[error("service oversubscribed")]
    Oversubscribed,

    // Outgoing connection failures.
    /// Name resolution failed.
    #[error("failed to resolve")]
    ResolveFailed,
    /// The TCP connect failed.
    #[error("failed to connect")]
    ConnectFailed,

    // Heading read failures.
    /// The message heading could not be parsed.
    #[error("invalid message heading")]
    InvalidHeading,
    /// The heading magic does not match the configured network.
    #[error("invalid network magic")]
    InvalidMagic,

    // Payload read failures.
    /// The declared payload size exceeds the configured maximum.
    #[error("oversized message payload")]
    OversizedPayload,
    /// The payload checksum does not match the heading.
    #[error("invalid message checksum")]
    InvalidChecksum,
    /// The payload failed to deserialize for its message type.
    #[error("invalid message payload")]
    InvalidMessage,
    /// The heading command is not a known message identifier.
    #[error("unknown message command")]
    UnknownMessage,

    // General failures.
    /// The configuration is internally inconsistent.
    #[error("invalid configuration")]
    InvalidConfiguration,
    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    OperationTimeout,
    /// An operation was canceled before completion.
    #[error("operation canceled")]
    OperationCanceled,
    /// An operation failed for an unmapped platform reason.
    #[error("operation failed")]
    OperationFailed,

    // Termination.
    /// The channel was stopped by the liveness deadline.
    #[error("channel timed out")]
    ChannelTimeout,
    /// The channel conflicts with another (nonce collision).
    #[error("channel conflict")]
    ChannelConflict,
    /// The channel handle was dropped.
    #[error("channel dropped")]
    ChannelDropped,
    /// The channel reached its staggered expiration.
    #[error("channel expired")]
    ChannelExpired,
    /// The channel saw no inbound activity within the configured window.
    #[error("channel inactive")]
    ChannelInactive,
    /// The channel was stopped by explicit call.
    #[error("channel stopped")]
    ChannelStopped,
    /// The service was stopped by explicit call.
    #[error("service stopped")]
    ServiceStopped,
    /// The service is suspended.
    #[error("service suspended")]
    ServiceSuspended,
    /// A subscription with the same key already exists.
    #[error("subscriber exists")]
    SubscriberExists,
    /// The subscriber is stopped and accepts no subscriptions.
    #[error("subscriber stopped")]
    SubscriberStopped,
    /// The subscription was individually removed.
    #[error("desubscribed")]
    Desubscribed,

    /// A disabled sub-session was skipped (success-equivalent).
    #[error("bypassed")]
    Bypassed,
}

impl Error {
    /// True for codes that indicate an orderly local shutdown rather than a
    /// failure attributable to the remote peer.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Error::ChannelStopped | Error::ServiceStopped | Error::OperationCanceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_codes_are_not_peer_faults() {
        assert!(Error::ChannelStopped.is_shutdown());
        assert!(Error::ServiceStopped.is_shutdown());
        assert!(Error::OperationCanceled.is_shutdown());
        assert!(!Error::ProtocolViolation.is_shutdown());
        assert!(!Error::ChannelTimeout.is_shutdown());
    }
}
