//! Newtype wrappers for wire-level values.

use std::fmt;

/// A magic number identifying the network.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Magic(pub [u8; 4]);

impl Magic {
    /// The magic for a configured network identifier.
    pub fn from_identifier(identifier: u32) -> Self {
        Magic(identifier.to_le_bytes())
    }

    /// The configured-identifier form of this magic.
    pub fn to_identifier(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Debug for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Magic").field(&hex::encode(self.0)).finish()
    }
}

/// A nonce used in the networking layer to identify channels and pings.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Nonce(pub u64);

impl Nonce {
    /// A random nonzero nonce.
    ///
    /// Zero is reserved: pre-BIP31 pings carry no nonce and deserialize as
    /// zero, and loopback detection treats zero as unset.
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        loop {
            let nonce = rng.gen::<u64>();
            if nonce != 0 {
                return Nonce(nonce);
            }
        }
    }
}

impl Default for Nonce {
    fn default() -> Self {
        Nonce::random()
    }
}

bitflags::bitflags! {
    /// A bitflag describing services advertised by a node in the network.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct Services: u64 {
        /// A full node capable of serving blocks.
        const NODE_NETWORK = 1;
        /// UTXO queries (BIP64).
        const NODE_GETUTXO = 1 << 1;
        /// Bloom-filtered connections (BIP111).
        const NODE_BLOOM = 1 << 2;
        /// Segregated witness (BIP144).
        const NODE_WITNESS = 1 << 3;
        /// Client-side filters (BIP157).
        const NODE_CLIENT_FILTERS = 1 << 6;
        /// Serving only the last 288 blocks (BIP159).
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_debug() {
        assert_eq!(
            format!("{:?}", Magic::from_identifier(3_652_501_241)),
            "Magic(\"f9beb4d9\")"
        );
    }

    #[test]
    fn magic_identifier_round_trip() {
        for identifier in [0, 118_034_699, 3_652_501_241, 3_669_344_250, u32::MAX] {
            assert_eq!(Magic::from_identifier(identifier).to_identifier(), identifier);
        }
    }

    #[test]
    fn nonces_are_nonzero() {
        for _ in 0..64 {
            assert_ne!(Nonce::random().0, 0);
        }
    }
}
