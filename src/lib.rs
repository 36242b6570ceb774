//! The core peer-to-peer networking engine of a Bitcoin full node.
//!
//! This crate owns outgoing and incoming TCP connections to Bitcoin peers,
//! drives each connection through the protocol handshake, multiplexes
//! per-message subscriptions over the framed wire stream, supervises
//! liveness with ping/pong and inactivity timers, and composes those
//! per-connection state machines into four long-running sessions (seed,
//! manual, outbound, inbound) coordinated by the [`P2p`] supervisor.
//!
//! It deliberately does *not* validate blocks or transactions, track chain
//! state, or implement mempool policy; message bodies outside the engine's
//! own protocols are opaque to it.
//!
//! # Example
//!
//! ```no_run
//! use bitcoin_network::{P2p, Settings};
//!
//! # fn main() -> Result<(), bitcoin_network::Error> {
//! let mut settings = Settings::mainnet();
//! settings.host_pool_capacity = 10_000;
//! settings.threads = 4;
//!
//! let p2p = P2p::new(settings)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod constants;
mod error;
pub mod hosts;
pub mod net;
mod p2p;
pub mod protocol;
pub mod protocols;
pub mod runtime;
pub mod session;
mod subscriber;

pub use config::{Authority, Endpoint, Settings};
pub use error::Error;
pub use p2p::P2p;
pub use subscriber::{Event, Key, Subscriber};
