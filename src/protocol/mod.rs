//! Wire-facing definitions: newtype wrappers, the message identifier
//! enumeration with its typed payloads, and the heading codec.
//!
//! Only the messages the engine itself speaks carry full body codecs;
//! everything else exists as an identifier so headings parse and frames for
//! unsubscribed types are discarded without allocation.

pub mod addr;
pub mod codec;
pub mod message;
pub mod types;

pub use addr::AddressItem;
pub use codec::Heading;
pub use message::{Identifier, Payload};
pub use types::{Magic, Nonce, Services};
