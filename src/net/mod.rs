//! The connection fabric: sockets, connectors, acceptors, channels, and the
//! per-channel message distributor.

mod acceptor;
mod broadcaster;
mod channel;
mod connector;
mod distributor;
mod socket;

pub use acceptor::Acceptor;
pub use broadcaster::Broadcaster;
pub use channel::Channel;
pub use connector::Connector;
pub use distributor::Distributor;
pub use socket::Socket;
