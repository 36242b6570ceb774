//! A strand-friendly wrapper over an OS stream socket.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{config::Authority, Error};

/// A wrapped TCP stream.
///
/// The owner drives reads strictly sequentially (the channel read loop);
/// writes serialise through the write-half lock, so frames never interleave.
/// [`stop`](Socket::stop) is idempotent and cancels outstanding I/O, which
/// then completes with `ChannelStopped`.
pub struct Socket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    authority: Authority,
    stop: CancellationToken,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("authority", &self.authority)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Socket {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> Socket {
        // The remote endpoint is captured up front: after a disconnect the
        // OS no longer reports it, but logs and reservations still need it.
        let authority = stream
            .peer_addr()
            .map(Authority::from)
            .unwrap_or_else(|_| Authority::unspecified());
        let (reader, writer) = stream.into_split();
        Socket {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            authority,
            stop: CancellationToken::new(),
        }
    }

    /// The remote endpoint, or the default authority when it was never
    /// known.
    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Read exactly `buffer.len()` bytes.
    pub async fn read_exact(&self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut reader = tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::ChannelStopped),
            reader = self.reader.lock() => reader,
        };
        tokio::select! {
            _ = self.stop.cancelled() => Err(Error::ChannelStopped),
            result = reader.read_exact(buffer) => result.map(|_| ()).map_err(map_read_error),
        }
    }

    /// Write all of `buffer`.
    pub async fn write_all(&self, buffer: &[u8]) -> Result<(), Error> {
        let mut writer = tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::ChannelStopped),
            writer = self.writer.lock() => writer,
        };
        tokio::select! {
            _ = self.stop.cancelled() => Err(Error::ChannelStopped),
            result = writer.write_all(buffer) => result.map_err(map_write_error),
        }
    }

    /// Cancel outstanding and future I/O. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// True once [`stop`](Socket::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

fn map_read_error(err: std::io::Error) -> Error {
    use std::io::ErrorKind::*;
    match err.kind() {
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => {
            Error::PeerDisconnect
        }
        _ => Error::BadStream,
    }
}

fn map_write_error(err: std::io::Error) -> Error {
    use std::io::ErrorKind::*;
    match err.kind() {
        ConnectionReset | ConnectionAborted | BrokenPipe => Error::PeerDisconnect,
        _ => Error::OperationFailed,
    }
}
