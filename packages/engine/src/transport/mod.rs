//! Transport and socket ports
//!
//! Byte-level I/O (plain or TLS) and socket primitives are supplied from
//! outside the engine through these traits. A `socket2`-backed factory is
//! provided for plain TCP.

use std::io;
use std::net::SocketAddr;

pub mod poll;
pub mod tcp;

pub use poll::{Interest, NullPoller, PollEvent, PollFd, PollFdTable, Poller};
pub use tcp::Socket2Factory;

/// Identifier of a socket in the worker's descriptor table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// Result of one transport read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were placed in the buffer (never 0)
    Data(usize),
    /// Orderly shutdown by the peer
    Closed,
    /// Nothing available yet, or the TLS layer needs another round
    MoreService,
    /// Hard failure
    Error,
}

/// Result of one transport write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// This many bytes were accepted, possibly fewer than offered
    Written(usize),
    /// Nothing could be accepted now
    MoreService,
    /// Hard failure
    Error,
}

/// Byte-level read/write capability of a connected socket.
pub trait Transport: Send {
    fn id(&self) -> SocketId;

    fn read(&mut self, buf: &mut [u8]) -> ReadStatus;

    fn write(&mut self, buf: &[u8]) -> WriteStatus;

    /// Bytes already decrypted and buffered above the socket
    fn pending(&self) -> usize {
        0
    }

    /// Whether ALPN settled on `h2`
    fn negotiated_h2(&self) -> bool {
        false
    }
}

/// A client socket the engine can set up and connect.
pub trait Socket: Transport {
    /// Apply platform socket options
    ///
    /// # Errors
    ///
    /// Returns the io error from the failing option.
    fn set_options(&mut self) -> io::Result<()>;

    /// Bind to a named network interface
    ///
    /// # Errors
    ///
    /// Returns the io error from the bind.
    fn bind_interface(&mut self, iface: &str) -> io::Result<()>;

    /// Issue a non-blocking connect. "In progress" comes back as an error
    /// the caller classifies.
    ///
    /// # Errors
    ///
    /// Returns the io error reported by `connect(2)`.
    fn connect(&mut self, addr: SocketAddr) -> io::Result<()>;

    /// Pending asynchronous socket error, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the error state cannot be queried.
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

/// Creates unconnected client sockets.
pub trait SocketFactory: Send {
    /// Open a stream socket of the family of `addr`
    ///
    /// # Errors
    ///
    /// Returns the io error from `socket(2)`.
    fn open(&mut self, addr: &SocketAddr) -> io::Result<Box<dyn Socket>>;
}

/// Outcome of a non-blocking connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    InProgress,
}

/// Classify a connect result: transient codes are progress, not failure.
///
/// # Errors
///
/// Returns the original error when it is neither transient nor "already
/// connected".
pub fn classify_connect(result: io::Result<()>) -> io::Result<ConnectProgress> {
    let Err(err) = result else {
        return Ok(ConnectProgress::Connected);
    };

    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(ConnectProgress::InProgress);
    }

    match err.raw_os_error() {
        Some(code) if code == libc::EINPROGRESS || code == libc::EALREADY => {
            Ok(ConnectProgress::InProgress)
        }
        Some(code) if code == libc::EISCONN => Ok(ConnectProgress::Connected),
        _ => Err(err),
    }
}
