//! Role capability table
//!
//! Every wire protocol a connection can speak is a [`Role`]. A role fills
//! in the capabilities it needs and leaves the rest at their defaults,
//! which return `None`. `None` means "absent": the worker falls back to its
//! generic behaviour, it never treats absence as an error. Dispatch code
//! only ever goes through this table.

use std::time::Instant;

use crate::conn::ConnId;
use crate::error::Result;
use crate::protocol::Reason;
use crate::service::Worker;
use crate::transport::Interest;

pub mod cgi;
pub mod h1;
pub mod raw;
pub mod ws;

pub use cgi::{CgiChannel, CgiRole, CGI};
pub use h1::{H1Role, H1};
pub use raw::{RawRole, RAW};
pub use ws::{WsRole, WS};

pub use crate::h2::role::{H2Role, H2};

/// Readable-event outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readable {
    /// Stop, nothing else to do
    Handled,
    /// Stop and close the connection
    HandledClose,
    /// Abort the connection hard
    Die,
    /// Continue with the generic writable service
    UserService,
}

/// Writable-event outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writable {
    /// Stop here, leaving write interest armed
    BailOk,
    /// Stop here and close the connection
    BailDie,
    /// Continue with the generic user writable service
    UserService,
}

/// Protocol upgrade outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upgrade {
    /// No upgrade; process normally
    Continue,
    /// The upgrade was attempted and failed
    Bail,
    /// Upgraded
    Done,
}

/// Kind of payload handed to a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Text,
    Binary,
    Continuation,
    Http,
    /// Last payload of an HTTP body
    HttpFinal,
    HttpHeaders,
    HttpHeadersContinuation,
    Close,
    Ping,
    Pong,
}

/// A write request: the kind plus modifier flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProtocol {
    pub kind: WriteKind,
    /// More header fragments follow; suppresses END_HEADERS
    pub no_fin: bool,
    /// Close the HTTP/2 stream with this write
    pub h2_stream_end: bool,
}

impl WriteProtocol {
    #[must_use]
    pub const fn new(kind: WriteKind) -> Self {
        Self {
            kind,
            no_fin: false,
            h2_stream_end: false,
        }
    }

    #[must_use]
    pub const fn no_fin(mut self) -> Self {
        self.no_fin = true;
        self
    }

    #[must_use]
    pub const fn stream_end(mut self) -> Self {
        self.h2_stream_end = true;
        self
    }
}

impl From<WriteKind> for WriteProtocol {
    fn from(kind: WriteKind) -> Self {
        Self::new(kind)
    }
}

/// One wire protocol's capabilities.
///
/// Implementations are zero-sized statics; a connection holds a
/// `&'static dyn Role`.
pub trait Role: Send + Sync {
    fn name(&self) -> &'static str;

    /// Readiness on the connection's socket
    fn on_readable(&self, _w: &mut Worker, _id: ConnId, _revents: Interest) -> Option<Readable> {
        None
    }

    /// Role-specific part of the writable service
    fn on_writable(&self, _w: &mut Worker, _id: ConnId) -> Option<Writable> {
        None
    }

    /// Who is told that `id` may write, and with which reason
    fn writeable(&self, _w: &Worker, _id: ConnId) -> Option<(ConnId, Reason<'static>)> {
        None
    }

    /// Once-a-second tick for every connection of this role. Returns how
    /// many connections it acted on.
    fn on_periodic(&self, _w: &mut Worker, _now: Instant) -> Option<usize> {
        None
    }

    /// Connections whose POLLIN must be synthesised because their data is
    /// already buffered above the socket
    fn poll_pending_override(&self, _w: &mut Worker) -> Option<Vec<ConnId>> {
        None
    }

    /// Bind an accepted or foreign socket to this role
    fn adopt(&self, _w: &mut Worker, _id: ConnId) -> Option<Result<()>> {
        None
    }

    /// Whether the first bytes of an inbound socket belong to this role
    fn detect_raw(&self, _w: &Worker, _id: ConnId, _bytes: &[u8]) -> Option<bool> {
        None
    }

    /// Wrap an outbound payload before it reaches the transport
    fn frame_outbound_write(
        &self,
        _w: &mut Worker,
        _id: ConnId,
        _buf: &[u8],
        _wp: WriteProtocol,
    ) -> Option<Result<usize>> {
        None
    }

    /// Protocol-to-protocol upgrade check
    fn check_upgrade(&self, _w: &mut Worker, _id: ConnId) -> Option<Upgrade> {
        None
    }
}

/// Every role the engine knows, in periodic service order
pub static ROLES: [&dyn Role; 5] = [&H1, &H2, &WS, &RAW, &CGI];

/// Look a role up by its table name
#[must_use]
pub fn by_name(name: &str) -> Option<&'static dyn Role> {
    ROLES.iter().copied().find(|role| role.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_unique() {
        let names: Vec<_> = ROLES.iter().map(|r| r.name()).collect();
        assert_eq!(names, ["h1", "h2", "ws", "raw-skt", "cgi"]);
        assert!(by_name("h2").is_some());
        assert!(by_name("ws").is_some());
        assert!(by_name("h3").is_none());
    }
}
