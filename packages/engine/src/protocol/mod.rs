//! User protocol callback and wire codec ports
//!
//! The engine never interprets application payload itself. It tells the
//! user protocol what happened through [`Protocol::callback`], and it hands
//! bytes to the header tokenizer / frame codec through [`WireCodec`].

pub mod codec;

pub use codec::{ws_frame, FrameHeader, ParseOutcome, ResponseHead, WireCodec};

use crate::conn::{ConnId, Connection};
use crate::role::cgi::CgiChannel;

/// What the user protocol is being told
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason<'a> {
    /// An outbound connection could not be created. Delivered at most once.
    ClientConnectionError(&'a str),
    /// A queued or body-pending client may write
    ClientHttpWriteable,
    /// A server-side HTTP connection may write
    HttpWriteable,
    /// A websocket client may write
    ClientWriteable,
    /// A websocket server connection may write
    ServerWriteable,
    /// A request head is complete on a server connection or stream
    Http,
    /// A websocket connection closed
    Closed,
    /// Response body bytes are waiting. They are read and delivered as
    /// `ReceiveClientHttpRead` right after this returns, unless the callback
    /// holds receive off with rx flow control; then they wait for
    /// [`Worker::client_http_read`](crate::service::Worker::client_http_read)
    ReceiveClientHttp,
    /// One chunk of response body
    ReceiveClientHttpRead(&'a [u8]),
    CompletedClientHttp,
    EstablishedClientHttp,
    /// Last chance to refuse the response headers
    ClientFilterPreEstablish,
    ClosedClientHttp,
    RawRx(&'a [u8]),
    RawWriteable,
    RawAdopt,
    RawClose,
    /// A sub-process stdio channel is ready; `stdwsi` is the channel's
    /// own connection.
    Cgi { channel: CgiChannel, stdwsi: ConnId },
    /// A sub-process stdio channel was closed
    CgiTerminated,
}

/// What the user protocol wants next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallbackAction {
    #[default]
    Continue,
    /// Close the connection
    Close,
}

impl CallbackAction {
    #[must_use]
    pub fn is_close(self) -> bool {
        self == Self::Close
    }
}

/// User protocol.
///
/// Requests made on `conn` during a callback, such as
/// [`Connection::callback_on_writable`] or
/// [`Connection::rx_flow_control`], are applied once the callback returns.
pub trait Protocol: Send {
    fn name(&self) -> &str {
        "default"
    }

    fn callback(&mut self, conn: &mut Connection, reason: Reason<'_>) -> CallbackAction;
}

/// Sub-process plumbing that lives outside the engine.
pub trait ChildReaper: Send {
    /// Collect terminated children. Returns the connections whose stdio
    /// channels must be closed.
    fn reap_terminated(&mut self) -> Vec<ConnId>;
}
