//! Connections
//!
//! A [`Connection`] is one socket-addressable protocol endpoint. It carries
//! the active role and its state, the attached header table, HTTP/2 context,
//! flow control, any unsent partial write and the client-side bookkeeping
//! used while an outbound connection is being established.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub mod flow;
pub mod id;
pub mod state;
pub mod timeout;

pub use flow::{RxFlow, RxFlowReason};
pub use id::{ConnId, ConnectionTable};
pub use state::{LrsState, RoleTag};
pub use timeout::{PendingTimeout, TimeoutList};

use crate::client::ClientState;
use crate::h2::{H2NetConn, H2Stream, Pps, PpsKind, StreamHead};
use crate::headers::HdrToken;
use crate::headers::AhId;
use crate::role::{cgi::CgiChannel, Role, WriteProtocol};
use crate::transport::{Socket, SocketId};
use crate::vhost::Vhost;

/// HTTP content-length bookkeeping
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HttpTx {
    pub tx_content_length: u64,
    pub tx_content_remain: u64,
    pub rx_content_length: u64,
    pub rx_content_remain: u64,
}

impl HttpTx {
    /// Declare the body length about to be sent
    pub fn set_tx_content_length(&mut self, len: u64) {
        self.tx_content_length = len;
        self.tx_content_remain = len;
    }
}

/// websocket closing, keepalive and extension draining state
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WsState {
    pub tx_draining_ext: bool,
    pub rx_draining_ext: bool,
    /// Payload of the CLOSE frame to send from WaitingToSendClose
    pub close_payload: Vec<u8>,
    /// A PONG, or the echo of a received CLOSE, is owed to the peer
    pub ping_pending: bool,
    /// Payload of the owed PONG or CLOSE echo
    pub ping_payload: Vec<u8>,
    /// The owed frame is a CLOSE echo rather than a PONG
    pub payload_is_close: bool,
    /// Send a keepalive PING on the next writable event
    pub send_check_ping: bool,
    pub(crate) pong_received: bool,
    pub(crate) last_ping_check: Option<Instant>,
}

/// Bytes a transport did not accept on the last write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialWrite {
    pub(crate) buf: Vec<u8>,
    pub(crate) offset: usize,
}

impl PartialWrite {
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.offset..]
    }
}

/// One protocol endpoint
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) role: RoleTag,
    pub(crate) state: LrsState,
    pub(crate) ops: &'static dyn Role,
    pub(crate) vhost: Arc<Vhost>,
    pub(crate) socket: Option<Box<dyn Socket>>,
    pub(crate) in_fds: bool,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) ah: Option<AhId>,
    pub(crate) h2: H2Stream,
    pub(crate) h2n: Option<Box<H2NetConn>>,
    pub(crate) http: HttpTx,
    pub(crate) flow: RxFlow,
    pub(crate) trunc: Option<PartialWrite>,
    pub(crate) parent: Option<ConnId>,
    pub(crate) children: Vec<ConnId>,
    pub(crate) client: ClientState,
    pub(crate) ws: WsState,
    pub(crate) cgi_channel: Option<CgiChannel>,
    pub(crate) hdr_parsing_completed: bool,
    pub(crate) told_user_closed: bool,
    pub(crate) client_rx_avail: bool,
    pub(crate) socket_is_permanently_unusable: bool,
    pub(crate) handling_pollout: bool,
    pub(crate) leave_pollout_active: bool,
    /// Writable callback requested by user code during a callback
    pub(crate) writable_requested: bool,
    /// Writes queued by user code during a callback
    pub(crate) tx_pending: Vec<(Vec<u8>, WriteProtocol)>,
    pub(crate) closing: bool,
}

impl Connection {
    pub(crate) fn new(id: ConnId, role: RoleTag, state: LrsState, ops: &'static dyn Role, vhost: Arc<Vhost>) -> Self {
        Self {
            id,
            role,
            state,
            ops,
            vhost,
            socket: None,
            in_fds: false,
            peer: None,
            ah: None,
            h2: H2Stream::default(),
            h2n: None,
            http: HttpTx::default(),
            flow: RxFlow::default(),
            trunc: None,
            parent: None,
            children: Vec::new(),
            client: ClientState::default(),
            ws: WsState::default(),
            cgi_channel: None,
            hdr_parsing_completed: false,
            told_user_closed: false,
            client_rx_avail: false,
            socket_is_permanently_unusable: false,
            handling_pollout: false,
            leave_pollout_active: false,
            writable_requested: false,
            tx_pending: Vec::new(),
            closing: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> RoleTag {
        self.role
    }

    #[must_use]
    pub fn role_name(&self) -> &'static str {
        self.ops.name()
    }

    #[must_use]
    pub fn state(&self) -> LrsState {
        self.state
    }

    #[must_use]
    pub fn vhost(&self) -> &Arc<Vhost> {
        &self.vhost
    }

    #[must_use]
    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket.as_ref().map(|s| s.id())
    }

    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn header_table(&self) -> Option<AhId> {
        self.ah
    }

    #[must_use]
    pub fn parent(&self) -> Option<ConnId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[ConnId] {
        &self.children
    }

    #[must_use]
    pub fn h2(&self) -> &H2Stream {
        &self.h2
    }

    pub fn h2_mut(&mut self) -> &mut H2Stream {
        &mut self.h2
    }

    /// Network-connection context, present on an h2 network connection
    #[must_use]
    pub fn h2_network(&self) -> Option<&H2NetConn> {
        self.h2n.as_deref()
    }

    /// Make this connection an h2 network connection. A client becomes
    /// stream 1 of its own connection.
    pub fn configure_h2_network(&mut self, server: bool) {
        let h2n = self.h2n.get_or_insert_with(Box::default);
        self.h2.upgraded_to_http2 = true;
        if !server && self.h2.my_sid == 0 {
            self.h2.my_sid = h2n.next_client_sid();
        }
        tracing::debug!(conn = %self.id, server, "h2 network configured");
    }

    /// Queue a protocol packet. Receive stays off until the queue drains.
    /// Returns false when this is not an h2 network connection.
    pub fn queue_pps(&mut self, kind: PpsKind, frame: bytes::Bytes) -> bool {
        let Some(h2n) = self.h2n.as_mut() else {
            return false;
        };
        h2n.pps.push_back(Pps { kind, frame });
        self.flow.set(RxFlowReason::H2PpsPending, false);
        self.writable_requested = true;
        true
    }

    /// Report a complete request head for stream `sid`. The stream is
    /// opened and given its head once the current read returns. Returns
    /// false when this is not an h2 network connection.
    pub fn h2_stream_head(&mut self, sid: u32, headers: Vec<(HdrToken, String)>) -> bool {
        let Some(h2n) = self.h2n.as_mut() else {
            return false;
        };
        h2n.heads.push(StreamHead { sid, headers });
        true
    }

    /// The peer sent a websocket CLOSE. It is echoed with `payload` on the
    /// next writable event and the connection then closes. Returns false
    /// when the CLOSE answers one sent from here; the reader then ends the
    /// connection by returning [`ParseOutcome::Closed`](crate::protocol::ParseOutcome::Closed).
    pub fn ws_close_received(&mut self, payload: &[u8]) -> bool {
        if self.state != LrsState::Established {
            return false;
        }
        self.set_state(LrsState::ReturnedClose);
        self.ws.payload_is_close = true;
        self.ws.ping_pending = true;
        self.ws.ping_payload = payload.to_vec();
        self.writable_requested = true;
        true
    }

    /// The peer sent a websocket PING; a PONG carrying `payload` goes back
    /// on the next writable event.
    pub fn ws_ping_received(&mut self, payload: &[u8]) {
        if self.ws.payload_is_close {
            return;
        }
        self.ws.ping_pending = true;
        self.ws.ping_payload = payload.to_vec();
        self.writable_requested = true;
    }

    /// The peer answered a keepalive PING
    pub fn ws_pong_received(&mut self) {
        self.ws.pong_received = true;
    }

    #[must_use]
    pub fn http(&self) -> &HttpTx {
        &self.http
    }

    pub fn http_mut(&mut self) -> &mut HttpTx {
        &mut self.http
    }

    #[must_use]
    pub fn client(&self) -> &ClientState {
        &self.client
    }

    #[must_use]
    pub fn ws(&self) -> &WsState {
        &self.ws
    }

    pub fn ws_mut(&mut self) -> &mut WsState {
        &mut self.ws
    }

    #[must_use]
    pub fn flow(&self) -> &RxFlow {
        &self.flow
    }

    #[must_use]
    pub fn pending_partial_write(&self) -> Option<&PartialWrite> {
        self.trunc.as_ref()
    }

    #[must_use]
    pub fn cgi_channel(&self) -> Option<CgiChannel> {
        self.cgi_channel
    }

    #[must_use]
    pub fn is_flowcontrolled(&self) -> bool {
        self.flow.is_flowcontrolled()
    }

    #[must_use]
    pub fn hdr_parsing_completed(&self) -> bool {
        self.hdr_parsing_completed
    }

    /// Header parser reports the request or response head is complete.
    pub fn set_hdr_parsing_completed(&mut self, done: bool) {
        self.hdr_parsing_completed = done;
    }

    #[must_use]
    pub fn client_rx_avail(&self) -> bool {
        self.client_rx_avail
    }

    pub fn clear_client_rx_avail(&mut self) {
        self.client_rx_avail = false;
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// User-level receive flow control. Applied to the poll interest once
    /// the current callback returns.
    pub fn rx_flow_control(&mut self, allow: bool) {
        self.flow.set(RxFlowReason::User, allow);
    }

    /// Ask for a writable callback once the current callback returns.
    pub fn callback_on_writable(&mut self) {
        self.writable_requested = true;
    }

    /// Queue `buf` for writing. It goes out through the role's framer once
    /// the current callback returns, in queue order.
    pub fn send(&mut self, buf: &[u8], wp: impl Into<WriteProtocol>) {
        self.tx_pending.push((buf.to_vec(), wp.into()));
    }

    /// A client with a request body to send sets this before its handshake
    /// goes out and clears it once the body is written.
    pub fn set_client_http_body_pending(&mut self, pending: bool) {
        self.client.http_body_pending = pending;
    }

    /// Move to `next`, debug-asserting that the move is legal.
    pub fn set_state(&mut self, next: LrsState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?} on {}",
            self.state,
            next,
            self.id
        );
        if self.state != next {
            tracing::trace!(conn = %self.id, from = ?self.state, to = ?next, "state");
        }
        self.state = next;
    }

    /// Switch role and state together
    pub(crate) fn role_transition(&mut self, role: RoleTag, state: LrsState, ops: &'static dyn Role) {
        tracing::debug!(conn = %self.id, from = ?self.role, to = ?role, ?state, "role transition");
        self.role = role;
        self.ops = ops;
        self.set_state(state);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("ops", &self.ops.name())
            .field("socket", &self.socket_id())
            .field("ah", &self.ah)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}
