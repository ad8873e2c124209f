//! HTTP/2 network connections and streams
//!
//! One network connection owns the socket, the receive scratch and the
//! queue of protocol packets to send. Streams are child connections that
//! frame their writes onto it.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::headers::HdrToken;

pub mod drain;
pub mod role;
pub mod stream;
pub mod upgrade;
pub mod write;

pub use role::{H2Role, H2};
pub use write::{plan_frame, FramePlan};

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 9;

pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;

/// Frame types the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    RstStream = 0x3,
    Settings = 0x4,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// Kind of a queued protocol packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpsKind {
    Settings,
    SettingsAck,
    PingAck,
    GoAway,
    RstStream,
    WindowUpdate,
}

/// A protocol packet waiting to be sent ahead of any payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub kind: PpsKind,
    /// Complete serialised frame
    pub frame: Bytes,
}

/// A request head the frame codec decoded for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHead {
    pub sid: u32,
    pub headers: Vec<(HdrToken, String)>,
}

/// Per network connection state
#[derive(Debug, Default)]
pub struct H2NetConn {
    pub(crate) pps: VecDeque<Pps>,
    pub(crate) rx_scratch: Option<Box<[u8]>>,
    pub(crate) rx_scratch_pos: usize,
    pub(crate) rx_scratch_len: usize,
    pub(crate) highest_sid: u32,
    pub(crate) ws_over_h2_count: u32,
    /// Heads reported during the current read, not yet given to streams
    pub(crate) heads: Vec<StreamHead>,
}

impl H2NetConn {
    #[must_use]
    pub fn pps_pending(&self) -> usize {
        self.pps.len()
    }

    /// Unparsed bytes left in the scratch
    #[must_use]
    pub fn scratch_pending(&self) -> usize {
        self.rx_scratch_len
    }

    #[must_use]
    pub fn ws_over_h2_count(&self) -> u32 {
        self.ws_over_h2_count
    }

    #[must_use]
    pub fn highest_sid(&self) -> u32 {
        self.highest_sid
    }

    /// Record a peer-initiated stream id
    pub(crate) fn note_peer_sid(&mut self, sid: u32) {
        self.highest_sid = self.highest_sid.max(sid);
    }

    /// Next client-initiated (odd) stream id
    pub(crate) fn next_client_sid(&mut self) -> u32 {
        self.highest_sid = if self.highest_sid == 0 { 1 } else { self.highest_sid + 2 };
        self.highest_sid
    }
}

/// Per stream flags
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct H2Stream {
    pub my_sid: u32,
    /// END_STREAM has been sent
    pub send_end_stream: bool,
    /// This connection is a stream under a network connection
    pub http2_substream: bool,
    pub upgraded_to_http2: bool,
    /// Client whose transport negotiated h2 by alpn
    pub client_h2_alpn: bool,
    pub stream_carries_ws: bool,
    /// Writable callback requested on the stream
    pub requested_pollout: bool,
}
