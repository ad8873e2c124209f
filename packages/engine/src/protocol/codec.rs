//! Header tokenizer and frame codec invocation points

use http::StatusCode;

use crate::conn::Connection;
use crate::error::Result;
use crate::h2::{FrameType, FRAME_HEADER_LEN};
use crate::headers::{HdrToken, HeaderTable};

/// Result of handing bytes to a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// This many bytes were used; the rest must be offered again later
    Consumed(usize),
    /// The reader closed the connection
    Closed,
}

/// Header of one outbound HTTP/2 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Serialise into the fixed nine byte wire form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let len = self.length.to_be_bytes();
        let sid = (self.stream_id & 0x7fff_ffff).to_be_bytes();
        [
            len[1],
            len[2],
            len[3],
            self.kind as u8,
            self.flags,
            sid[0],
            sid[1],
            sid[2],
            sid[3],
        ]
    }
}

/// Parsed response status line plus the headers the client engine acts on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub location: Option<String>,
    /// The peer answered with HTTP/1.0 or asked to close
    pub close: bool,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl ResponseHead {
    /// Build from the tokens a header tokenizer left in `ah`.
    ///
    /// `h2_stream` selects `:status` over the HTTP/1 status line.
    ///
    /// # Errors
    ///
    /// `Error::Protocol` with the fixed diagnostic when the status is absent.
    pub fn from_header_table(ah: &HeaderTable, h2_stream: bool) -> Result<Self> {
        let mut close = false;
        let status = if h2_stream {
            ah.get(HdrToken::ColonStatus)
                .ok_or(crate::Error::protocol("HS: :status missing"))?
        } else if let Some(line) = ah.get(HdrToken::Http) {
            line
        } else {
            close = true;
            ah.get(HdrToken::Http1_0)
                .ok_or(crate::Error::protocol("HS: URI missing"))?
        };
        let status = leading_number(status)
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(0);

        if ah
            .get(HdrToken::Connection)
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            close = true;
        }

        let chunked = ah
            .get(HdrToken::TransferEncoding)
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        let content_length = ah.get(HdrToken::ContentLength).and_then(leading_number);

        Ok(Self {
            status,
            location: ah.get(HdrToken::Location).map(str::to_owned),
            // HTTP/1.1 needs a length or chunking to stay alive
            close: close || (content_length.is_none() && !chunked && !h2_stream),
            content_length,
            chunked,
        })
    }

    /// Statuses the client engine follows
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(
            StatusCode::from_u16(self.status),
            Ok(StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT)
        )
    }
}

/// One websocket frame as a server sends it: FIN bit, opcode, the
/// shortest length encoding, no mask.
#[must_use]
pub fn ws_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 10);
    out.push(if fin { 0x80 } else { 0 } | (opcode & 0x0f));
    if len <= 125 {
        out.extend_from_slice(&(len as u64).to_be_bytes()[7..]);
    } else if let Ok(mid) = u16::try_from(len) {
        out.push(126);
        out.extend_from_slice(&mid.to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

fn leading_number(s: &str) -> Option<u64> {
    let s = s.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// HTTP/1 header tokenizer and HTTP/2 frame codec.
///
/// Readers mark completion through
/// [`Connection::set_hdr_parsing_completed`] and record tokens in the
/// attached header table.
pub trait WireCodec: Send {
    fn read_h1(
        &mut self,
        conn: &mut Connection,
        ah: Option<&mut HeaderTable>,
        buf: &[u8],
    ) -> ParseOutcome;

    fn read_h2(&mut self, conn: &mut Connection, buf: &[u8]) -> ParseOutcome;

    /// Serialise one frame
    fn encode_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Serialise one websocket frame. A client codec must override this
    /// to mask its frames.
    fn encode_ws_frame(&mut self, _conn: &Connection, opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        ws_frame(opcode, fin, payload)
    }

    /// Request headers for an HTTP/1 client. `None` when nothing could be
    /// generated.
    fn client_handshake(&mut self, conn: &Connection, ah: &HeaderTable) -> Option<Vec<u8>>;

    /// Connection preface plus initial SETTINGS
    fn h2_preface(&mut self, conn: &Connection) -> Vec<u8>;

    /// Websocket upgrade processing of a request head, on an HTTP/1
    /// connection or an HTTP/2 stream. Writes queued with
    /// [`Connection::send`] go out before the role switches.
    ///
    /// # Errors
    ///
    /// Any error aborts the upgrade.
    fn process_ws_upgrade(&mut self, conn: &mut Connection) -> Result<()>;
}
