//! Header tables
//!
//! A header table ("ah") holds parsed header tokens for one connection and a
//! small receive buffer of bytes that arrived while the table was attached.
//! Tables are scarce and come from a bounded per-worker pool.

use std::ops::Range;
use std::time::Instant;

use hashbrown::HashMap;
use http::header::{self, HeaderName};

pub mod pool;

pub use pool::{AhId, Attach, HeaderTablePool};

use crate::conn::ConnId;
use crate::error::HeaderTableError;

/// Header tokens the engine reads or writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HdrToken {
    /// Address to connect to (the proxy's, while proxying)
    ClientPeerAddress,
    ClientUri,
    ClientHost,
    ClientOrigin,
    ClientSentProtocols,
    ClientMethod,
    ClientIface,
    /// `:method` of an HTTP/2 request
    ColonMethod,
    /// `:protocol` of an extended CONNECT
    ColonProtocol,
    /// Status line of an HTTP/1.1 response
    Http,
    /// Status line of an HTTP/1.0 response
    Http1_0,
    /// `:status` of an HTTP/2 response
    ColonStatus,
    Location,
    ContentLength,
    TransferEncoding,
    Connection,
    Upgrade,
}

impl HdrToken {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ClientPeerAddress => "client-peer-address",
            Self::ClientUri => "client-uri",
            Self::ClientHost => "client-host",
            Self::ClientOrigin => "client-origin",
            Self::ClientSentProtocols => "client-sent-protocols",
            Self::ClientMethod => "client-method",
            Self::ClientIface => "client-iface",
            Self::ColonMethod => ":method",
            Self::ColonProtocol => ":protocol",
            Self::Http => "http/1.1",
            Self::Http1_0 => "http/1.0",
            Self::ColonStatus => ":status",
            Self::Location => "location",
            Self::ContentLength => "content-length",
            Self::TransferEncoding => "transfer-encoding",
            Self::Connection => "connection",
            Self::Upgrade => "upgrade",
        }
    }

    /// The header this token carries on the wire, for tokens that are
    /// real HTTP/1 headers
    #[must_use]
    pub fn header_name(self) -> Option<HeaderName> {
        match self {
            Self::Location => Some(header::LOCATION),
            Self::ContentLength => Some(header::CONTENT_LENGTH),
            Self::TransferEncoding => Some(header::TRANSFER_ENCODING),
            Self::Connection => Some(header::CONNECTION),
            Self::Upgrade => Some(header::UPGRADE),
            _ => None,
        }
    }

    /// Token for a received header name
    #[must_use]
    pub fn from_header_name(name: &HeaderName) -> Option<Self> {
        [
            Self::Location,
            Self::ContentLength,
            Self::TransferEncoding,
            Self::Connection,
            Self::Upgrade,
        ]
        .into_iter()
        .find(|token| token.header_name().as_ref() == Some(name))
    }
}

/// Where the header parser is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParserState {
    #[default]
    NamePart,
    Value,
    Complete,
}

/// One parsed header table
#[derive(Debug)]
pub struct HeaderTable {
    owner: Option<ConnId>,
    assigned: Option<Instant>,
    parser: ParserState,
    tokens: HashMap<HdrToken, Range<usize>>,
    data: Vec<u8>,
    data_cap: usize,
    rx: Box<[u8]>,
    rxpos: usize,
    rxlen: usize,
    http_response: u16,
    force_detachable: bool,
}

impl HeaderTable {
    pub(crate) fn new(data_cap: usize, rx_cap: usize) -> Self {
        Self {
            owner: None,
            assigned: None,
            parser: ParserState::NamePart,
            tokens: HashMap::new(),
            data: Vec::with_capacity(data_cap),
            data_cap,
            rx: vec![0; rx_cap].into_boxed_slice(),
            rxpos: 0,
            rxlen: 0,
            http_response: 0,
            force_detachable: false,
        }
    }

    #[must_use]
    pub fn owner(&self) -> Option<ConnId> {
        self.owner
    }

    #[must_use]
    pub fn assigned_at(&self) -> Option<Instant> {
        self.assigned
    }

    pub(crate) fn assign(&mut self, owner: ConnId, now: Instant) {
        self.reset();
        self.owner = Some(owner);
        self.assigned = Some(now);
    }

    pub(crate) fn release(&mut self) {
        self.reset();
        self.owner = None;
        self.assigned = None;
        self.force_detachable = false;
    }

    /// Forget all tokens and buffered bytes, ready for a new header block.
    pub fn reset(&mut self) {
        self.tokens.clear();
        self.data.clear();
        self.parser = ParserState::NamePart;
        self.rxpos = 0;
        self.rxlen = 0;
        self.http_response = 0;
    }

    #[must_use]
    pub fn parser_state(&self) -> ParserState {
        self.parser
    }

    pub fn set_parser_state(&mut self, state: ParserState) {
        self.parser = state;
    }

    /// Store `value` under `token`, replacing any earlier value.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderTableError::NoSpace`] when the data area cannot hold
    /// the value.
    pub fn simple_create(&mut self, token: HdrToken, value: &str) -> Result<(), HeaderTableError> {
        let free = self.data_cap.saturating_sub(self.data.len());
        if value.len() > free {
            return Err(HeaderTableError::NoSpace {
                needed: value.len(),
                free,
            });
        }
        let start = self.data.len();
        self.data.extend_from_slice(value.as_bytes());
        self.tokens.insert(token, start..self.data.len());
        Ok(())
    }

    #[must_use]
    pub fn get(&self, token: HdrToken) -> Option<&str> {
        self.get_bytes(token)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    #[must_use]
    pub fn get_bytes(&self, token: HdrToken) -> Option<&[u8]> {
        self.tokens.get(&token).map(|range| &self.data[range.clone()])
    }

    #[must_use]
    pub fn contains(&self, token: HdrToken) -> bool {
        self.tokens.contains_key(&token)
    }

    #[must_use]
    pub fn total_len(&self, token: HdrToken) -> usize {
        self.tokens.get(&token).map_or(0, |range| range.len())
    }

    #[must_use]
    pub fn data_used(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn http_response(&self) -> u16 {
        self.http_response
    }

    pub fn set_http_response(&mut self, status: u16) {
        self.http_response = status;
    }

    /// Unconsumed bytes in the receive buffer
    #[must_use]
    pub fn rx_pending(&self) -> &[u8] {
        &self.rx[self.rxpos..self.rxlen]
    }

    #[must_use]
    pub fn has_rx_pending(&self) -> bool {
        self.rxpos != self.rxlen
    }

    /// Append received bytes; returns how many fit.
    pub fn push_rx(&mut self, bytes: &[u8]) -> usize {
        if self.rxpos == self.rxlen {
            self.rxpos = 0;
            self.rxlen = 0;
        }
        let room = self.rx.len() - self.rxlen;
        let n = bytes.len().min(room);
        self.rx[self.rxlen..self.rxlen + n].copy_from_slice(&bytes[..n]);
        self.rxlen += n;
        n
    }

    pub fn advance_rx(&mut self, n: usize) {
        self.rxpos = (self.rxpos + n).min(self.rxlen);
    }

    /// Allow detaching even while parsing is unfinished
    pub fn force_to_detachable_state(&mut self) {
        self.force_detachable = true;
        self.parser = ParserState::Complete;
    }

    #[must_use]
    pub fn is_detachable(&self) -> bool {
        self.force_detachable || !self.has_rx_pending()
    }

    /// Token dump for diagnostics, in token order
    #[must_use]
    pub fn dump(&self) -> Vec<(HdrToken, String)> {
        let mut out: Vec<_> = self
            .tokens
            .iter()
            .map(|(token, range)| {
                (
                    *token,
                    String::from_utf8_lossy(&self.data[range.clone()]).into_owned(),
                )
            })
            .collect();
        out.sort_by_key(|(token, _)| *token);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_create_refuses_when_full() {
        let mut ah = HeaderTable::new(8, 16);
        ah.simple_create(HdrToken::ClientHost, "abcd").expect("fits");
        let err = ah
            .simple_create(HdrToken::ClientUri, "/toolong")
            .expect_err("should not fit");
        assert_eq!(err, HeaderTableError::NoSpace { needed: 8, free: 4 });
        assert_eq!(ah.get(HdrToken::ClientHost), Some("abcd"));
        assert!(!ah.contains(HdrToken::ClientUri));
    }

    #[test]
    fn response_headers_map_to_tokens() {
        let name = HeaderName::from_static("transfer-encoding");
        assert_eq!(HdrToken::from_header_name(&name), Some(HdrToken::TransferEncoding));
        assert_eq!(HdrToken::from_header_name(&header::ACCEPT), None);
        assert_eq!(HdrToken::from_header_name(&header::UPGRADE), Some(HdrToken::Upgrade));
        assert_eq!(HdrToken::ClientUri.header_name(), None);
    }

    #[test]
    fn rx_buffer_tracks_position() {
        let mut ah = HeaderTable::new(8, 4);
        assert_eq!(ah.push_rx(b"abcdef"), 4);
        ah.advance_rx(3);
        assert_eq!(ah.rx_pending(), b"d");
        ah.advance_rx(1);
        assert!(!ah.has_rx_pending());
        assert_eq!(ah.push_rx(b"xy"), 2);
        assert_eq!(ah.rx_pending(), b"xy");
    }
}
