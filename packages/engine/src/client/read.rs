//! Response body delivery
//!
//! Body bytes are framed by content length or by chunked transfer-coding.
//! Either way the user protocol sees only payload, as
//! `ReceiveClientHttpRead`, and the transaction completes when the framing
//! says the body is over.

use std::ops::Range;

use tracing::{debug, trace};

use super::ChunkState;
use crate::conn::ConnId;
use crate::error::{Error, Result};
use crate::protocol::{ParseOutcome, Reason};
use crate::service::{RawRead, Worker};
use crate::transport::Interest;

/// What one pass of the chunk decoder found
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Payload ranges within the input, in order
    pub payload: Vec<Range<usize>>,
    /// Input bytes used; anything after belongs to the next response
    pub consumed: usize,
    /// The terminating zero-size chunk was seen
    pub completed: bool,
}

/// Decode chunked transfer-coding from `buf`, resuming at `state` with
/// `remaining` bytes of the current chunk still due.
///
/// # Errors
///
/// `Error::Protocol` ("chunking failure") on malformed framing.
pub fn decode_chunked(state: &mut ChunkState, remaining: &mut u64, buf: &[u8]) -> Result<ChunkOutcome> {
    let mut out = ChunkOutcome::default();
    let mut pos = 0;

    while pos < buf.len() {
        let byte = buf[pos];
        match *state {
            ChunkState::Hex => {
                if byte == b'\r' {
                    *state = ChunkState::Cr;
                } else {
                    let digit = char::from(byte).to_digit(16).ok_or(Error::protocol("chunking failure"))?;
                    *remaining = remaining
                        .checked_mul(16)
                        .and_then(|r| r.checked_add(u64::from(digit)))
                        .ok_or(Error::protocol("chunking failure"))?;
                }
                pos += 1;
            }
            ChunkState::Cr => {
                if byte != b'\n' {
                    return Err(Error::protocol("chunking failure"));
                }
                pos += 1;
                *state = ChunkState::Content;
                if *remaining == 0 {
                    // a bare CRLF trailer belongs to this response
                    if buf[pos..].starts_with(b"\r\n") {
                        pos += 2;
                    }
                    *state = ChunkState::Hex;
                    out.consumed = pos;
                    out.completed = true;
                    return Ok(out);
                }
            }
            ChunkState::Content => {
                let take = usize::try_from(*remaining).unwrap_or(usize::MAX).min(buf.len() - pos);
                out.payload.push(pos..pos + take);
                pos += take;
                *remaining -= take as u64;
                if *remaining == 0 {
                    *state = ChunkState::PostCr;
                }
            }
            ChunkState::PostCr => {
                if byte != b'\r' {
                    return Err(Error::protocol("chunking failure"));
                }
                *state = ChunkState::PostLf;
                pos += 1;
            }
            ChunkState::PostLf => {
                if byte != b'\n' {
                    return Err(Error::protocol("chunking failure"));
                }
                *state = ChunkState::Hex;
                *remaining = 0;
                pos += 1;
            }
        }
    }
    out.consumed = pos;
    Ok(out)
}

impl Worker {
    /// Body bytes wait on the established client `id`: tell the user, then
    /// pull them unless the user holds receive off.
    pub(crate) fn deliver_client_rx(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        if conn.told_user_closed {
            return Ok(());
        }
        conn.client_rx_avail = true;
        self.change_pollfd(id, Interest::POLLIN, Interest::NONE)?;

        let target = self.client_wsi_effective(id);
        if self.callback(target, Reason::ReceiveClientHttp).is_close() {
            debug!(conn = %id, "ReceiveClientHttp asked to close");
            return Err(Error::Closed);
        }

        let pull = self
            .conns
            .get(id)
            .is_some_and(|c| c.client_rx_avail && !c.flow.is_flowcontrolled());
        if pull {
            self.client_http_read(id)?;
        }
        Ok(())
    }

    /// Read available response body on the connection carrying `id` and
    /// deliver it. Returns how many bytes were taken from the wire.
    ///
    /// # Errors
    ///
    /// The connection was closed: the peer went away, the framing was
    /// broken or the user asked for it.
    pub fn client_http_read(&mut self, id: ConnId) -> Result<usize> {
        let master = self.network_id(id);
        match self.client_http_read_inner(master) {
            Ok(n) => Ok(n),
            Err(err) => {
                debug!(conn = %master, error = %err, "client http read failed");
                self.close_free(master, "client http read");
                Err(err)
            }
        }
    }

    fn client_http_read_inner(&mut self, id: ConnId) -> Result<usize> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        conn.client_rx_avail = false;

        let cap = self.config.pt_serv_buf_size;
        let bytes = match self.read_or_use_preamble(id, cap) {
            RawRead::Data(bytes) => bytes,
            RawRead::Again => {
                self.apply_rx_flow(id);
                return Ok(0);
            }
            RawRead::Nothing | RawRead::Failed => return Err(Error::Closed),
        };
        let len = bytes.len();
        self.apply_rx_flow(id);

        let h2 = self.conns.get(id).is_some_and(|c| c.role.is_h2());
        let result = if h2 {
            match self.codec_read_h2(id, &bytes) {
                ParseOutcome::Closed => Err(Error::Closed),
                ParseOutcome::Consumed(n) => {
                    self.unread(id, &bytes[n.min(len)..]);
                    Ok(())
                }
            }
        } else {
            self.consume_h1_body(id, &bytes)
        };
        self.restore_serv_buf(bytes);
        result.map(|()| len)
    }

    fn consume_h1_body(&mut self, id: ConnId, bytes: &[u8]) -> Result<()> {
        let effective = self.client_wsi_effective(id);
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;

        if conn.client.chunked {
            let mut state = conn.client.chunk;
            let mut remaining = conn.client.chunk_remaining;
            let decoded = decode_chunked(&mut state, &mut remaining, bytes)?;
            conn.client.chunk = state;
            conn.client.chunk_remaining = remaining;

            for range in decoded.payload {
                trace!(conn = %id, len = range.len(), "chunk payload");
                if self.callback(effective, Reason::ReceiveClientHttpRead(&bytes[range])).is_close() {
                    return Err(Error::Closed);
                }
            }
            if decoded.completed {
                debug!(conn = %id, "final chunk");
                self.unread(id, &bytes[decoded.consumed..]);
                return self.transaction_completed_client(id);
            }
            return Ok(());
        }

        let remain = conn.http.rx_content_remain;
        let n = if remain > 0 && remain < bytes.len() as u64 {
            remain as usize
        } else {
            bytes.len()
        };
        if self.callback(effective, Reason::ReceiveClientHttpRead(&bytes[..n])).is_close() {
            return Err(Error::Closed);
        }
        self.unread(id, &bytes[n..]);

        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        if conn.http.rx_content_length == 0 {
            // no length: the body runs until the peer closes
            return Ok(());
        }
        conn.http.rx_content_remain = conn.http.rx_content_remain.saturating_sub(n as u64);
        if conn.http.rx_content_remain > 0 {
            return Ok(());
        }
        self.transaction_completed_client(id)
    }

    /// Keep bytes that belong to a later read
    fn unread(&mut self, id: ConnId, rest: &[u8]) {
        if rest.is_empty() {
            return;
        }
        if let Some(conn) = self.conns.get_mut(id) {
            conn.flow.unread(rest);
        }
        self.apply_rx_flow(id);
    }

    /// Say whether the client `id` still has request body to send. Clearing
    /// it after the body is written moves the connection on to waiting for
    /// the response.
    pub fn client_http_body_pending(&mut self, id: ConnId, pending: bool) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.client.http_body_pending = pending;
        if !pending && conn.state == crate::conn::LrsState::IssueHttpBody {
            self.client_http_body_sent(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(buf: &[u8], out: &ChunkOutcome) -> Vec<u8> {
        out.payload.iter().flat_map(|r| buf[r.clone()].to_vec()).collect()
    }

    #[test]
    fn chunks_across_calls() {
        let mut state = ChunkState::Hex;
        let mut remaining = 0;

        let first = b"5\r\nhel";
        let out = decode_chunked(&mut state, &mut remaining, first).expect("first");
        assert_eq!(payload(first, &out), b"hel");
        assert!(!out.completed);
        assert_eq!(remaining, 2);

        let second = b"lo\r\na\r\n0123456789\r\n0\r\n\r\nHTTP/1.1";
        let out = decode_chunked(&mut state, &mut remaining, second).expect("second");
        assert_eq!(payload(second, &out), b"lo0123456789");
        assert!(out.completed);
        assert_eq!(&second[out.consumed..], b"HTTP/1.1");
    }

    #[test]
    fn bad_framing_is_a_chunking_failure() {
        let mut state = ChunkState::Hex;
        let mut remaining = 0;
        let err = decode_chunked(&mut state, &mut remaining, b"zz\r\n").expect_err("not hex");
        assert_eq!(err.diagnostic(), "chunking failure");

        let mut state = ChunkState::Hex;
        let mut remaining = 0;
        let err = decode_chunked(&mut state, &mut remaining, b"1\r\nxy").expect_err("no crlf after data");
        assert_eq!(err.diagnostic(), "chunking failure");
    }

    #[test]
    fn oversized_chunk_length_is_refused() {
        let mut state = ChunkState::Hex;
        let mut remaining = 0;
        assert!(decode_chunked(&mut state, &mut remaining, b"fffffffffffffffff\r\n").is_err());
    }
}
