//! Outbound HTTP/2 framing
//!
//! Payload writes on a stream become one frame on the network connection.
//! Protocol packets queued on the network connection always go first.

use super::{FrameType, H2Stream, FLAG_END_HEADERS, FLAG_END_STREAM};
use crate::conn::{ConnId, HttpTx, LrsState, RoleTag};
use crate::error::{Error, Result};
use crate::protocol::FrameHeader;
use crate::role::{WriteKind, WriteProtocol};
use crate::service::Worker;
use crate::telemetry::ConnStats;

/// Frame type and flags chosen for one write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlan {
    pub kind: FrameType,
    pub flags: u8,
    /// The write was promoted to the final body write
    pub promoted_final: bool,
}

impl FramePlan {
    #[must_use]
    pub fn end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    #[must_use]
    pub fn end_headers(&self) -> bool {
        self.flags & FLAG_END_HEADERS != 0
    }
}

/// Decide how a write of `len` bytes is framed, updating the stream's
/// END_STREAM latch and content-length bookkeeping.
///
/// `None` means the write is dropped: nothing is sent and nothing changes.
pub fn plan_frame(
    role: RoleTag,
    state: LrsState,
    h2: &mut H2Stream,
    http: &mut HttpTx,
    len: usize,
    wp: WriteProtocol,
) -> Option<FramePlan> {
    let mut kind = wp.kind;
    let http_kind = matches!(
        kind,
        WriteKind::Http | WriteKind::HttpFinal | WriteKind::HttpHeaders | WriteKind::HttpHeadersContinuation
    );
    let legal_close = state.is_closing() && kind == WriteKind::Close;

    if !role.is_ws() && !http_kind && !legal_close {
        return None;
    }
    if !state.accepts_payload() && !legal_close {
        return None;
    }

    let mut frame = FrameType::Data;
    let mut flags = 0;

    if matches!(kind, WriteKind::HttpHeaders | WriteKind::HttpHeadersContinuation) {
        frame = if kind == WriteKind::HttpHeaders {
            FrameType::Headers
        } else {
            FrameType::Continuation
        };
        if !wp.no_fin {
            flags = FLAG_END_HEADERS;
        }
        if h2.send_end_stream || wp.h2_stream_end {
            flags |= FLAG_END_STREAM;
            h2.send_end_stream = true;
        }
    }

    let mut promoted_final = false;
    if matches!(kind, WriteKind::Http | WriteKind::HttpFinal) && http.tx_content_length > 0 {
        http.tx_content_remain = http.tx_content_remain.saturating_sub(len as u64);
        tracing::debug!(remain = http.tx_content_remain, "tx content");
        if http.tx_content_remain == 0 {
            promoted_final = kind == WriteKind::Http;
            kind = WriteKind::HttpFinal;
        }
    }

    if kind == WriteKind::HttpFinal || wp.h2_stream_end {
        flags |= FLAG_END_STREAM;
        h2.send_end_stream = true;
    }

    Some(FramePlan {
        kind: frame,
        flags,
        promoted_final,
    })
}

/// Stream write framer
pub(crate) fn write_role_protocol(w: &mut Worker, id: ConnId, buf: &[u8], wp: WriteProtocol) -> Result<usize> {
    let conn = w.conn_mut(id).ok_or(Error::Closed)?;
    let Some(plan) = plan_frame(conn.role, conn.state, &mut conn.h2, &mut conn.http, buf.len(), wp) else {
        tracing::info!(conn = %id, state = ?conn.state, kind = ?wp.kind, "binning write");
        return Ok(0);
    };
    if plan.end_stream() {
        tracing::debug!(conn = %id, "setting END_STREAM");
    }

    let header = FrameHeader {
        length: u32::try_from(buf.len()).map_err(|_| Error::protocol("frame too large"))?,
        kind: plan.kind,
        flags: plan.flags,
        stream_id: conn.h2.my_sid,
    };
    let frame = w.encode_frame(&header, buf);
    let nwsi = w.network_id(id);
    w.issue_raw(nwsi, &frame)?;
    Ok(buf.len())
}

/// Send one queued protocol packet on the network connection.
pub(crate) fn pps_send(w: &mut Worker, nwsi: ConnId) -> Result<()> {
    let pps = w
        .conn_mut(nwsi)
        .and_then(|c| c.h2n.as_mut())
        .and_then(|h2n| h2n.pps.pop_front());
    let Some(pps) = pps else {
        return Ok(());
    };
    tracing::debug!(conn = %nwsi, kind = ?pps.kind, "sending pps");
    w.issue_raw(nwsi, &pps.frame)?;
    ConnStats::bump(&w.stats().h2_pps_sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (H2Stream, HttpTx) {
        let h2 = H2Stream {
            my_sid: 1,
            http2_substream: true,
            ..H2Stream::default()
        };
        (h2, HttpTx::default())
    }

    #[test]
    fn content_length_promotes_the_last_write() {
        let (mut h2, mut http) = stream();
        http.set_tx_content_length(10);

        let first = plan_frame(
            RoleTag::H2Server,
            LrsState::Established,
            &mut h2,
            &mut http,
            6,
            WriteKind::Http.into(),
        )
        .expect("established stream accepts http");
        assert!(!first.end_stream());
        assert!(!first.promoted_final);
        assert_eq!(http.tx_content_remain, 4);

        let second = plan_frame(
            RoleTag::H2Server,
            LrsState::Established,
            &mut h2,
            &mut http,
            4,
            WriteKind::Http.into(),
        )
        .expect("established stream accepts http");
        assert!(second.end_stream());
        assert!(second.promoted_final);
        assert_eq!(second.kind, FrameType::Data);
        assert!(h2.send_end_stream);
    }

    #[test]
    fn headers_get_end_headers_unless_more_follow() {
        let (mut h2, mut http) = stream();
        let plan = plan_frame(
            RoleTag::H2Client,
            LrsState::H2WaitingToSendHeaders,
            &mut h2,
            &mut http,
            20,
            WriteProtocol::new(WriteKind::HttpHeaders).no_fin(),
        )
        .expect("headers are accepted");
        assert_eq!(plan.kind, FrameType::Headers);
        assert!(!plan.end_headers());

        let cont = plan_frame(
            RoleTag::H2Client,
            LrsState::H2WaitingToSendHeaders,
            &mut h2,
            &mut http,
            5,
            WriteProtocol::new(WriteKind::HttpHeadersContinuation).stream_end(),
        )
        .expect("continuation is accepted");
        assert_eq!(cont.kind, FrameType::Continuation);
        assert_eq!(cont.flags, FLAG_END_HEADERS | FLAG_END_STREAM);
    }

    #[test]
    fn writes_outside_payload_states_are_dropped() {
        let (mut h2, mut http) = stream();
        assert!(plan_frame(
            RoleTag::H2Client,
            LrsState::WaitingConnect,
            &mut h2,
            &mut http,
            3,
            WriteKind::Http.into(),
        )
        .is_none());
        assert!(plan_frame(
            RoleTag::H2Server,
            LrsState::Established,
            &mut h2,
            &mut http,
            3,
            WriteKind::Text.into(),
        )
        .is_none());
        assert!(!h2.send_end_stream);
    }

    #[test]
    fn close_is_honoured_while_closing() {
        let (mut h2, mut http) = stream();
        let plan = plan_frame(
            RoleTag::Ws2Server,
            LrsState::WaitingToSendClose,
            &mut h2,
            &mut http,
            2,
            WriteKind::Close.into(),
        )
        .expect("close frame is legal while closing");
        assert_eq!(plan.kind, FrameType::Data);
        assert_eq!(plan.flags, 0);
    }
}
