//! The "ws" role
//!
//! Websocket connections, over HTTP/1 sockets or HTTP/2 streams. Input
//! takes the same drain as h2; frames going out are serialised here and,
//! on a stream, wrapped in a DATA frame. Control frames owed to the peer
//! go out before anything the user writes.

use std::time::{Duration, Instant};

use super::{Readable, Role, Writable, WriteKind, WriteProtocol};
use crate::conn::{ConnId, LrsState, PendingTimeout};
use crate::error::{Error, Result};
use crate::h2::{drain, write};
use crate::protocol::Reason;
use crate::service::Worker;
use crate::transport::Interest;

/// Seconds a sent CLOSE waits for its acknowledgement
pub const CLOSE_ACK_SECS: u64 = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct WsRole;

pub static WS: WsRole = WsRole;

/// Frame opcode for a websocket write kind
#[must_use]
pub fn opcode(kind: WriteKind) -> Option<u8> {
    match kind {
        WriteKind::Continuation => Some(0x0),
        WriteKind::Text => Some(0x1),
        WriteKind::Binary => Some(0x2),
        WriteKind::Close => Some(0x8),
        WriteKind::Ping => Some(0x9),
        WriteKind::Pong => Some(0xa),
        WriteKind::Http | WriteKind::HttpFinal | WriteKind::HttpHeaders | WriteKind::HttpHeadersContinuation => None,
    }
}

impl Role for WsRole {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn on_readable(&self, w: &mut Worker, id: ConnId, revents: Interest) -> Option<Readable> {
        let conn = w.conn(id)?;
        if conn.ws().tx_draining_ext && !conn.state().is_closing() {
            // extension output drains before more input is taken
            if revents.contains(Interest::POLLOUT) && w.handle_pollout(id).is_err() {
                return Some(Readable::HandledClose);
            }
            return Some(Readable::Handled);
        }
        Some(drain::handle_readable(w, id, revents))
    }

    fn on_writable(&self, w: &mut Worker, id: ConnId) -> Option<Writable> {
        let conn = w.conn(id)?;
        let state = conn.state();

        if state == LrsState::WaitingToSendClose {
            return Some(match send_close(w, id) {
                Ok(()) => Writable::BailOk,
                Err(err) => {
                    tracing::debug!(conn = %id, error = %err, "close send failed");
                    Writable::BailDie
                }
            });
        }

        if conn.ws().ping_pending {
            return Some(send_owed_control(w, id));
        }

        if conn.ws().send_check_ping {
            if let Some(conn) = w.conn_mut(id) {
                conn.ws.send_check_ping = false;
            }
            if w.write(id, &[], WriteKind::Ping.into()).is_err() {
                return Some(Writable::BailDie);
            }
            let secs = w.config().timeout_secs;
            w.set_timeout(id, PendingTimeout::WsPongCheckGetPong, secs);
            return Some(Writable::BailOk);
        }

        if state == LrsState::ReturnedClose {
            return Some(Writable::UserService);
        }

        let conn = w.conn(id)?;
        if conn.role().is_client() && conn.ws().tx_draining_ext {
            tracing::debug!(conn = %id, "draining extension tx");
            if w.write(id, &[], WriteKind::Continuation.into()).is_err() {
                return Some(Writable::BailDie);
            }
            return Some(Writable::BailOk);
        }
        Some(Writable::UserService)
    }

    fn writeable(&self, w: &Worker, id: ConnId) -> Option<(ConnId, Reason<'static>)> {
        let reason = if w.conn(id)?.role().is_client() {
            Reason::ClientWriteable
        } else {
            Reason::ServerWriteable
        };
        Some((id, reason))
    }

    fn on_periodic(&self, w: &mut Worker, now: Instant) -> Option<usize> {
        Some(ping_checks(w, now))
    }

    fn frame_outbound_write(&self, w: &mut Worker, id: ConnId, buf: &[u8], wp: WriteProtocol) -> Option<Result<usize>> {
        let substream = w.conn(id)?.h2().http2_substream;
        let Some(opcode) = opcode(wp.kind) else {
            // the upgrade response itself
            return substream.then(|| write::write_role_protocol(w, id, buf, wp));
        };
        Some(write_frame(w, id, opcode, buf, wp, substream))
    }
}

fn write_frame(w: &mut Worker, id: ConnId, opcode: u8, buf: &[u8], wp: WriteProtocol, substream: bool) -> Result<usize> {
    let conn = w.conn(id).ok_or(Error::Closed)?;
    let legal_close = conn.state().is_closing() && wp.kind == WriteKind::Close;
    if !conn.state().accepts_payload() && !legal_close {
        tracing::info!(conn = %id, state = ?conn.state(), kind = ?wp.kind, "binning write");
        return Ok(0);
    }

    let frame = w.encode_ws_frame(id, opcode, !wp.no_fin, buf);
    if substream {
        let sent = write::write_role_protocol(w, id, &frame, WriteProtocol::new(wp.kind))?;
        return Ok(if sent == 0 { 0 } else { buf.len() });
    }
    let nwsi = w.network_id(id);
    w.issue_raw(nwsi, &frame)?;
    Ok(buf.len())
}

/// The CLOSE asked for by [`Worker::start_close`]
fn send_close(w: &mut Worker, id: ConnId) -> Result<()> {
    let payload = w
        .conn_mut(id)
        .map(|c| std::mem::take(&mut c.ws.close_payload))
        .ok_or(Error::Closed)?;
    tracing::debug!(conn = %id, len = payload.len(), "sending pending close");
    w.write(id, &payload, WriteKind::Close.into())?;
    if let Some(conn) = w.conn_mut(id) {
        conn.set_state(LrsState::AwaitingCloseAck);
    }
    w.set_timeout(id, PendingTimeout::CloseAck, CLOSE_ACK_SECS);
    Ok(())
}

/// A PONG, or the echo of the peer's CLOSE after which we are done
fn send_owed_control(w: &mut Worker, id: ConnId) -> Writable {
    let Some(conn) = w.conn_mut(id) else {
        return Writable::BailDie;
    };
    let is_close = conn.ws.payload_is_close;
    let payload = std::mem::take(&mut conn.ws.ping_payload);
    let kind = if is_close { WriteKind::Close } else { WriteKind::Pong };

    if w.write(id, &payload, kind.into()).is_err() {
        return Writable::BailDie;
    }
    if let Some(conn) = w.conn_mut(id) {
        conn.ws.ping_pending = false;
    }
    if is_close {
        tracing::debug!(conn = %id, "close echoed");
        return Writable::BailDie;
    }
    Writable::BailOk
}

/// Flag a keepalive PING on every websocket quiet for longer than the
/// configured interval. Returns how many were flagged.
fn ping_checks(w: &mut Worker, now: Instant) -> usize {
    let interval = w.config().ws_ping_pong_interval;
    if interval == 0 {
        return 0;
    }
    let interval = Duration::from_secs(interval);

    let mut flagged = 0;
    for id in w.connection_ids() {
        let due = match w.conn_mut(id) {
            Some(conn) if conn.role().is_ws() && conn.state() == LrsState::Established => {
                if conn.socket_is_permanently_unusable || conn.ws.send_check_ping {
                    continue;
                }
                match conn.ws.last_ping_check {
                    None => {
                        conn.ws.last_ping_check = Some(now);
                        false
                    }
                    Some(last) => now.saturating_duration_since(last) >= interval,
                }
            }
            _ => false,
        };
        if !due {
            continue;
        }

        tracing::debug!(conn = %id, "keepalive ping due");
        if let Some(conn) = w.conn_mut(id) {
            conn.ws.send_check_ping = true;
            conn.ws.last_ping_check = Some(now);
        }
        let secs = w.config().timeout_secs;
        w.set_timeout(id, PendingTimeout::WsPongCheckSendPing, secs);
        if let Err(err) = w.callback_on_writable(id) {
            tracing::debug!(conn = %id, error = %err, "keepalive writable request failed");
        }
        flagged += 1;
    }
    flagged
}

impl Worker {
    /// Start the websocket closing handshake on `id`: a CLOSE carrying
    /// `payload` goes out on the next writable event, then the peer has
    /// [`CLOSE_ACK_SECS`] to answer. A connection of any other role is
    /// closed at once.
    ///
    /// # Errors
    ///
    /// `Error::Closed` for an unknown connection, or the failure to ask for
    /// a writable event.
    pub fn start_close(&mut self, id: ConnId, payload: &[u8]) -> Result<()> {
        let conn = self.conn_mut(id).ok_or(Error::Closed)?;
        if !conn.role().is_ws() {
            self.close_free(id, "close requested");
            return Ok(());
        }
        if conn.state() != LrsState::Established {
            tracing::debug!(conn = %id, state = ?conn.state(), "already closing");
            return Ok(());
        }
        conn.ws.close_payload = payload.to_vec();
        conn.set_state(LrsState::WaitingToSendClose);
        self.callback_on_writable(id)
    }
}
