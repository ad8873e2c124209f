//! HTTP/1 role
//!
//! Server connections read request heads through the attached header table
//! and hand body bytes straight to the tokenizer. Client connections are
//! driven by the client engine until they reach Established.

use super::{Readable, Role, Upgrade, Writable, ROLES, WS};
use crate::conn::{ConnId, LrsState, RoleTag};
use crate::headers::{Attach, HdrToken, HeaderTable};
use crate::protocol::{ParseOutcome, Reason};
use crate::service::{RawRead, Worker};
use crate::telemetry::ConnStats;
use crate::transport::Interest;

#[derive(Debug, Default, Clone, Copy)]
pub struct H1Role;

pub static H1: H1Role = H1Role;

impl Role for H1Role {
    fn name(&self) -> &'static str {
        "h1"
    }

    fn on_readable(&self, w: &mut Worker, id: ConnId, revents: Interest) -> Option<Readable> {
        let (role, state) = w.conn(id).map(|c| (c.role(), c.state()))?;

        if !role.is_client() {
            return Some(server_socket_service(w, id, revents));
        }

        if state == LrsState::Established {
            return Some(client_established(w, id, revents));
        }

        if revents.contains(Interest::POLLOUT) && w.handle_pollout(id).is_err() {
            tracing::debug!(conn = %id, "POLLOUT event closed it");
            w.close_free(id, "POLLOUT closed");
            return Some(Readable::HandledClose);
        }

        if let Err(err) = w.client_socket_service(id, revents, None) {
            tracing::debug!(conn = %id, error = %err, "client socket service failed");
            return Some(Readable::Die);
        }
        Some(Readable::Handled)
    }

    fn on_writable(&self, w: &mut Worker, id: ConnId) -> Option<Writable> {
        let conn = w.conn(id)?;
        if conn.state() == LrsState::IssueHttpBody || conn.role().is_client() {
            return Some(Writable::UserService);
        }
        Some(Writable::BailOk)
    }

    fn writeable(&self, w: &Worker, id: ConnId) -> Option<(ConnId, Reason<'static>)> {
        if w.conn(id)?.role().is_client() {
            return Some((w.client_wsi_effective(id), Reason::ClientHttpWriteable));
        }
        Some((id, Reason::HttpWriteable))
    }

    fn adopt(&self, w: &mut Worker, id: ConnId) -> Option<crate::Result<()>> {
        if let Some(conn) = w.conn_mut(id) {
            conn.role_transition(RoleTag::H1Server, LrsState::Headers, &H1);
        }
        Some(w.change_pollfd(id, Interest::NONE, Interest::POLLIN))
    }

    /// `Connection: Upgrade` plus `Upgrade: websocket` turns a server
    /// connection into a websocket
    fn check_upgrade(&self, w: &mut Worker, id: ConnId) -> Option<Upgrade> {
        if w.conn(id)?.role() != RoleTag::H1Server {
            return None;
        }
        if !w.header_table_of(id).is_some_and(wants_websocket) {
            return Some(Upgrade::Continue);
        }

        ConnStats::bump(&w.stats().ws_upg);
        if let Err(err) = w.process_ws_upgrade(id) {
            tracing::info!(conn = %id, error = %err, "ws upgrade processing failed");
            return Some(Upgrade::Bail);
        }
        if let Some(conn) = w.conn_mut(id) {
            conn.role_transition(RoleTag::Ws1Server, LrsState::Established, &WS);
        }
        w.clear_timeout(id);
        tracing::info!(conn = %id, "upgraded h1 to ws");
        Some(Upgrade::Done)
    }
}

fn wants_websocket(ah: &HeaderTable) -> bool {
    let upgrade = ah
        .get(HdrToken::Upgrade)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    let connection = ah
        .get(HdrToken::Connection)
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    upgrade && connection
}

/// Response body is waiting on an established client: hand it to the
/// client engine. A writable event either services the next queued
/// transaction or goes to the user.
fn client_established(w: &mut Worker, id: ConnId, revents: Interest) -> Readable {
    if w.rx_ready(id, revents) {
        if let Err(err) = w.deliver_client_rx(id) {
            tracing::info!(conn = %id, error = %err, "client rx closed it");
            if w.contains(id) {
                w.close_free(id, "client rx");
            }
            return Readable::HandledClose;
        }
        if !w.contains(id) {
            return Readable::HandledClose;
        }
    }
    if !revents.contains(Interest::POLLOUT) {
        return Readable::Handled;
    }
    let queued = w
        .conn(id)
        .is_some_and(|c| c.client.keepalive_active && !c.client.txn_queue.is_empty());
    if queued {
        if let Err(err) = w.client_socket_service(id, revents, None) {
            tracing::debug!(conn = %id, error = %err, "queued transaction failed");
            return Readable::HandledClose;
        }
        return Readable::Handled;
    }
    Readable::UserService
}

fn server_socket_service(w: &mut Worker, id: ConnId, revents: Interest) -> Readable {
    let Some(state) = w.conn(id).map(|c| c.state()) else {
        return Readable::Handled;
    };
    if !(revents & w.pollfd_events(id)).contains(Interest::POLLIN) {
        return try_pollout(w, id, revents);
    }

    match state {
        LrsState::Established | LrsState::Headers => read_headers(w, id, revents),
        LrsState::FlushingBeforeClose => try_pollout(w, id, revents),
        _ => read_body(w, id, revents),
    }
}

/// Feed the header table's rx through the tokenizer
fn read_headers(w: &mut Worker, id: ConnId, revents: Interest) -> Readable {
    if w.conn(id).is_some_and(|c| c.header_table().is_none()) {
        if let Attach::Queued = w.ah_attach(id) {
            tracing::info!(conn = %id, "ah get fail");
            return try_pollout(w, id, revents);
        }
    }

    let pending_in_ah = w.header_table_of(id).is_some_and(|ah| ah.has_rx_pending());
    if !pending_in_ah {
        let cap = w.config().ah_rx_size;
        match w.read_or_use_preamble(id, cap) {
            RawRead::Data(bytes) => {
                if let Some(ah) = w.header_table_of_mut(id) {
                    ah.push_rx(&bytes);
                }
                w.restore_serv_buf(bytes);
            }
            RawRead::Again => return try_pollout(w, id, revents),
            RawRead::Nothing => {
                tracing::info!(conn = %id, "read 0 len");
                if w.change_pollfd(id, Interest::POLLIN, Interest::NONE).is_err() {
                    return fail(w, id);
                }
                return try_pollout(w, id, revents);
            }
            RawRead::Failed => return fail(w, id),
        }
    }

    let rx = match w.header_table_of(id) {
        Some(ah) => ah.rx_pending().to_vec(),
        None => return Readable::Handled,
    };

    let fresh = w.conn(id).is_some_and(|c| {
        c.state() == LrsState::Headers && !c.hdr_parsing_completed() && c.vhost().config().fallback_to_raw
    });
    if fresh {
        if let Some(role) = ROLES.iter().copied().find(|r| r.detect_raw(w, id, &rx) == Some(true)) {
            return bind_detected_role(w, id, role, &rx);
        }
    }

    match w.codec_read_h1(id, &rx) {
        ParseOutcome::Closed => {
            w.close_free(id, "read bail");
            return Readable::HandledClose;
        }
        ParseOutcome::Consumed(n) => {
            if let Some(ah) = w.header_table_of_mut(id) {
                ah.advance_rx(n);
            }
        }
    }
    w.apply_user_requests(id);

    // headers are in: hand the table back, keeping anything past them
    if w.conn(id).is_some_and(|c| c.hdr_parsing_completed()) {
        let rest = w.header_table_of(id).map(|ah| ah.rx_pending().to_vec()).unwrap_or_default();
        if !rest.is_empty() {
            if let Some(conn) = w.conn_mut(id) {
                conn.flow.cache(&rest);
            }
        }
        if w.request_head_complete(id).is_err() {
            return Readable::HandledClose;
        }
        w.ah_detach_forced(id);
    }
    Readable::Handled
}

fn read_body(w: &mut Worker, id: ConnId, revents: Interest) -> Readable {
    let cap = w.config().pt_serv_buf_size;
    let bytes = match w.read_or_use_preamble(id, cap) {
        RawRead::Data(bytes) => bytes,
        RawRead::Nothing | RawRead::Again => return try_pollout(w, id, revents),
        RawRead::Failed => return fail(w, id),
    };

    let outcome = w.codec_read_h1(id, &bytes);
    let result = match outcome {
        ParseOutcome::Closed => {
            w.close_free(id, "read bail");
            Readable::HandledClose
        }
        ParseOutcome::Consumed(n) if n < bytes.len() => {
            let stashed = w.conn_mut(id).is_some_and(|c| c.flow.cache(&bytes[n..]));
            if stashed {
                tracing::debug!(conn = %id, stashed = bytes.len() - n, "preamble stashed");
                Readable::Handled
            } else {
                tracing::error!(conn = %id, discarding = bytes.len() - n, "preamble already pending");
                fail(w, id)
            }
        }
        ParseOutcome::Consumed(_) => Readable::Handled,
    };
    w.restore_serv_buf(bytes);
    if result == Readable::Handled {
        w.apply_user_requests(id);
    }
    result
}

fn bind_detected_role(w: &mut Worker, id: ConnId, role: &'static dyn super::Role, rx: &[u8]) -> Readable {
    tracing::info!(conn = %id, role = role.name(), "first bytes are not http, rebinding");
    w.ah_detach_forced(id);
    match role.adopt(w, id) {
        Some(Err(err)) => {
            tracing::info!(conn = %id, error = %err, "rebind failed");
            return fail(w, id);
        }
        Some(Ok(())) | None => {}
    }
    if !w.contains(id) {
        return Readable::HandledClose;
    }
    if w.callback(id, Reason::RawRx(rx)).is_close() {
        return fail(w, id);
    }
    Readable::Handled
}

fn try_pollout(w: &mut Worker, id: ConnId, revents: Interest) -> Readable {
    if !revents.contains(Interest::POLLOUT) {
        return Readable::Handled;
    }

    // one shot
    if w.change_pollfd(id, Interest::POLLOUT, Interest::NONE).is_err() {
        return fail(w, id);
    }

    if !w.conn(id).is_some_and(|c| c.hdr_parsing_completed()) {
        return Readable::Handled;
    }

    if w.callback(id, Reason::HttpWriteable).is_close() {
        tracing::info!(conn = %id, "writeable_fail");
        return fail(w, id);
    }
    Readable::Handled
}

fn fail(w: &mut Worker, id: ConnId) -> Readable {
    w.close_free(id, "server socket svc fail");
    Readable::HandledClose
}

/// Whether `bytes` can still be the start of an HTTP request line
#[must_use]
pub fn looks_like_http(bytes: &[u8]) -> bool {
    let method = bytes.split(|b| *b == b' ').next().unwrap_or_default();
    !method.is_empty() && method.len() <= 16 && method.iter().all(u8::is_ascii_uppercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines_look_like_http() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"PRI * HTTP/2.0"));
        assert!(looks_like_http(b"OPTI"));
        assert!(!looks_like_http(b"\x16\x03\x01"));
        assert!(!looks_like_http(b"hello world"));
        assert!(!looks_like_http(b""));
    }

    #[test]
    fn websocket_upgrade_needs_both_headers() {
        let mut ah = HeaderTable::new(256, 16);
        ah.simple_create(HdrToken::Upgrade, "WebSocket").expect("upgrade");
        assert!(!wants_websocket(&ah));
        ah.simple_create(HdrToken::Connection, "keep-alive, Upgrade").expect("connection");
        assert!(wants_websocket(&ah));
        ah.simple_create(HdrToken::Upgrade, "h2c").expect("upgrade");
        assert!(!wants_websocket(&ah));
    }
}
