//! Readable-event drain for HTTP/2 capable and websocket connections
//!
//! Bytes can sit in three places: the leftover rxflow buffer, the network
//! connection's receive scratch, or still in the socket. They are taken in
//! exactly that order, one source per pass.

use super::stream;
use crate::conn::{ConnId, LrsState};
use crate::protocol::ParseOutcome;
use crate::role::Readable;
use crate::service::Worker;
use crate::transport::{Interest, ReadStatus};

/// Where the bytes of this pass came from. Owned buffers are moved out of
/// the connection for the pass and put back afterwards.
enum Source {
    Flow { buf: Box<[u8]>, pos: usize },
    Scratch { buf: Box<[u8]>, start: usize, len: usize },
    Serv { buf: Vec<u8>, len: usize },
    Header(Vec<u8>),
    Empty,
}

impl Source {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Flow { buf, pos } => &buf[*pos..],
            Self::Scratch { buf, start, len } => &buf[*start..*start + *len],
            Self::Serv { buf, len } => &buf[..*len],
            Self::Header(bytes) => bytes,
            Self::Empty => &[],
        }
    }
}

pub(crate) fn handle_readable(w: &mut Worker, id: ConnId, revents: Interest) -> Readable {
    let Some(state) = w.conn(id).map(|c| c.state()) else {
        return Readable::Handled;
    };
    tracing::debug!(conn = %id, ?state, pollout = revents.contains(Interest::POLLOUT), "h2 readable");

    if state == LrsState::WaitingConnect {
        if revents.contains(Interest::POLLOUT) && w.handle_pollout(id).is_err() {
            tracing::debug!(conn = %id, "POLLOUT event closed it");
            return Readable::HandledClose;
        }
        if w.client_socket_service(id, revents, None).is_err() {
            return Readable::Die;
        }
        return Readable::Handled;
    }

    // something asked for a writable callback
    if revents.contains(Interest::POLLOUT) && state.can_handle_pollout() && w.handle_pollout(id).is_err() {
        if let Some(conn) = w.conn_mut(id) {
            if conn.state() == LrsState::ReturnedClose {
                conn.set_state(LrsState::FlushingBeforeClose);
            }
            conn.socket_is_permanently_unusable = true;
        }
        return Readable::HandledClose;
    }

    drain(w, id, revents)
}

fn drain(w: &mut Worker, id: ConnId, revents: Interest) -> Readable {
    if let Some(conn) = w.conn_mut(id) {
        if conn.state().is_closing() {
            // only control packets matter now
            conn.flow.force_allow();
            conn.ws.tx_draining_ext = false;
        }
    }
    w.sync_rx_flow(id);

    let Some(conn) = w.conn(id) else {
        return Readable::Handled;
    };
    if conn.is_flowcontrolled() {
        return Readable::Handled;
    }
    if conn.h2().http2_substream || conn.h2().upgraded_to_http2 {
        let nwsi = w.network_id(id);
        if w.conn(nwsi).is_some_and(|n| n.pending_partial_write().is_some()) {
            // inbound data may want to send, which must wait for the partial
            return Readable::Handled;
        }
    }

    let mut draining_flow = false;
    let mut source = match take_buffered(w, id, &mut draining_flow) {
        Some(source) => source,
        None => {
            if !(revents & w.pollfd_events(id)).contains(Interest::POLLIN) {
                return Readable::Handled;
            }
            Source::Empty
        }
    };
    let mut need_read = matches!(source, Source::Empty);
    let mut pending = 0;

    loop {
        if need_read {
            source = match read_source(w, id, pending) {
                Ok(source) => source,
                Err(outcome) => return outcome,
            };
        }

        if let Some(outcome) = notify_client_body(w, id, &mut source) {
            return outcome;
        }
        let source_now = std::mem::replace(&mut source, Source::Empty);

        let outcome = if source_now.bytes().is_empty() {
            ParseOutcome::Consumed(0)
        } else {
            feed(w, id, source_now.bytes())
        };
        match outcome {
            ParseOutcome::Closed => {
                put_back(w, id, source_now, usize::MAX);
                w.close_free(id, "read bail");
                return Readable::Handled;
            }
            ParseOutcome::Consumed(n) => put_back(w, id, source_now, n),
        }
        w.apply_user_requests(id);
        stream::open_reported_streams(w, id);
        interpret_new_heads(w, id);

        let Some(conn) = w.conn(id) else {
            return Readable::HandledClose;
        };
        if conn.header_table().is_some() && !conn.h2().client_h2_alpn {
            tracing::debug!(conn = %id, "detaching ah");
            w.ah_detach_forced(id);
        }

        pending = w.conn(id).and_then(|c| c.socket.as_ref()).map_or(0, |s| s.pending());
        if pending > 0 {
            pending = pending.min(w.config().pt_serv_buf_size);
            need_read = true;
            continue;
        }
        break;
    }

    if draining_flow {
        let drained = w.conn(id).is_some_and(|c| c.flow().is_drained());
        if drained {
            tracing::debug!(conn = %id, "flow buf drained");
            if let Some(conn) = w.conn_mut(id) {
                conn.flow.free_buffer();
            }
            w.apply_rx_flow(id);
        }
    }
    Readable::Handled
}

/// Leftover rxflow bytes first, then unparsed h2 scratch
fn take_buffered(w: &mut Worker, id: ConnId, draining_flow: &mut bool) -> Option<Source> {
    let conn = w.conn_mut(id)?;
    if let Some((buf, pos)) = conn.flow.take_buffer() {
        tracing::debug!(conn = %id, len = buf.len() - pos, "draining rxflow");
        *draining_flow = true;
        return Some(Source::Flow { buf, pos });
    }

    if !conn.h2.upgraded_to_http2 {
        return None;
    }
    let h2n = conn.h2n.as_mut()?;
    if h2n.rx_scratch_len == 0 {
        return None;
    }
    let buf = h2n.rx_scratch.take()?;
    let (start, len) = (h2n.rx_scratch_pos, h2n.rx_scratch_len);
    tracing::debug!(conn = %id, pos = start, len, "h2 rx scratch");
    h2n.rx_scratch_len = 0;
    Some(Source::Scratch { buf, start, len })
}

fn read_source(w: &mut Worker, id: ConnId, pending: usize) -> Result<Source, Readable> {
    let Some(conn) = w.conn(id) else {
        return Err(Readable::Handled);
    };
    if conn.is_flowcontrolled() {
        tracing::debug!(conn = %id, bitmap = conn.flow().bitmap(), "should be rxflow");
        return Err(Readable::Handled);
    }

    if let Some(ah) = w.header_table_of(id) {
        if ah.has_rx_pending() {
            tracing::debug!(conn = %id, len = ah.rx_pending().len(), "inherited ah rx");
            return Ok(Source::Header(ah.rx_pending().to_vec()));
        }
    }

    let conn = w.conn(id).ok_or(Readable::Handled)?;
    let connecting_client = conn.role().is_client()
        && !matches!(conn.state(), LrsState::Established | LrsState::H2WaitingToSendHeaders);
    if connecting_client || conn.socket.is_none() {
        return Ok(Source::Empty);
    }

    if conn.h2().upgraded_to_http2 {
        let size = conn.vhost().config().h2_rx_scratch_size;
        let conn = w.conn_mut(id).ok_or(Readable::Handled)?;
        let h2n = conn.h2n.get_or_insert_with(Box::default);
        let mut buf = h2n
            .rx_scratch
            .take()
            .unwrap_or_else(|| vec![0; size].into_boxed_slice());
        let cap = if pending > 0 { pending.min(buf.len()) } else { buf.len() };
        let status = conn.socket.as_mut().map_or(ReadStatus::Error, |s| s.read(&mut buf[..cap]));
        return match status {
            ReadStatus::Data(n) if n > 0 => Ok(Source::Scratch { buf, start: 0, len: n }),
            other => {
                if let Some(h2n) = conn.h2n.as_mut() {
                    h2n.rx_scratch = Some(buf);
                }
                Err(read_failure(id, other))
            }
        };
    }

    let mut buf = w.take_serv_buf();
    let cap = if pending > 0 { pending.min(buf.len()) } else { buf.len() };
    let status = w
        .conn_mut(id)
        .and_then(|c| c.socket.as_mut())
        .map_or(ReadStatus::Error, |s| s.read(&mut buf[..cap]));
    match status {
        ReadStatus::Data(n) if n > 0 => Ok(Source::Serv { buf, len: n }),
        other => {
            w.restore_serv_buf(buf);
            Err(read_failure(id, other))
        }
    }
}

fn read_failure(id: ConnId, status: ReadStatus) -> Readable {
    match status {
        ReadStatus::MoreService => {
            tracing::debug!(conn = %id, "transport wants more service");
            Readable::Handled
        }
        ReadStatus::Error => {
            tracing::debug!(conn = %id, "read error");
            Readable::HandledClose
        }
        ReadStatus::Closed | ReadStatus::Data(_) => {
            tracing::debug!(conn = %id, "zero length read");
            Readable::HandledClose
        }
    }
}

/// An established http client takes body bytes through the client engine,
/// which frames them for the user. Whatever this pass obtained is kept for
/// that read.
fn notify_client_body(w: &mut Worker, id: ConnId, source: &mut Source) -> Option<Readable> {
    let conn = w.conn(id)?;
    if !(conn.role().is_http_client() && conn.hdr_parsing_completed() && !conn.told_user_closed) {
        return None;
    }
    if conn.state() != LrsState::Established {
        return None;
    }

    let source = std::mem::replace(source, Source::Empty);
    put_back(w, id, source, 0);

    if let Err(err) = w.deliver_client_rx(id) {
        tracing::info!(conn = %id, error = %err, "client rx closed it");
        if w.contains(id) {
            w.close_free(id, "client rx");
        }
        return Some(Readable::HandledClose);
    }
    Some(Readable::Handled)
}

/// Client streams whose response head the codec has just completed
fn interpret_new_heads(w: &mut Worker, id: ConnId) {
    let mut ids = vec![id];
    if let Some(conn) = w.conn(id) {
        ids.extend_from_slice(conn.children());
    }
    for sid in ids {
        let ready = w.conn(sid).is_some_and(|c| {
            c.role().is_client()
                && c.hdr_parsing_completed()
                && matches!(c.state(), LrsState::H2WaitingToSendHeaders | LrsState::WaitingServerReply)
        });
        if ready {
            if let Err(err) = w.interpret_server_response(sid) {
                tracing::debug!(conn = %sid, error = %err, "h2 response head refused");
            }
        }
    }
}

fn feed(w: &mut Worker, id: ConnId, bytes: &[u8]) -> ParseOutcome {
    let h2_path = w
        .conn(id)
        .is_some_and(|c| c.role().is_h2() && c.state() != LrsState::Body);
    if h2_path {
        w.codec_read_h2(id, bytes)
    } else {
        w.codec_read_h1(id, bytes)
    }
}

/// Return the pass's buffer to where it lives, keeping the unconsumed tail.
fn put_back(w: &mut Worker, id: ConnId, source: Source, used: usize) {
    let total = source.bytes().len();
    let used = used.min(total);
    let Some(conn) = w.conn_mut(id) else {
        if let Source::Serv { buf, .. } = source {
            w.restore_serv_buf(buf);
        }
        return;
    };

    match source {
        Source::Flow { buf, pos } => conn.flow.restore_buffer(buf, pos + used),
        Source::Scratch { buf, start, len } => {
            let h2n = conn.h2n.get_or_insert_with(Box::default);
            if used < len {
                h2n.rx_scratch_pos = start + used;
                h2n.rx_scratch_len = len - used;
            }
            h2n.rx_scratch = Some(buf);
        }
        Source::Serv { buf, len } => {
            if used < len {
                conn.flow.cache(&buf[used..len]);
            }
            w.restore_serv_buf(buf);
        }
        Source::Header(bytes) => {
            if used < bytes.len() {
                conn.flow.cache(&bytes[used..]);
            }
            if let Some(ah) = w.header_table_of_mut(id) {
                ah.advance_rx(bytes.len());
            }
        }
        Source::Empty => {}
    }
}
