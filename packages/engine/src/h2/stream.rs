//! Server streams
//!
//! The frame codec reports each decoded request head on the network
//! connection. Once its read returns, the head is given to the stream it
//! names, opening the stream first if the peer just started it.

use std::sync::Arc;

use super::role::H2;
use super::StreamHead;
use crate::conn::{ConnId, Connection, LrsState, RoleTag};
use crate::headers::Attach;
use crate::service::Worker;
use crate::telemetry::ConnStats;

/// Hand every head reported on `nwsi` to its stream. Returns how many
/// heads were taken.
pub(crate) fn open_reported_streams(w: &mut Worker, nwsi: ConnId) -> usize {
    let heads = match w.conn_mut(nwsi).and_then(|c| c.h2n.as_mut()) {
        Some(h2n) => std::mem::take(&mut h2n.heads),
        None => return 0,
    };
    let taken = heads.len();
    for head in heads {
        let stream = match find_stream(w, nwsi, head.sid) {
            Some(stream) => stream,
            None => match open_stream(w, nwsi, head.sid) {
                Some(stream) => stream,
                None => continue,
            },
        };
        give_head(w, stream, head);
    }
    taken
}

fn find_stream(w: &Worker, nwsi: ConnId, sid: u32) -> Option<ConnId> {
    w.conn(nwsi)?
        .children()
        .iter()
        .copied()
        .find(|child| w.conn(*child).is_some_and(|c| c.h2().my_sid == sid))
}

fn open_stream(w: &mut Worker, nwsi: ConnId, sid: u32) -> Option<ConnId> {
    let vhost = Arc::clone(w.conn(nwsi)?.vhost());
    let id = w
        .conns
        .insert_with(|id| Connection::new(id, RoleTag::H2Server, LrsState::Established, &H2, vhost));
    ConnStats::bump(&w.stats().created);

    if let Some(conn) = w.conn_mut(id) {
        conn.parent = Some(nwsi);
        conn.h2.http2_substream = true;
        conn.h2.my_sid = sid;
    }
    if let Some(net) = w.conn_mut(nwsi) {
        net.children.push(id);
        if let Some(h2n) = net.h2n.as_mut() {
            h2n.note_peer_sid(sid);
        }
    }
    tracing::debug!(network = %nwsi, stream = %id, sid, "h2 stream opened");
    Some(id)
}

fn give_head(w: &mut Worker, stream: ConnId, head: StreamHead) {
    if let Attach::Queued = w.ah_attach(stream) {
        tracing::info!(conn = %stream, "ah get fail");
        w.close_free(stream, "ah get fail");
        return;
    }

    let stored = match w.header_table_of_mut(stream) {
        Some(ah) => head
            .headers
            .iter()
            .try_for_each(|(token, value)| ah.simple_create(*token, value)),
        None => return,
    };
    if let Err(err) = stored {
        tracing::info!(conn = %stream, error = %err, "stream head does not fit");
        w.close_free(stream, "ah overflow");
        return;
    }
    if let Some(conn) = w.conn_mut(stream) {
        conn.hdr_parsing_completed = true;
    }

    if w.request_head_complete(stream).is_ok() {
        w.ah_detach_forced(stream);
    }
}
