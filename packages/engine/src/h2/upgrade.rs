//! Websocket over an HTTP/2 stream (extended CONNECT)

use crate::conn::{ConnId, LrsState, RoleTag};
use crate::headers::HdrToken;
use crate::role::{Upgrade, WS};
use crate::service::Worker;
use crate::telemetry::ConnStats;

pub(crate) fn check_upgrade(w: &mut Worker, id: ConnId) -> Upgrade {
    let Some(conn) = w.conn(id) else {
        return Upgrade::Continue;
    };
    if !conn.vhost().config().enable_connect_protocol || !conn.h2().http2_substream {
        return Upgrade::Continue;
    }

    let Some(ah) = w.header_table_of(id) else {
        return Upgrade::Continue;
    };
    if ah.get(HdrToken::ColonMethod) != Some("CONNECT") || ah.get(HdrToken::ColonProtocol) != Some("websocket") {
        return Upgrade::Continue;
    }

    let nwsi = w.network_id(id);
    ConnStats::bump(&w.stats().ws_upg);
    tracing::info!(conn = %id, "upgrade h2 to ws");

    if let Some(conn) = w.conn_mut(id) {
        conn.h2.stream_carries_ws = true;
    }
    let count = match w.conn_mut(nwsi).and_then(|c| c.h2n.as_mut()) {
        Some(h2n) => {
            h2n.ws_over_h2_count += 1;
            h2n.ws_over_h2_count
        }
        None => 0,
    };

    if let Err(err) = w.process_ws_upgrade(id) {
        tracing::info!(conn = %id, error = %err, "ws upgrade processing failed");
        return Upgrade::Bail;
    }

    if count == 1 {
        w.clear_timeout(nwsi);
    }
    w.clear_timeout(id);
    if let Some(conn) = w.conn_mut(id) {
        conn.role_transition(RoleTag::Ws2Server, LrsState::Established, &WS);
    }
    tracing::info!(conn = %id, "upgraded h2 to ws");
    Upgrade::Done
}
