//! The "h2" role

use super::{drain, upgrade, write};
use crate::conn::{ConnId, LrsState, RoleTag, RxFlowReason};
use crate::error::Result;
use crate::protocol::Reason;
use crate::role::{Readable, Role, Upgrade, Writable, WriteProtocol};
use crate::service::Worker;
use crate::transport::Interest;

#[derive(Debug, Default, Clone, Copy)]
pub struct H2Role;

pub static H2: H2Role = H2Role;

impl Role for H2Role {
    fn name(&self) -> &'static str {
        "h2"
    }

    fn on_readable(&self, w: &mut Worker, id: ConnId, revents: Interest) -> Option<Readable> {
        Some(drain::handle_readable(w, id, revents))
    }

    fn on_writable(&self, w: &mut Worker, id: ConnId) -> Option<Writable> {
        let conn = w.conn(id)?;
        if conn.state() == LrsState::IssueHttpBody {
            return Some(Writable::UserService);
        }

        // protocol packets before any payload
        let carries_pps = (conn.h2().upgraded_to_http2 || conn.h2().client_h2_alpn)
            && conn.h2n.as_ref().is_some_and(|h2n| h2n.pps_pending() > 0);
        if !carries_pps {
            return Some(Writable::UserService);
        }

        tracing::debug!(conn = %id, "servicing pps");
        if write::pps_send(w, id).is_err() {
            if let Some(conn) = w.conn_mut(id) {
                conn.socket_is_permanently_unusable = true;
            }
            return Some(Writable::BailDie);
        }
        let more = w
            .conn(id)
            .and_then(|c| c.h2n.as_ref())
            .is_some_and(|h2n| h2n.pps_pending() > 0);
        if more {
            return Some(Writable::BailOk);
        }

        // resume receiving now the queue is empty; POLLOUT stays armed
        if let Some(conn) = w.conn_mut(id) {
            conn.flow.set(RxFlowReason::H2PpsPending, true);
        }
        w.sync_rx_flow(id);
        Some(Writable::BailOk)
    }

    fn poll_pending_override(&self, w: &mut Worker) -> Option<Vec<ConnId>> {
        let owners: Vec<ConnId> = w.header_table_owners_with_rx();
        let forced = owners
            .into_iter()
            .filter(|&owner| {
                w.conn(owner).is_some_and(|c| !c.hdr_parsing_completed())
                    && w.pollfd_events(owner).contains(Interest::POLLIN)
            })
            .collect();
        Some(forced)
    }

    fn writeable(&self, w: &Worker, id: ConnId) -> Option<(ConnId, Reason<'static>)> {
        if w.conn(id)?.role().is_client() {
            return Some((w.client_wsi_effective(id), Reason::ClientHttpWriteable));
        }
        Some((id, Reason::HttpWriteable))
    }

    /// A socket whose transport already negotiated h2 becomes a server
    /// network connection. The codec answers the client preface.
    fn adopt(&self, w: &mut Worker, id: ConnId) -> Option<Result<()>> {
        if let Some(conn) = w.conn_mut(id) {
            conn.role_transition(RoleTag::H2Server, LrsState::Established, &H2);
            conn.configure_h2_network(true);
        }
        Some(w.change_pollfd(id, Interest::NONE, Interest::POLLIN))
    }

    fn frame_outbound_write(&self, w: &mut Worker, id: ConnId, buf: &[u8], wp: WriteProtocol) -> Option<Result<usize>> {
        Some(write::write_role_protocol(w, id, buf, wp))
    }

    fn check_upgrade(&self, w: &mut Worker, id: ConnId) -> Option<Upgrade> {
        Some(upgrade::check_upgrade(w, id))
    }
}
