//! Raw socket role
//!
//! No framing at all: bytes read are handed to the protocol as `RawRx`,
//! writability as `RawWriteable`.

use super::{Readable, Role, Writable};
use crate::conn::{ConnId, LrsState, RoleTag};
use crate::error::Result;
use crate::protocol::Reason;
use crate::service::{RawRead, Worker};
use crate::transport::Interest;

#[derive(Debug, Default, Clone, Copy)]
pub struct RawRole;

pub static RAW: RawRole = RawRole;

impl Role for RawRole {
    fn name(&self) -> &'static str {
        "raw-skt"
    }

    fn on_readable(&self, w: &mut Worker, id: ConnId, revents: Interest) -> Option<Readable> {
        // an unsent partial write blocks new input until it is gone
        if w.conn(id).is_some_and(|c| c.pending_partial_write().is_some()) {
            if revents.contains(Interest::POLLOUT) && w.flush_partial(id).is_err() {
                w.close_free(id, "raw svc fail");
                return Some(Readable::HandledClose);
            }
            return Some(Readable::Handled);
        }

        if (revents & w.pollfd_events(id)).contains(Interest::POLLIN) {
            let cap = w.config().pt_serv_buf_size;
            match w.read_or_use_preamble(id, cap) {
                RawRead::Data(bytes) => {
                    let action = w.callback(id, Reason::RawRx(&bytes));
                    w.restore_serv_buf(bytes);
                    if action.is_close() {
                        w.close_free(id, "raw svc fail");
                        return Some(Readable::HandledClose);
                    }
                }
                RawRead::Nothing | RawRead::Again => {}
                RawRead::Failed => {
                    w.close_free(id, "raw svc fail");
                    return Some(Readable::HandledClose);
                }
            }
        }

        if !revents.contains(Interest::POLLOUT) {
            return Some(Readable::Handled);
        }

        // one shot
        if w.change_pollfd(id, Interest::POLLOUT, Interest::NONE).is_err() {
            w.close_free(id, "raw svc fail");
            return Some(Readable::HandledClose);
        }
        if w.callback(id, Reason::RawWriteable).is_close() {
            tracing::info!(conn = %id, "raw writeable callback closed");
            w.close_free(id, "raw svc fail");
            return Some(Readable::HandledClose);
        }
        Some(Readable::Handled)
    }

    fn on_writable(&self, _w: &mut Worker, _id: ConnId) -> Option<Writable> {
        Some(Writable::UserService)
    }

    fn writeable(&self, _w: &Worker, id: ConnId) -> Option<(ConnId, Reason<'static>)> {
        Some((id, Reason::RawWriteable))
    }

    fn detect_raw(&self, _w: &Worker, _id: ConnId, bytes: &[u8]) -> Option<bool> {
        Some(!bytes.is_empty() && !super::h1::looks_like_http(bytes))
    }

    fn adopt(&self, w: &mut Worker, id: ConnId) -> Option<Result<()>> {
        if let Some(conn) = w.conn_mut(id) {
            conn.role_transition(RoleTag::RawSocket, LrsState::Established, &RAW);
        }
        if let Err(err) = w.change_pollfd(id, Interest::NONE, Interest::POLLIN) {
            return Some(Err(err));
        }
        if w.callback(id, Reason::RawAdopt).is_close() {
            return Some(Err(crate::Error::Closed));
        }
        Some(Ok(()))
    }
}
