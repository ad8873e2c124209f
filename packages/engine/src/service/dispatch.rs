//! Readiness dispatch
//!
//! One event is routed to the role of the connection that owns the socket.
//! Writable handling is shared: the role gets first say, then the user
//! protocol is told it may write.

use std::time::Instant;

use tracing::{debug, info, trace};

use super::Worker;
use crate::conn::{ConnId, LrsState};
use crate::error::{Error, Result};
use crate::protocol::Reason;
use crate::role::{Readable, Upgrade, Writable, ROLES};
use crate::telemetry::ConnStats;
use crate::transport::{Interest, PollEvent};

impl Worker {
    /// Service one readiness event from the platform loop at time `now`.
    /// Returns the connection that handled it, if the socket is known.
    pub fn service_fd(&mut self, event: PollEvent, now: Instant) -> Option<ConnId> {
        self.set_now(now);
        self.periodic_checks(now);

        let Some(id) = self.conn_by_socket(event.socket) else {
            debug!(socket = %event.socket, "event for unknown socket");
            return None;
        };
        if let Some(pfd) = self.fds.get_mut(event.socket) {
            pfd.revents = event.revents;
        }
        self.service_conn(id, event.revents);
        if let Some(pfd) = self.fds.get_mut(event.socket) {
            pfd.revents = Interest::NONE;
        }
        Some(id)
    }

    /// Route `revents` to the connection's role
    pub(crate) fn service_conn(&mut self, id: ConnId, revents: Interest) -> Readable {
        let Some(conn) = self.conns.get(id) else {
            return Readable::Handled;
        };
        let ops = conn.ops;

        if revents.contains(Interest::POLLHUP) && !revents.contains(Interest::POLLIN) {
            debug!(conn = %id, "POLLHUP");
            if let Some(conn) = self.conns.get_mut(id) {
                conn.socket_is_permanently_unusable = true;
            }
            // a client still connecting reports why
            let connecting = self
                .conns
                .get(id)
                .is_some_and(|c| c.role.is_client() && c.state != LrsState::Established);
            if connecting {
                self.client_connection_error(id, "Peer hung up");
            }
            self.close_free(id, "POLLHUP");
            return Readable::HandledClose;
        }

        let outcome = ops.on_readable(self, id, revents).unwrap_or(Readable::Handled);
        trace!(conn = %id, role = ops.name(), ?outcome, "readable");
        match outcome {
            Readable::Handled => {}
            Readable::HandledClose => {
                if self.contains(id) {
                    self.close_free(id, "handled close");
                }
            }
            Readable::Die => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.socket_is_permanently_unusable = true;
                }
                if self.contains(id) {
                    self.close_free(id, "die");
                }
            }
            Readable::UserService => {
                if revents.contains(Interest::POLLOUT) && self.handle_pollout(id).is_err() {
                    info!(conn = %id, "writable service closed it");
                    if self.contains(id) {
                        self.close_free(id, "pollout");
                    }
                    return Readable::HandledClose;
                }
            }
        }
        outcome
    }

    /// Writable service for `id`: flush any partial write, then let the role
    /// and the user protocol write.
    ///
    /// # Errors
    ///
    /// Any error means the caller must close the connection.
    pub fn handle_pollout(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get(id).ok_or(Error::Closed)?;

        if conn.trunc.is_some() {
            self.flush_partial(id)?;
            return Ok(());
        }
        if conn.state == LrsState::FlushingBeforeClose {
            return Err(Error::Closed);
        }

        if conn.state != LrsState::IssueHttpBody {
            let ops = conn.ops;
            match ops.on_writable(self, id) {
                Some(Writable::BailOk) => return Ok(()),
                Some(Writable::BailDie) => return Err(Error::Closed),
                Some(Writable::UserService) | None => {}
            }
            if !self.contains(id) {
                return Err(Error::Closed);
            }
        }

        self.user_service(id)
    }

    /// A request head is complete on `id`. The role may take the
    /// connection over; otherwise the user protocol is told.
    ///
    /// # Errors
    ///
    /// `Error::Closed` once the connection has been closed, after a failed
    /// upgrade or on the user's request.
    pub(crate) fn request_head_complete(&mut self, id: ConnId) -> Result<()> {
        let ops = self.conns.get(id).ok_or(Error::Closed)?.ops;
        match ops.check_upgrade(self, id) {
            Some(Upgrade::Bail) => {
                info!(conn = %id, role = ops.name(), "upgrade failed");
                self.close_free(id, "upgrade bail");
                return Err(Error::Closed);
            }
            Some(Upgrade::Done) => {
                debug!(conn = %id, role = self.conns.get(id).map(|c| c.ops.name()), "upgraded");
                return Ok(());
            }
            Some(Upgrade::Continue) | None => {}
        }
        if self.callback(id, Reason::Http).is_close() {
            info!(conn = %id, "request head refused");
            self.close_free(id, "http refused");
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn user_service(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        conn.handling_pollout = true;
        let leave = std::mem::take(&mut conn.leave_pollout_active);
        if !leave {
            self.change_pollfd(id, Interest::POLLOUT, Interest::NONE)?;
        }

        let result = self.user_service_inner(id);

        if let Some(conn) = self.conns.get_mut(id) {
            conn.handling_pollout = false;
            if std::mem::take(&mut conn.leave_pollout_active) {
                self.change_pollfd(id, Interest::NONE, Interest::POLLOUT)?;
            }
        }
        result
    }

    fn user_service_inner(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get(id).ok_or(Error::Closed)?;

        // a client still handshaking has nothing for the user to write
        let client_setup = conn.role.is_client()
            && !conn.hdr_parsing_completed
            && !matches!(conn.state, LrsState::H2WaitingToSendHeaders | LrsState::IssueHttpBody);
        if client_setup {
            return Ok(());
        }

        if conn.h2n.is_some() && !conn.children.is_empty() {
            return self.service_stream_writables(id);
        }

        let (target, reason) = conn.ops.writeable(self, id).unwrap_or((id, Reason::HttpWriteable));
        if self.callback(target, reason).is_close() {
            info!(conn = %target, "writeable callback asked to close");
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Every stream that asked for it gets the writable service: its role
    /// first, then the user protocol
    fn service_stream_writables(&mut self, id: ConnId) -> Result<()> {
        let children = self.conns.get(id).map(|c| c.children.clone()).unwrap_or_default();
        for child in children {
            let Some(conn) = self.conns.get_mut(child) else {
                continue;
            };
            if !conn.h2.requested_pollout {
                continue;
            }
            conn.h2.requested_pollout = false;
            let ops = conn.ops;
            trace!(conn = %id, stream = %child, role = ops.name(), "stream writable");

            match ops.on_writable(self, child) {
                Some(Writable::BailOk) => continue,
                Some(Writable::BailDie) => {
                    self.close_free(child, "stream writable bail");
                    continue;
                }
                Some(Writable::UserService) | None => {}
            }
            let Some((target, reason)) = self
                .conns
                .get(child)
                .map(|c| c.ops.writeable(self, child).unwrap_or((child, Reason::HttpWriteable)))
            else {
                continue;
            };
            if self.callback(target, reason).is_close() {
                self.close_free(child, "stream writeable close");
            }
        }

        let more = self.conns.get(id).is_some_and(|c| {
            c.children
                .iter()
                .any(|child| self.conns.get(*child).is_some_and(|s| s.h2.requested_pollout))
        });
        if more {
            self.callback_on_writable(id)?;
        }
        Ok(())
    }

    /// Connections owed a synthesised POLLIN: header table waiters that got a
    /// table, anything a role reports as buffered above the socket, and
    /// connections with rxflow bytes that are no longer held back.
    pub fn service_flag_pending(&mut self) -> Vec<ConnId> {
        let mut pending = std::mem::take(&mut self.forced);
        for role in ROLES {
            if let Some(ids) = role.poll_pending_override(self) {
                pending.extend(ids);
            }
        }
        for id in self.conns.ids() {
            let buffered = self
                .conns
                .get(id)
                .is_some_and(|c| c.socket.is_some() && c.flow.has_buffer() && !c.flow.is_flowcontrolled());
            if buffered {
                pending.push(id);
            }
        }

        let mut seen = Vec::with_capacity(pending.len());
        for id in pending {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        for _ in &seen {
            ConnStats::bump(&self.stats.forced_pollin);
        }
        seen
    }

    /// Service every connection that has input the poll loop cannot see.
    /// Returns how many were serviced.
    pub fn service_pending(&mut self) -> usize {
        let pending = self.service_flag_pending();
        let mut serviced = 0;
        for id in pending {
            if !self.contains(id) {
                continue;
            }
            trace!(conn = %id, "forced POLLIN");
            self.service_conn(id, Interest::POLLIN);
            serviced += 1;
        }
        serviced
    }

    /// Wait the platform loop should use: zero when input is already
    /// buffered somewhere above the sockets, otherwise `timeout_ms`.
    #[must_use]
    pub fn service_adjust_timeout(&self, timeout_ms: u64) -> u64 {
        if !self.forced.is_empty() || self.ah_pool.any_rx_pending() {
            return 0;
        }
        let buffered = self.conns.ids().into_iter().any(|id| {
            self.conns.get(id).is_some_and(|c| {
                c.socket.as_ref().is_some_and(|s| s.pending() > 0)
                    || (c.flow.has_buffer() && !c.flow.is_flowcontrolled())
            })
        });
        if buffered {
            return 0;
        }
        timeout_ms
    }
}
