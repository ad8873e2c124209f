//! Sub-process stdio pass-through role
//!
//! Each stdio pipe of a child process is its own connection whose parent is
//! the HTTP connection the child serves. Readiness is forwarded to the
//! parent's protocol callback; the periodic tick reaps dead children.

use std::time::Instant;

use super::{Readable, Role, Writable};
use crate::conn::ConnId;
use crate::service::Worker;
use crate::transport::Interest;

/// Which stdio pipe a cgi connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CgiChannel {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl CgiChannel {
    pub const ALL: [Self; 3] = [Self::Stdin, Self::Stdout, Self::Stderr];

    /// The readiness this channel waits for
    #[must_use]
    pub fn interest(self) -> Interest {
        match self {
            Self::Stdin => Interest::POLLOUT,
            Self::Stdout | Self::Stderr => Interest::POLLIN,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CgiRole;

pub static CGI: CgiRole = CgiRole;

impl Role for CgiRole {
    fn name(&self) -> &'static str {
        "cgi"
    }

    fn on_readable(&self, w: &mut Worker, id: ConnId, revents: Interest) -> Option<Readable> {
        let (channel, parent) = match w.conn(id) {
            Some(conn) => (conn.cgi_channel?, conn.parent?),
            None => return Some(Readable::Handled),
        };

        let ready = revents & w.pollfd_events(id);
        if !ready.contains(channel.interest()) {
            return Some(Readable::Handled);
        }

        if channel == CgiChannel::Stdin && w.change_pollfd(id, Interest::POLLOUT, Interest::NONE).is_err() {
            tracing::info!(conn = %id, "cgi stdin pollfd change failed");
            return Some(Readable::Die);
        }

        tracing::debug!(conn = %id, parent = %parent, ?channel, "cgi channel ready");
        if w.cgi_notify(parent, channel, id).is_close() {
            return Some(Readable::HandledClose);
        }
        Some(Readable::Handled)
    }

    /// A channel's writability goes to the parent, never to the channel
    fn on_writable(&self, w: &mut Worker, id: ConnId) -> Option<Writable> {
        let conn = w.conn(id)?;
        let (Some(channel), Some(parent)) = (conn.cgi_channel, conn.parent) else {
            return Some(Writable::BailOk);
        };
        // one shot, as on readiness
        if w.change_pollfd(id, Interest::POLLOUT, Interest::NONE).is_err() {
            return Some(Writable::BailDie);
        }
        tracing::debug!(conn = %id, parent = %parent, ?channel, "cgi channel writable");
        if w.cgi_notify(parent, channel, id).is_close() {
            return Some(Writable::BailDie);
        }
        Some(Writable::BailOk)
    }

    fn on_periodic(&self, w: &mut Worker, _now: Instant) -> Option<usize> {
        Some(w.reap_cgi_children())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_waits_for_writability() {
        assert_eq!(CgiChannel::Stdin.interest(), Interest::POLLOUT);
        assert_eq!(CgiChannel::Stderr.interest(), Interest::POLLIN);
        assert_eq!(CgiChannel::ALL.len(), 3);
    }
}
