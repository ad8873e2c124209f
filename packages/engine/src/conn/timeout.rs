//! Pending timeouts
//!
//! Every connection carries at most one pending timeout. The periodic sweep
//! closes whatever has passed its deadline.

use std::time::{Duration, Instant};

use hashbrown::HashMap;

use super::ConnId;

/// What a connection is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PendingTimeout {
    AwaitingConnectResponse,
    AwaitingProxyResponse,
    AwaitingSocksGreetingReply,
    AwaitingSocksAuthReply,
    AwaitingSocksConnectReply,
    SentClientHandshake,
    AwaitingClientHsSend,
    ClientIssuePayload,
    AwaitingServerResponse,
    AwaitingSslHandshake,
    ClientConnIdle,
    CloseAck,
    HttpKeepaliveIdle,
    /// A keepalive PING is due on the next writable event
    WsPongCheckSendPing,
    /// A keepalive PING is out, waiting for its PONG
    WsPongCheckGetPong,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    reason: PendingTimeout,
    set_at: Instant,
    limit: Duration,
}

/// Timeout registrations of one worker
#[derive(Debug, Default)]
pub struct TimeoutList {
    entries: HashMap<ConnId, Entry>,
}

impl TimeoutList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing timeout of `conn`.
    pub fn set(&mut self, conn: ConnId, reason: PendingTimeout, secs: u64, now: Instant) {
        self.entries.insert(
            conn,
            Entry {
                reason,
                set_at: now,
                limit: Duration::from_secs(secs),
            },
        );
    }

    pub fn clear(&mut self, conn: ConnId) -> Option<PendingTimeout> {
        self.entries.remove(&conn).map(|e| e.reason)
    }

    #[must_use]
    pub fn get(&self, conn: ConnId) -> Option<PendingTimeout> {
        self.entries.get(&conn).map(|e| e.reason)
    }

    /// Connections whose deadline has passed, oldest registration first
    #[must_use]
    pub fn expired(&self, now: Instant) -> Vec<(ConnId, PendingTimeout)> {
        let mut hits: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.set_at) > e.limit)
            .map(|(id, e)| (*id, e.reason, e.set_at))
            .collect();
        hits.sort_by_key(|(_, _, set_at)| *set_at);
        hits.into_iter().map(|(id, reason, _)| (id, reason)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
