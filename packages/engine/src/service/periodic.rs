//! Once-a-second housekeeping: timeouts, held header tables, role ticks

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::Worker;
use crate::conn::{ConnId, PendingTimeout, RoleTag};
use crate::protocol::Reason;
use crate::role::ROLES;
use crate::telemetry::ConnStats;

/// Grace on top of the configured idle time before a header table counts
/// as leaked
const AH_HELD_GRACE_SECS: u64 = 360;

impl Worker {
    /// Run the periodic sweep if a second has passed since the last one.
    /// Returns how many connections it acted on.
    pub fn periodic_checks(&mut self, now: Instant) -> usize {
        self.set_now(now);
        if let Some(last) = self.last_periodic {
            if now.saturating_duration_since(last) < Duration::from_secs(1) {
                return 0;
            }
        }
        self.last_periodic = Some(now);

        let mut acted = self.expire_timeouts(now);
        acted += self.close_held_header_tables(now);
        for role in ROLES {
            acted += role.on_periodic(self, now).unwrap_or(0);
        }
        acted
    }

    fn expire_timeouts(&mut self, now: Instant) -> usize {
        let expired = self.timeouts.expired(now);
        for (id, reason) in &expired {
            ConnStats::bump(&self.stats.timeouts);
            warn!(conn = %id, ?reason, "timed out");
            if *reason == PendingTimeout::AwaitingSslHandshake {
                self.client_connection_error(*id, "Timed out waiting SSL");
            }
            self.timeouts.clear(*id);
            self.close_free(*id, "timeout");
        }
        expired.len()
    }

    /// A table held far past its idle time means its owner is stuck
    fn close_held_header_tables(&mut self, now: Instant) -> usize {
        let limit = Duration::from_secs(self.config.ah_idle_secs + AH_HELD_GRACE_SECS);
        let held: Vec<(ConnId, Vec<_>)> = self
            .ah_pool
            .assigned()
            .filter(|(_, _, at)| now.saturating_duration_since(*at) > limit)
            .map(|(ah, owner, _)| (owner, self.ah_pool.get(ah).map(|t| t.dump()).unwrap_or_default()))
            .collect();

        for (owner, dump) in &held {
            warn!(conn = %owner, headers = ?dump, "header table held too long");
            self.close_free(*owner, "ah excessive hold");
        }
        held.len()
    }

    /// Collect terminated children and close their stdio channels. Returns
    /// how many parents were told.
    pub fn reap_cgi_children(&mut self) -> usize {
        let Some(reaper) = self.reaper.as_mut() else {
            return 0;
        };
        let parents = reaper.reap_terminated();
        for parent in &parents {
            if !self.contains(*parent) {
                debug!(conn = %parent, "reaped child of a closed connection");
                continue;
            }
            info!(conn = %parent, "cgi child terminated");
            let channels: Vec<ConnId> = self
                .conns
                .get(*parent)
                .map(|c| c.children.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|child| self.conns.get(*child).is_some_and(|c| c.role == RoleTag::Cgi))
                .collect();
            for channel in channels {
                self.close_free(channel, "cgi terminated");
            }
            if self.callback(*parent, Reason::CgiTerminated).is_close() {
                self.close_free(*parent, "cgi terminated");
            }
        }
        parents.len()
    }
}
