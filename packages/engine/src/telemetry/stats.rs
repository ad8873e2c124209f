//! Lock-free connection statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free statistics collector using atomic counters
#[derive(Debug, Default)]
pub struct ConnStats {
    /// Connection objects created
    pub created: AtomicU64,
    /// Connection objects torn down
    pub closed: AtomicU64,
    /// Connections closed by the timeout sweep
    pub timeouts: AtomicU64,
    /// Connection-creation errors delivered to the user protocol
    pub connection_errors: AtomicU64,
    /// HTTP/2 streams upgraded to websocket
    pub ws_upg: AtomicU64,
    /// Pending protocol packets written
    pub h2_pps_sent: AtomicU64,
    /// Requests that reused an existing connection
    pub piggybacks: AtomicU64,
    /// Redirects followed
    pub redirects: AtomicU64,
    /// Readable events faked for buffered data
    pub forced_pollin: AtomicU64,
}

impl ConnStats {
    /// Create new statistics collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> ConnStatsSnapshot {
        ConnStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            ws_upg: self.ws_upg.load(Ordering::Relaxed),
            h2_pps_sent: self.h2_pps_sent.load(Ordering::Relaxed),
            piggybacks: self.piggybacks.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            forced_pollin: self.forced_pollin.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStatsSnapshot {
    pub created: u64,
    pub closed: u64,
    pub timeouts: u64,
    pub connection_errors: u64,
    pub ws_upg: u64,
    pub h2_pps_sent: u64,
    pub piggybacks: u64,
    pub redirects: u64,
    pub forced_pollin: u64,
}

impl ConnStatsSnapshot {
    /// Connections still alive at snapshot time
    #[must_use]
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.closed)
    }
}
