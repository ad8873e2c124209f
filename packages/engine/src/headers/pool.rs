//! Bounded header table pool
//!
//! Tables are created lazily up to the configured size. Connections that
//! find the pool empty wait in FIFO order; a released table goes straight to
//! the oldest waiter.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use super::HeaderTable;
use crate::conn::ConnId;

/// Handle to a pooled header table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AhId(u32);

impl fmt::Display for AhId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ah{}", self.0)
    }
}

/// Result of asking for a table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attach {
    Attached(AhId),
    /// Queued; the table arrives through [`HeaderTablePool::detach`]
    Queued,
}

#[derive(Debug)]
pub struct HeaderTablePool {
    tables: Vec<HeaderTable>,
    free: Vec<u32>,
    waiting: VecDeque<ConnId>,
    capacity: usize,
    data_size: usize,
    rx_size: usize,
}

impl HeaderTablePool {
    #[must_use]
    pub fn new(capacity: usize, data_size: usize, rx_size: usize) -> Self {
        Self {
            tables: Vec::new(),
            free: Vec::new(),
            waiting: VecDeque::new(),
            capacity,
            data_size,
            rx_size,
        }
    }

    /// Get a table for `conn`, or queue it.
    pub fn attach(&mut self, conn: ConnId, now: Instant) -> Attach {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.tables.len() < self.capacity => match next_index(self.tables.len()) {
                Some(index) => {
                    self.tables
                        .push(HeaderTable::new(self.data_size, self.rx_size));
                    index
                }
                None => return self.queue(conn),
            },
            None => return self.queue(conn),
        };
        self.tables[index as usize].assign(conn, now);
        Attach::Attached(AhId(index))
    }

    fn queue(&mut self, conn: ConnId) -> Attach {
        if !self.waiting.contains(&conn) {
            self.waiting.push_back(conn);
        }
        tracing::debug!(conn = %conn, waiting = self.waiting.len(), "header table pool exhausted");
        Attach::Queued
    }

    /// Release `ah`. When someone is waiting the table is handed over
    /// and the new owner is returned.
    pub fn detach(&mut self, ah: AhId, now: Instant) -> Option<(ConnId, AhId)> {
        let table = self.tables.get_mut(ah.0 as usize)?;
        table.owner()?;
        table.release();
        match self.waiting.pop_front() {
            Some(next) => {
                table.assign(next, now);
                Some((next, ah))
            }
            None => {
                self.free.push(ah.0);
                None
            }
        }
    }

    /// Drop `conn` from the wait list
    pub fn remove_waiter(&mut self, conn: ConnId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|c| *c != conn);
        before != self.waiting.len()
    }

    #[must_use]
    pub fn is_waiting(&self, conn: ConnId) -> bool {
        self.waiting.contains(&conn)
    }

    #[must_use]
    pub fn get(&self, ah: AhId) -> Option<&HeaderTable> {
        self.tables.get(ah.0 as usize).filter(|t| t.owner().is_some())
    }

    pub fn get_mut(&mut self, ah: AhId) -> Option<&mut HeaderTable> {
        self.tables
            .get_mut(ah.0 as usize)
            .filter(|t| t.owner().is_some())
    }

    /// Assigned tables with their owner and assignment time
    pub fn assigned(&self) -> impl Iterator<Item = (AhId, ConnId, Instant)> + '_ {
        self.tables.iter().enumerate().filter_map(|(i, t)| {
            Some((AhId(i as u32), t.owner()?, t.assigned_at()?))
        })
    }

    #[must_use]
    pub fn any_rx_pending(&self) -> bool {
        self.tables
            .iter()
            .any(|t| t.owner().is_some() && t.has_rx_pending())
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.tables.len() - self.free.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Index of the table created after `len` others, if a handle can name it
fn next_index(len: usize) -> Option<u32> {
    u32::try_from(len).ok()
}
