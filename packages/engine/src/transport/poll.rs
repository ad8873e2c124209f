//! Descriptor table and event-loop port
//!
//! The worker keeps its own view of the interest set for every socket so
//! that handlers can test `revents & events` the way a poll loop does. The
//! platform loop is told about changes through [`Poller`].

use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use hashbrown::HashMap;

use super::SocketId;
use crate::conn::ConnId;

/// Poll interest/readiness bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Self = Self(0);
    pub const POLLIN: Self = Self(0x01);
    pub const POLLOUT: Self = Self(0x04);
    pub const POLLHUP: Self = Self(0x10);

    #[inline]
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Interest {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// One readiness event delivered by the platform loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollEvent {
    pub socket: SocketId,
    pub revents: Interest,
}

/// Entry of the descriptor table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollFd {
    pub conn: ConnId,
    pub events: Interest,
    pub revents: Interest,
}

/// Worker-local descriptor table
#[derive(Debug, Default)]
pub struct PollFdTable {
    entries: HashMap<SocketId, PollFd>,
}

impl PollFdTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. Fails if the socket is already present.
    pub fn insert(&mut self, socket: SocketId, conn: ConnId) -> bool {
        if self.entries.contains_key(&socket) {
            return false;
        }
        self.entries.insert(
            socket,
            PollFd {
                conn,
                events: Interest::NONE,
                revents: Interest::NONE,
            },
        );
        true
    }

    pub fn remove(&mut self, socket: SocketId) -> Option<PollFd> {
        self.entries.remove(&socket)
    }

    #[must_use]
    pub fn get(&self, socket: SocketId) -> Option<&PollFd> {
        self.entries.get(&socket)
    }

    pub fn get_mut(&mut self, socket: SocketId) -> Option<&mut PollFd> {
        self.entries.get_mut(&socket)
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

/// Platform event-loop integration.
pub trait Poller: Send {
    /// Start watching a socket.
    ///
    /// # Errors
    ///
    /// Returns the io error from the platform registration.
    fn insert(&mut self, socket: SocketId, interest: Interest) -> io::Result<()>;

    /// Replace the interest set of a watched socket.
    ///
    /// # Errors
    ///
    /// Returns the io error from the platform registration.
    fn set_interest(&mut self, socket: SocketId, interest: Interest) -> io::Result<()>;

    /// Stop watching a socket.
    ///
    /// # Errors
    ///
    /// Returns the io error from the platform deregistration.
    fn remove(&mut self, socket: SocketId) -> io::Result<()>;
}

/// Poller for loops that read the descriptor table directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPoller;

impl Poller for NullPoller {
    fn insert(&mut self, _socket: SocketId, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn set_interest(&mut self, _socket: SocketId, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn remove(&mut self, _socket: SocketId) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_masking() {
        let events = Interest::POLLIN | Interest::POLLOUT;
        let revents = Interest::POLLIN | Interest::POLLHUP;
        assert!((revents & events).contains(Interest::POLLIN));
        assert!(!(revents & events).contains(Interest::POLLOUT));
        assert!(!Interest::NONE.contains(Interest::NONE));
        assert_eq!(events & !Interest::POLLIN, Interest::POLLOUT);
    }
}
