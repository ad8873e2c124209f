//! Receive flow control
//!
//! A connection is flow-controlled while any reason bit is set. Bytes that
//! were read before the upper layer could take them wait in an owned buffer
//! that is drained before anything else is read.

/// Why receive is suppressed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RxFlowReason {
    /// Requested by user code
    User = 0x01,
    /// HTTP/2 control packets are queued for send
    H2PpsPending = 0x02,
}

/// Flow-control bitmap plus the leftover receive buffer
#[derive(Debug, Default)]
pub struct RxFlow {
    bitmap: u8,
    buffer: Option<Box<[u8]>>,
    pos: usize,
    /// Set when a reason changed and the poll interest needs syncing
    pub(crate) change_pending: bool,
}

impl RxFlow {
    #[inline]
    #[must_use]
    pub fn is_flowcontrolled(&self) -> bool {
        self.bitmap != 0
    }

    #[inline]
    #[must_use]
    pub fn bitmap(&self) -> u8 {
        self.bitmap
    }

    /// `allow == true` lifts the reason, `false` applies it.
    pub fn set(&mut self, reason: RxFlowReason, allow: bool) {
        let before = self.bitmap;
        if allow {
            self.bitmap &= !(reason as u8);
        } else {
            self.bitmap |= reason as u8;
        }
        if before != self.bitmap {
            self.change_pending = true;
        }
    }

    /// Drop every reason
    pub fn force_allow(&mut self) {
        if self.bitmap != 0 {
            self.bitmap = 0;
            self.change_pending = true;
        }
    }

    #[must_use]
    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Bytes still waiting in the leftover buffer
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        self.buffer.as_deref().map_or(&[][..], |buf| &buf[self.pos..])
    }

    #[must_use]
    pub fn position(&self) -> (usize, usize) {
        (self.pos, self.buffer.as_ref().map_or(0, |b| b.len()))
    }

    /// Stash bytes the upper layer could not take. Returns false when a
    /// buffer already exists; the caller is then still draining it.
    pub fn cache(&mut self, remainder: &[u8]) -> bool {
        if self.buffer.is_some() {
            return false;
        }
        self.buffer = Some(remainder.to_vec().into_boxed_slice());
        self.pos = 0;
        true
    }

    /// Put bytes back in front of whatever is still buffered
    pub(crate) fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut joined = Vec::with_capacity(bytes.len() + self.buffered().len());
        joined.extend_from_slice(bytes);
        joined.extend_from_slice(self.buffered());
        self.buffer = Some(joined.into_boxed_slice());
        self.pos = 0;
    }

    pub(crate) fn take_buffer(&mut self) -> Option<(Box<[u8]>, usize)> {
        self.buffer.take().map(|buf| (buf, self.pos))
    }

    pub(crate) fn restore_buffer(&mut self, buf: Box<[u8]>, pos: usize) {
        self.pos = pos.min(buf.len());
        self.buffer = Some(buf);
    }

    /// Whether the leftover buffer exists and has been fully consumed
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.buffer.as_ref().is_some_and(|buf| self.pos >= buf.len())
    }

    pub(crate) fn free_buffer(&mut self) {
        self.buffer = None;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_independent() {
        let mut flow = RxFlow::default();
        flow.set(RxFlowReason::User, false);
        flow.set(RxFlowReason::H2PpsPending, false);
        flow.set(RxFlowReason::User, true);
        assert!(flow.is_flowcontrolled());
        flow.set(RxFlowReason::H2PpsPending, true);
        assert!(!flow.is_flowcontrolled());
        assert!(flow.change_pending);
    }

    #[test]
    fn cache_refuses_a_second_buffer() {
        let mut flow = RxFlow::default();
        assert!(flow.cache(b"abc"));
        assert!(!flow.cache(b"def"));
        assert_eq!(flow.buffered(), b"abc");
    }

    #[test]
    fn unread_goes_in_front_of_the_rest() {
        let mut flow = RxFlow::default();
        flow.unread(b"");
        assert!(!flow.has_buffer());
        flow.cache(b"tail");
        flow.unread(b"head-");
        assert_eq!(flow.buffered(), b"head-tail");
        assert_eq!(flow.position(), (0, 9));
    }
}
