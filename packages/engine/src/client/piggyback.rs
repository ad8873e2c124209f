//! Sharing an existing client connection
//!
//! An HTTP/1 host serves its queued waiters one transaction at a time, in
//! the order they queued. An HTTP/2 host takes the new request as a stream.

use tracing::{debug, info};

use crate::conn::{ConnId, LrsState, RoleTag};
use crate::error::{Error, Result};
use crate::role::H2;
use crate::service::Worker;
use crate::telemetry::ConnStats;

impl Worker {
    /// Put `id` on `host`: as a stream if the host speaks h2 and can take
    /// one, otherwise at the back of its transaction queue.
    pub(crate) fn piggyback(&mut self, id: ConnId, host: ConnId) -> Result<ConnId> {
        let host_conn = self.conns.get(host).ok_or(Error::Closed)?;
        let h2_usable = host_conn.h2.client_h2_alpn
            && matches!(host_conn.state, LrsState::H2WaitingToSendHeaders | LrsState::Established);
        ConnStats::bump(&self.stats.piggybacks);

        if h2_usable {
            return self.h2_adopt(host, id);
        }

        if let Some(host_conn) = self.conns.get_mut(host) {
            host_conn.client.txn_queue.push_back(id);
        }
        if let Some(conn) = self.conns.get_mut(id) {
            conn.client.queued_on = Some(host);
            conn.set_state(LrsState::IssueHandshake2);
        }
        info!(conn = %id, host = %host, "waiting to send headers");
        self.callback_on_writable(host)?;
        Ok(id)
    }

    /// Turn `new` into a client stream of the h2 network connection `host`.
    ///
    /// # Errors
    ///
    /// `Error::Closed` when either connection is gone.
    pub fn h2_adopt(&mut self, host: ConnId, new: ConnId) -> Result<ConnId> {
        if !self.contains(new) {
            return Err(Error::Closed);
        }
        let sid = {
            let host_conn = self.conns.get_mut(host).ok_or(Error::Closed)?;
            host_conn.children.push(new);
            host_conn.h2n.get_or_insert_with(Box::default).next_client_sid()
        };

        let conn = self.conns.get_mut(new).ok_or(Error::Closed)?;
        conn.parent = Some(host);
        conn.role_transition(RoleTag::H2Client, LrsState::H2WaitingToSendHeaders, &H2);
        conn.h2.http2_substream = true;
        conn.h2.my_sid = sid;
        debug!(conn = %new, host = %host, sid, "adopted as h2 stream");

        self.callback_on_writable(new)?;
        Ok(new)
    }

    /// The connection whose socket `id` uses for the transaction
    #[must_use]
    pub fn client_wsi_master(&self, id: ConnId) -> ConnId {
        self.conns
            .get(id)
            .and_then(|c| c.client.queued_on)
            .unwrap_or(id)
    }

    /// The connection the current transaction on `id` belongs to: the
    /// oldest waiter while the host serves its queue, else the host.
    #[must_use]
    pub fn client_wsi_effective(&self, id: ConnId) -> ConnId {
        let Some(conn) = self.conns.get(id) else {
            return id;
        };
        if !conn.client.transaction_from_pipeline_queue {
            return id;
        }
        conn.client.txn_queue.front().copied().unwrap_or(id)
    }
}
