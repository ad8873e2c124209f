//! Connection teardown

use tracing::{debug, info};

use super::Worker;
use crate::conn::{ConnId, LrsState};
use crate::protocol::Reason;
use crate::telemetry::ConnStats;

impl Worker {
    /// Close `id` and release everything it holds: its timeout, its place in
    /// a transaction queue or its waiters, its children, its header table and
    /// its socket. The user protocol hears about it once. Calling this on a
    /// connection already being closed does nothing.
    pub fn close_free(&mut self, id: ConnId, reason: &str) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.closing {
            return;
        }
        conn.closing = true;
        debug!(conn = %id, role = ?conn.role, state = ?conn.state, reason, "close");

        self.clear_timeout(id);
        self.unlink_transaction_queue(id);
        self.close_children(id);
        self.unlink_parent(id);
        self.ah_detach_forced(id);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.client.stash = None;
        }
        self.remove_fds(id);
        self.notify_close(id, reason);

        if let Some(conn) = self.conns.get_mut(id) {
            conn.set_state(LrsState::DeadSocket);
        }
        self.conns.remove(id);
        ConnStats::bump(&self.stats.closed);
    }

    /// Tell the user protocol a client could not be created. Delivered at
    /// most once per connection.
    pub fn client_connection_error(&mut self, id: ConnId, msg: &str) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.client.already_did_cce {
            return;
        }
        conn.client.already_did_cce = true;
        info!(conn = %id, msg, "client connection error");
        ConnStats::bump(&self.stats.connection_errors);
        // the connection is going away whatever the answer
        let _ = self.callback(id, Reason::ClientConnectionError(msg));
    }

    /// Tear down a client that failed before its socket was registered:
    /// report the error, give back any header table and drop the slot.
    pub(crate) fn client_fail_early(&mut self, id: ConnId, msg: &str) {
        if let Some(table) = self.header_table_of_mut(id) {
            table.force_to_detachable_state();
        }
        self.client_connection_error(id, msg);
        self.ah_pool.remove_waiter(id);
        self.ah_detach_forced(id);
        self.clear_timeout(id);
        self.unlink_transaction_queue(id);
        self.unlink_parent(id);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.closing = true;
            conn.client.stash = None;
            conn.client.hostname = None;
        }
        self.conns.remove(id);
        ConnStats::bump(&self.stats.closed);
    }

    /// A waiter leaves its host's queue; a host takes its waiters down with
    /// it and leaves the reuse registry.
    fn unlink_transaction_queue(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        let host = conn.client.queued_on.take();
        let waiters = std::mem::take(&mut conn.client.txn_queue);
        let registered = std::mem::take(&mut conn.client.registered);

        if let Some(host) = host {
            if let Some(host_conn) = self.conns.get_mut(host) {
                host_conn.client.txn_queue.retain(|w| *w != id);
            }
        }
        if registered {
            let vhost = self.conns.get(id).map(|c| std::sync::Arc::clone(&c.vhost));
            if let Some(vhost) = vhost {
                vhost.registry().unregister(self.id, id);
            }
        }
        for waiter in waiters {
            if let Some(conn) = self.conns.get_mut(waiter) {
                conn.client.queued_on = None;
            }
            self.client_connection_error(waiter, "trans q leader closing");
            self.close_free(waiter, "trans q leader closing");
        }
    }

    fn close_children(&mut self, id: ConnId) {
        let children = match self.conns.get_mut(id) {
            Some(conn) => std::mem::take(&mut conn.children),
            None => return,
        };
        for child in children {
            if let Some(conn) = self.conns.get_mut(child) {
                conn.parent = None;
            }
            self.close_free(child, "parent closing");
        }
    }

    fn unlink_parent(&mut self, id: ConnId) {
        let Some(parent) = self.conns.get_mut(id).and_then(|c| c.parent.take()) else {
            return;
        };
        if let Some(parent_conn) = self.conns.get_mut(parent) {
            parent_conn.children.retain(|c| *c != id);
        }
    }

    fn notify_close(&mut self, id: ConnId, reason: &str) {
        let Some(conn) = self.conns.get(id) else {
            return;
        };
        let role = conn.role;
        let established = conn.state == LrsState::Established || conn.hdr_parsing_completed;

        if role.is_client() && !established {
            self.client_connection_error(id, reason);
        } else if role.is_http_client() && !conn.told_user_closed && !conn.client.already_did_cce {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.told_user_closed = true;
            }
            let _ = self.callback(id, Reason::ClosedClientHttp);
        } else if (role.is_raw() || role.is_ws()) && !conn.told_user_closed {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.told_user_closed = true;
            }
            let reason = if role.is_raw() { Reason::RawClose } else { Reason::Closed };
            let _ = self.callback(id, reason);
        }
    }
}
