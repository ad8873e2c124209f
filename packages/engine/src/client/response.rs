//! Acting on a parsed response head, and finishing a transaction

use tracing::{debug, info, warn};

use super::{resolve_location, ChunkState};
use crate::conn::{ConnId, LrsState, PendingTimeout, RoleTag, RxFlowReason};
use crate::error::{Error, Result};
use crate::headers::{HdrToken, ParserState};
use crate::protocol::{Reason, ResponseHead};
use crate::role::{H1, H2};
use crate::service::Worker;

/// Seconds an idle keep-alive connection waits for another request
const CLIENT_CONN_IDLE_SECS: u64 = 5;

impl Worker {
    /// The response head for the current transaction on `id` is complete:
    /// follow a redirect, or establish the transaction and tell the user.
    ///
    /// # Errors
    ///
    /// Any error means the connection was reported and closed.
    pub fn interpret_server_response(&mut self, id: ConnId) -> Result<()> {
        match self.interpret_inner(id) {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.contains(id) {
                    let msg = err.diagnostic().to_owned();
                    info!(conn = %id, reason = %msg, "closing at server reply");
                    self.client_connection_error(id, &msg);
                    self.close_free(id, &msg);
                }
                Err(err)
            }
        }
    }

    fn interpret_inner(&mut self, id: ConnId) -> Result<()> {
        let effective = self.client_wsi_effective(id);
        let (h2_stream, h2_alpn) = {
            let conn = self.conns.get(id).ok_or(Error::Closed)?;
            (conn.h2.http2_substream, conn.h2.client_h2_alpn)
        };
        let head = {
            let ah = self.header_table_of_mut(id).ok_or(Error::protocol("HS: URI missing"))?;
            let head = ResponseHead::from_header_table(ah, h2_stream)?;
            ah.set_http_response(head.status);
            head
        };
        debug!(conn = %id, effective = %effective, status = head.status, close = head.close, "response head");

        if head.is_redirect() {
            return self.follow_redirect(id, &head);
        }

        if !h2_alpn && !h2_stream && effective == id {
            self.settle_keepalive(id, head.close);
        }

        {
            let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
            if h2_alpn || h2_stream {
                conn.role_transition(RoleTag::H2Client, LrsState::Established, &H2);
            } else {
                conn.role_transition(RoleTag::H1Client, LrsState::Established, &H1);
            }
            conn.client.chunked = head.chunked;
            conn.client.chunk = ChunkState::Hex;
            conn.client.chunk_remaining = 0;
            let length = head.content_length.unwrap_or(0);
            conn.http.rx_content_length = length;
            conn.http.rx_content_remain = length;
        }
        if let Some(length) = head.content_length {
            debug!(conn = %id, length, "incoming content length");
        }

        if self.callback(effective, Reason::ClientFilterPreEstablish).is_close() {
            return Err(Error::protocol("HS: disallowed by client filter"));
        }
        self.clear_timeout(id);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.flow.set(RxFlowReason::User, true);
        }
        self.sync_rx_flow(id);

        if self.callback(effective, Reason::EstablishedClientHttp).is_close() {
            return Err(Error::protocol("HS: disallowed at ESTABLISHED"));
        }

        // the host keeps its table for the next response; a waiter is done
        // with its own
        if effective != id {
            self.ah_detach_forced(effective);
        }
        info!(conn = %id, status = head.status, "client connection up");

        // an empty body is complete as soon as the head is
        if head.content_length == Some(0) && !head.chunked && self.transaction_completed_client(id).is_err() {
            self.close_free(id, "transaction completed");
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn follow_redirect(&mut self, id: ConnId, head: &ResponseHead) -> Result<()> {
        let location = head
            .location
            .as_deref()
            .ok_or(Error::protocol("HS: Redirect code but no Location"))?;
        let (tls, port) = {
            let conn = self.conns.get(id).ok_or(Error::Closed)?;
            (conn.client.tls.use_ssl(), conn.client.c_port)
        };
        let (address, uri) = {
            let ah = self.header_table_of(id).ok_or(Error::protocol("HS: Redirect failed"))?;
            (
                ah.get(HdrToken::ClientPeerAddress).unwrap_or_default().to_owned(),
                ah.get(HdrToken::ClientUri).unwrap_or("/").to_owned(),
            )
        };
        let target = resolve_location(location, tls, &address, port, &uri)?;

        match self.client_reset(id, &target) {
            Ok(_) => Ok(()),
            Err(err) if err.is_redirect_limit() => Err(err),
            Err(err) => {
                warn!(conn = %id, error = %err, "redirect failed");
                Err(Error::protocol("HS: Redirect failed"))
            }
        }
    }

    /// First response on a fresh HTTP/1 connection decides whether queued
    /// waiters can share it.
    fn settle_keepalive(&mut self, id: ConnId, close: bool) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if !close {
            conn.client.keepalive_active = true;
            if !conn.client.txn_queue.is_empty() {
                if let Err(err) = self.callback_on_writable(id) {
                    debug!(conn = %id, error = %err, "writable for queued waiters failed");
                }
            }
            return;
        }

        info!(conn = %id, "server rejected keepalive, restarting waiters");
        conn.client.keepalive_rejected = true;
        let waiters: Vec<ConnId> = conn.client.txn_queue.drain(..).collect();
        let registered = std::mem::take(&mut conn.client.registered);
        let vhost = std::sync::Arc::clone(&conn.vhost);
        if registered {
            vhost.registry().unregister(self.id, id);
        }

        for waiter in waiters {
            let Some(w) = self.conns.get_mut(waiter) else {
                continue;
            };
            w.client.queued_on = None;
            w.client.pipeline = false;
            w.role_transition(RoleTag::H1Client, LrsState::Unconnected, &H1);
            debug!(conn = %waiter, "restarting on its own connection");
            if let Err(err) = self.connect_2(waiter) {
                debug!(conn = %waiter, error = %err, "restart failed");
            }
        }
    }

    /// One response on `host` is fully received. Moves on to the next
    /// queued waiter, or lets the connection idle.
    ///
    /// # Errors
    ///
    /// An error means the caller must close `host`: the user asked for it,
    /// or the connection cannot carry another transaction.
    pub fn transaction_completed_client(&mut self, host: ConnId) -> Result<()> {
        let effective = self.client_wsi_effective(host);
        info!(conn = %host, effective = %effective, "transaction completed");

        if self.callback(effective, Reason::CompletedClientHttp).is_close() {
            debug!(conn = %host, "completed callback asked to close");
            return Err(Error::Closed);
        }

        let conn = self.conns.get(host).ok_or(Error::Closed)?;
        if !conn.client.registered {
            return Err(Error::Closed);
        }

        if conn.client.transaction_from_pipeline_queue && effective != host {
            debug!(conn = %host, waiter = %effective, "closing finished waiter");
            if let Some(w) = self.conns.get_mut(effective) {
                w.client.already_did_cce = true;
            }
            self.close_free(effective, "queued client done");
        }

        let conn = self.conns.get_mut(host).ok_or(Error::Closed)?;
        conn.client.transaction_from_pipeline_queue = true;
        conn.http.rx_content_length = 0;
        conn.http.rx_content_remain = 0;
        conn.hdr_parsing_completed = false;

        let next = self.client_wsi_effective(host);
        if next == host {
            info!(conn = %host, "nothing pipelined waiting");
            self.ah_detach_forced(host);
            self.set_timeout(host, PendingTimeout::ClientConnIdle, CLIENT_CONN_IDLE_SECS);
            return Ok(());
        }

        if let Some(conn) = self.conns.get_mut(host) {
            conn.set_state(LrsState::WaitingServerReply);
        }
        if self.conns.get(host).is_some_and(|c| c.ah.is_none()) {
            let _ = self.ah_attach(host);
        }
        if let Some(ah) = self.header_table_of_mut(host) {
            ah.reset();
            ah.set_parser_state(ParserState::NamePart);
        }
        let secs = self.config.timeout_secs;
        self.set_timeout(host, PendingTimeout::AwaitingServerResponse, secs);
        info!(conn = %host, next = %next, "new queued transaction");
        self.callback_on_writable(host)
    }
}
