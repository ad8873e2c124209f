//! Per-state servicing of a client connection that is not yet established

use tracing::{debug, info, warn};

use super::{proxy, socks};
use crate::conn::{ConnId, LrsState, PendingTimeout, RoleTag};
use crate::error::{Error, Result};
use crate::headers::{HdrToken, ParserState};
use crate::protocol::ParseOutcome;
use crate::role::H2;
use crate::service::{RawRead, Worker};
use crate::transport::Interest;

/// Largest SOCKS5 reply the negotiation reads at once
const SOCKS_REPLY_MAX: usize = 64;

impl Worker {
    /// Service the client `id` for `revents` according to its state.
    ///
    /// `host` is set when a queued waiter is being serviced on its host's
    /// event; the waiter's handshake then goes out on the host's socket.
    ///
    /// # Errors
    ///
    /// Any error means the connection was reported and closed.
    pub fn client_socket_service(&mut self, id: ConnId, revents: Interest, host: Option<ConnId>) -> Result<()> {
        let conn = self.conns.get(id).ok_or(Error::Closed)?;

        if revents.contains(Interest::POLLOUT) && conn.client.keepalive_active && !conn.client.txn_queue.is_empty() {
            return self.service_queued_handshake(id, revents);
        }

        let result = match conn.state {
            LrsState::WaitingConnect => self.connect_2(id).map(|_| ()),
            LrsState::WaitingSocksGreetingReply
            | LrsState::WaitingSocksAuthReply
            | LrsState::WaitingSocksConnectReply => self.service_socks_reply(id, revents),
            LrsState::WaitingProxyReply => self.service_proxy_reply(id, revents),
            LrsState::IssueHandshake => self.issue_handshake(id, host),
            LrsState::IssueHandshake2 => self.issue_handshake2(id, host),
            LrsState::IssueHttpBody => {
                if self.conns.get(id).is_some_and(|c| c.client.http_body_pending) {
                    let secs = self.config.timeout_secs;
                    self.set_timeout(id, PendingTimeout::ClientIssuePayload, secs);
                    Ok(())
                } else {
                    self.client_http_body_sent(id);
                    Ok(())
                }
            }
            LrsState::WaitingServerReply => self.service_server_reply(id, revents),
            _ => Ok(()),
        };

        if let Err(err) = &result {
            // connect_2 and its helpers tear down on their own
            if self.contains(id) {
                info!(conn = %id, reason = err.diagnostic(), "closing client during setup");
                let msg = err.diagnostic().to_owned();
                self.client_connection_error(id, &msg);
                self.close_free(id, &msg);
            }
        }
        result
    }

    /// The host is writable: let the oldest waiter ready to send headers
    /// write them on the host's socket.
    fn service_queued_handshake(&mut self, id: ConnId, revents: Interest) -> Result<()> {
        let waiter = self.conns.get(id).and_then(|host| {
            host.client
                .txn_queue
                .iter()
                .copied()
                .find(|w| self.conns.get(*w).is_some_and(|c| c.state == LrsState::IssueHandshake2))
        });
        if let Some(waiter) = waiter {
            debug!(conn = %id, waiter = %waiter, "sending queued headers");
            if let Err(err) = self.client_socket_service(waiter, revents, Some(id)) {
                debug!(conn = %waiter, error = %err, "queued handshake failed");
            }
            self.callback_on_writable(id)?;
        }
        Ok(())
    }

    fn service_socks_reply(&mut self, id: ConnId, revents: Interest) -> Result<()> {
        if revents.contains(Interest::POLLHUP) {
            warn!(conn = %id, "socks connection dead");
            return Err(Error::proxy("socks connection dead"));
        }
        let reply = match self.read_or_use_preamble(id, SOCKS_REPLY_MAX) {
            RawRead::Data(bytes) => bytes,
            RawRead::Again => {
                debug!(conn = %id, "socks read again, retrying");
                return Ok(());
            }
            RawRead::Nothing | RawRead::Failed => return Err(Error::proxy("socks read failed")),
        };
        let state = self.conns.get(id).ok_or(Error::Closed)?.state;
        let outcome = self.socks_step(id, state, &reply);
        self.restore_serv_buf(reply);
        outcome
    }

    fn socks_step(&mut self, id: ConnId, state: LrsState, reply: &[u8]) -> Result<()> {
        let next = match state {
            LrsState::WaitingSocksGreetingReply => match socks::parse_greeting_reply(reply) {
                Some(socks::GreetingChoice::NoAuth) => {
                    debug!(conn = %id, "socks: no auth");
                    None
                }
                Some(socks::GreetingChoice::UsernamePassword) => {
                    debug!(conn = %id, "socks: user/password");
                    let vhost = std::sync::Arc::clone(&self.conns.get(id).ok_or(Error::Closed)?.vhost);
                    let msg = vhost
                        .config()
                        .socks_proxy
                        .as_ref()
                        .and_then(|cfg| socks::username_password(&cfg.auth))
                        .ok_or(Error::proxy("socks reply"))?;
                    Some((msg, LrsState::WaitingSocksAuthReply, PendingTimeout::AwaitingSocksAuthReply))
                }
                None => return Err(socks_reply_fail(id, reply)),
            },
            LrsState::WaitingSocksAuthReply => {
                if !socks::auth_accepted(reply) {
                    return Err(socks_reply_fail(id, reply));
                }
                debug!(conn = %id, "socks password ok, sending connect");
                None
            }
            LrsState::WaitingSocksConnectReply => {
                if !socks::connect_accepted(reply) {
                    return Err(socks_reply_fail(id, reply));
                }
                info!(conn = %id, "socks connect ok");
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.client.stash = None;
                }
                self.clear_timeout(id);
                return self.send_handshake(id).map(|_| ());
            }
            _ => return Ok(()),
        };

        let (msg, state, timeout) = match next {
            Some(step) => step,
            None => {
                let (domain, port) = {
                    let conn = self.conns.get(id).ok_or(Error::Closed)?;
                    let domain = self
                        .header_table_of(id)
                        .and_then(|ah| ah.get(HdrToken::ClientPeerAddress))
                        .map(str::to_owned)
                        .ok_or(Error::proxy("socks reply"))?;
                    (domain, conn.client.c_port)
                };
                let msg = socks::connect_request(&domain, port).ok_or(Error::proxy("socks reply"))?;
                (msg, LrsState::WaitingSocksConnectReply, PendingTimeout::AwaitingSocksConnectReply)
            }
        };
        self.socks_send(id, &msg)?;
        let secs = self.config.awaiting_timeout_secs;
        self.set_timeout(id, timeout, secs);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.set_state(state);
        }
        Ok(())
    }

    fn service_proxy_reply(&mut self, id: ConnId, revents: Interest) -> Result<()> {
        if revents.contains(Interest::POLLHUP) {
            warn!(conn = %id, "proxy connection dead");
            return Err(Error::proxy("proxy connection dead"));
        }
        let cap = self.config.pt_serv_buf_size;
        let reply = match self.read_or_use_preamble(id, cap) {
            RawRead::Data(bytes) => bytes,
            RawRead::Again => {
                debug!(conn = %id, "proxy read again, retrying");
                return Ok(());
            }
            RawRead::Nothing | RawRead::Failed => return Err(Error::proxy("proxy read failed")),
        };
        let accepted = proxy::reply_accepted(&reply);
        if !accepted {
            let head = String::from_utf8_lossy(&reply[..reply.len().min(13)]).into_owned();
            warn!(conn = %id, reply = %head, "proxy refused CONNECT");
        }
        self.restore_serv_buf(reply);
        if !accepted {
            return Err(Error::proxy("proxy reply"));
        }
        self.clear_timeout(id);
        self.send_handshake(id).map(|_| ())
    }

    /// Connected end to end. An h2 transport becomes a network connection
    /// and sends its preface; anything else goes on to the HTTP/1 request.
    fn issue_handshake(&mut self, id: ConnId, host: Option<ConnId>) -> Result<()> {
        self.change_pollfd(id, Interest::POLLOUT, Interest::NONE)?;

        let negotiated_h2 = self
            .conns
            .get(id)
            .and_then(|c| c.socket.as_ref())
            .is_some_and(|s| s.negotiated_h2());
        if negotiated_h2 {
            info!(conn = %id, "client connection upgraded to h2");
            let preface = {
                let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
                conn.h2.client_h2_alpn = true;
                conn.role_transition(RoleTag::H2Client, LrsState::H2ClientSendSettings, &H2);
                conn.configure_h2_network(false);
                self.codec.h2_preface(conn)
            };
            self.issue_raw(id, &preface)
                .map_err(|_| Error::protocol("error sending h2 preface"))?;
            if let Some(conn) = self.conns.get_mut(id) {
                conn.set_state(LrsState::H2WaitingToSendHeaders);
            }
            self.clear_timeout(id);
            return self.callback_on_writable(id);
        }

        if let Some(conn) = self.conns.get_mut(id) {
            conn.set_state(LrsState::IssueHandshake2);
        }
        let secs = self.config.timeout_secs;
        self.set_timeout(id, PendingTimeout::AwaitingClientHsSend, secs);
        self.issue_handshake2(id, host)
    }

    /// Write the request headers, on the host's socket when queued
    fn issue_handshake2(&mut self, id: ConnId, host: Option<ConnId>) -> Result<()> {
        let master = host.unwrap_or_else(|| self.client_wsi_master(id));
        if master != id && host.is_none() {
            // waiters write when their host is writable
            return self.callback_on_writable(master);
        }

        let request = {
            let conn = self.conns.get(id).ok_or(Error::Closed)?;
            let ah = conn.ah.and_then(|ah| self.ah_pool.get(ah));
            match ah {
                Some(ah) => self.codec.client_handshake(conn, ah),
                None => None,
            }
        };
        let Some(request) = request else {
            warn!(conn = %id, "failed to generate handshake");
            return Err(Error::protocol("chs"));
        };

        debug!(conn = %id, master = %master, len = request.len(), "sending headers");
        self.issue_raw(master, &request).map_err(|_| Error::connect("cws"))?;

        if self.conns.get(id).is_some_and(|c| c.client.http_body_pending) {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.set_state(LrsState::IssueHttpBody);
            }
            let secs = self.config.timeout_secs;
            self.set_timeout(id, PendingTimeout::ClientIssuePayload, secs);
            // the user asks for writable callbacks to send the body
            return Ok(());
        }

        self.callback_on_writable(master)?;
        self.client_http_body_sent(id);
        Ok(())
    }

    /// Request and body are out: get ready to parse the response
    pub(crate) fn client_http_body_sent(&mut self, id: ConnId) {
        if let Some(ah) = self.header_table_of_mut(id) {
            ah.set_parser_state(ParserState::NamePart);
        }
        if let Some(conn) = self.conns.get_mut(id) {
            conn.set_state(LrsState::WaitingServerReply);
            conn.hdr_parsing_completed = false;
        }
        let secs = self.config.timeout_secs;
        self.set_timeout(id, PendingTimeout::AwaitingServerResponse, secs);
    }

    fn service_server_reply(&mut self, id: ConnId, revents: Interest) -> Result<()> {
        if revents & (Interest::POLLIN | Interest::POLLHUP) == Interest::POLLHUP {
            debug!(conn = %id, "server connection dead");
            return Err(Error::connect("Peer hung up"));
        }
        if !revents.contains(Interest::POLLIN) {
            return Ok(());
        }

        if self.conns.get(id).is_some_and(|c| c.ah.is_none()) {
            if let crate::headers::Attach::Queued = self.ah_attach(id) {
                return Ok(());
            }
        }

        let cap = self.config.ah_rx_size;
        let bytes = match self.read_or_use_preamble(id, cap) {
            RawRead::Data(bytes) => bytes,
            RawRead::Again => return Ok(()),
            RawRead::Nothing | RawRead::Failed => return Err(Error::connect("read failed")),
        };

        let outcome = self.codec_read_h1(id, &bytes);
        let result = match outcome {
            ParseOutcome::Closed => Err(Error::protocol("problems parsing header")),
            ParseOutcome::Consumed(n) => {
                if n < bytes.len() {
                    debug!(conn = %id, kept = bytes.len() - n, "bytes past the response head");
                    self.conns.get_mut(id).ok_or(Error::Closed)?.flow.unread(&bytes[n..]);
                    self.apply_rx_flow(id);
                }
                Ok(())
            }
        };
        self.restore_serv_buf(bytes);
        result?;

        // headers may still be arriving; the response timeout covers that
        if !self.conns.get(id).is_some_and(|c| c.hdr_parsing_completed) {
            return Ok(());
        }
        self.interpret_server_response(id)
    }
}

fn socks_reply_fail(id: ConnId, reply: &[u8]) -> Error {
    warn!(
        conn = %id,
        version = reply.first().copied().unwrap_or_default(),
        code = reply.get(1).copied().unwrap_or_default(),
        "socks reply"
    );
    Error::proxy("socks reply")
}
