//! Outbound connection setup: resolve, pick a proxy, connect

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, info};

use super::{proxy, socks, ConnectInfo, Stash, Via};
use crate::conn::{ConnId, Connection, LrsState, PendingTimeout, RoleTag};
use crate::dns::select_address;
use crate::error::{Error, Result};
use crate::headers::{Attach, HdrToken};
use crate::role::H1;
use crate::service::Worker;
use crate::telemetry::ConnStats;
use crate::transport::{classify_connect, ConnectProgress, Interest};
use crate::vhost::RegistryEntry;

/// Only requests with this method may share a connection
const REUSABLE_METHOD: &str = "GET";

/// Where the socket goes, after proxy selection
struct Target {
    host: String,
    port: u16,
    via: Via,
}

impl Worker {
    /// Start an outbound connection. The returned connection may still be
    /// waiting for a header table; it continues on its own once it has one.
    ///
    /// # Errors
    ///
    /// Invalid parameters, or a failure that already tore the connection
    /// down (the user protocol has been told).
    pub fn client_connect_via_info(&mut self, info: ConnectInfo) -> Result<ConnId> {
        info.validate()?;
        let vhost = info.vhost.clone().unwrap_or_else(|| Arc::clone(&self.vhost));
        let id = self
            .conns
            .insert_with(|id| Connection::new(id, RoleTag::H1Client, LrsState::Unconnected, &H1, vhost));
        ConnStats::bump(&self.stats.created);

        let parent = info.parent.filter(|p| self.conns.contains(*p));
        if let Some(conn) = self.conns.get_mut(id) {
            conn.client.c_port = info.port;
            conn.client.tls = info.tls;
            conn.client.pipeline = info.pipeline;
            conn.client.stash = Some(Box::new(Stash::from_info(&info)));
            conn.parent = parent;
        }
        if let Some(parent) = parent {
            if let Some(parent_conn) = self.conns.get_mut(parent) {
                parent_conn.children.push(id);
            }
        }
        info!(conn = %id, address = %info.address, port = info.port, path = %info.path, "client connect");

        if let Attach::Queued = self.ah_attach(id) {
            debug!(conn = %id, "waiting for a header table");
            return Ok(id);
        }
        self.connect_via_info2(id)
    }

    /// Move the stashed parameters into the header table, then connect.
    pub(crate) fn connect_via_info2(&mut self, id: ConnId) -> Result<ConnId> {
        let stash = self.conns.get_mut(id).ok_or(Error::Closed)?.client.stash.take();
        if let Some(stash) = stash {
            let written = match self.header_table_of_mut(id) {
                Some(ah) => stash.write_into(ah).map_err(Error::from),
                None => Err(Error::resource("ah was NULL at cc2")),
            };
            if let Err(err) = written {
                self.client_fail_early(id, err.diagnostic());
                return Err(err);
            }
        }
        self.connect_2(id)
    }

    /// Drive a connection with its parameters in the header table towards
    /// the handshake. Re-entered while the connect is in progress.
    pub(crate) fn connect_2(&mut self, id: ConnId) -> Result<ConnId> {
        let Some(ah) = self.conns.get(id).ok_or(Error::Closed)?.ah else {
            self.client_fail_early(id, "ah was NULL at cc2");
            return Err(Error::resource("ah was NULL at cc2"));
        };
        let (method, address, iface) = match self.ah_pool.get(ah) {
            Some(table) => (
                table.get(HdrToken::ClientMethod).map(str::to_owned),
                table.get(HdrToken::ClientPeerAddress).map(str::to_owned),
                table.get(HdrToken::ClientIface).map(str::to_owned),
            ),
            None => (None, None, None),
        };
        let Some(address) = address else {
            self.client_fail_early(id, "no peer address");
            return Err(Error::connect("no peer address"));
        };
        let reusable = method.as_deref() == Some(REUSABLE_METHOD);

        let conn = self.conns.get(id).ok_or(Error::Closed)?;
        let fresh = conn.state == LrsState::Unconnected && conn.socket.is_none();
        if fresh && reusable && conn.client.pipeline && conn.client.queued_on.is_none() {
            if let Some(host) = self.find_piggyback_host(id, &address) {
                return self.piggyback(id, host);
            }
        }

        if let Some(conn) = self.conns.get_mut(id) {
            conn.client.hostname.get_or_insert_with(|| address.clone());
        }
        if reusable {
            self.register_active(id, &address);
        }

        let target = self.select_target(id, &address)?;
        let ip = match self.resolve_target(id, &target) {
            Ok(ip) => ip,
            Err(err) => return Err(self.client_fail(id, err)),
        };
        let peer = SocketAddr::new(ip, target.port);

        let has_socket = self.conns.get(id).is_some_and(|c| c.socket.is_some());
        if !has_socket {
            self.open_socket(id, peer, iface.as_deref())?;
        }

        match self.start_connect(id, peer) {
            Ok(ConnectProgress::InProgress) => return Ok(id),
            Ok(ConnectProgress::Connected) => {}
            Err(err) => return Err(self.client_fail(id, err)),
        }
        debug!(conn = %id, %peer, via = ?target.via, "connected");

        match target.via {
            Via::HttpProxy => self.send_proxy_connect(id),
            Via::Socks => self.send_socks_greeting(id),
            Via::Direct => self.send_handshake(id),
        }
    }

    /// A live connection this request can share, newest first
    fn find_piggyback_host(&self, id: ConnId, address: &str) -> Option<ConnId> {
        let conn = self.conns.get(id)?;
        let candidates =
            conn.vhost
                .registry()
                .candidates(self.id, id, address, conn.client.c_port, conn.client.tls);
        candidates.into_iter().find(|candidate| {
            let Some(host) = self.conns.get(*candidate) else {
                return false;
            };
            if host.client.keepalive_rejected {
                info!(conn = %id, host = %candidate, "defeating pipelining due to no keepalive on server");
                return false;
            }
            !host.closing
        })
    }

    fn register_active(&mut self, id: ConnId, address: &str) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.client.registered || conn.client.queued_on.is_some() {
            return;
        }
        conn.client.registered = true;
        let entry = RegistryEntry {
            worker: self.id,
            conn: id,
            host: address.to_owned(),
            port: conn.client.c_port,
            tls: conn.client.tls,
        };
        conn.vhost.registry().register(entry);
        debug!(conn = %id, host = address, "registered for reuse");
    }

    /// HTTP proxy, then SOCKS5, then direct
    fn select_target(&mut self, id: ConnId, address: &str) -> Result<Target> {
        let user_agent = self.config.user_agent.clone();
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        let vhost = Arc::clone(&conn.vhost);
        let cfg = vhost.config();

        let target = if let Some(http) = &cfg.http_proxy {
            conn.client.proxy_request = Some(proxy::connect_request(address, conn.client.c_port, &user_agent, http));
            Target {
                host: http.address.clone(),
                port: http.port,
                via: Via::HttpProxy,
            }
        } else if let Some(socks) = &cfg.socks_proxy {
            Target {
                host: socks.address.clone(),
                port: socks.port,
                via: Via::Socks,
            }
        } else {
            Target {
                host: address.to_owned(),
                port: conn.client.c_port,
                via: Via::Direct,
            }
        };
        conn.client.via = target.via;
        debug!(conn = %id, host = %target.host, port = target.port, via = ?target.via, "target");
        Ok(target)
    }

    fn resolve_target(&mut self, id: ConnId, target: &Target) -> Result<IpAddr> {
        let conn = self.conns.get(id).ok_or(Error::Closed)?;
        if let Some(ip) = conn.client.connect_addr {
            return Ok(ip);
        }
        let (ipv6, ipv6_only) = (conn.vhost.config().ipv6, conn.vhost.config().ipv6_only);

        let ips = self.resolver.resolve(&target.host, ipv6).map_err(|e| {
            let msg = if ipv6 {
                "ipv6 getaddrinfo failed"
            } else {
                "getaddrinfo failed"
            };
            Error::resolve_with(msg, e)
        })?;
        let ip = select_address(&ips, ipv6, ipv6_only)?;
        if let Some(conn) = self.conns.get_mut(id) {
            conn.client.connect_addr = Some(ip);
        }
        debug!(conn = %id, host = %target.host, %ip, "resolved");
        Ok(ip)
    }

    fn open_socket(&mut self, id: ConnId, peer: SocketAddr, iface: Option<&str>) -> Result<()> {
        let mut socket = match self.sockets.open(&peer) {
            Ok(socket) => socket,
            Err(e) => return Err(self.client_fail(id, Error::connect_io("unable to open socket", e))),
        };
        if let Err(e) = socket.set_options() {
            return Err(self.client_fail(id, Error::connect_io("set socket opts failed", e)));
        }

        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        conn.socket = Some(socket);
        conn.set_state(LrsState::WaitingConnect);
        if let Err(err) = self.insert_fds(id) {
            return Err(self.client_fail(id, err));
        }

        // visible to the event loop from here: failures take the full close
        if let Err(err) = self.change_pollfd(id, Interest::NONE, Interest::POLLIN) {
            return Err(self.client_fail(id, err));
        }
        let secs = self.config.awaiting_timeout_secs;
        self.set_timeout(id, PendingTimeout::AwaitingConnectResponse, secs);

        if let Some(iface) = iface {
            let bound = self
                .conns
                .get_mut(id)
                .and_then(|c| c.socket.as_mut())
                .map(|s| s.bind_interface(iface));
            if let Some(Err(e)) = bound {
                return Err(self.client_fail(id, Error::connect_io("unable to bind socket", e)));
            }
        }
        Ok(())
    }

    fn start_connect(&mut self, id: ConnId, peer: SocketAddr) -> Result<ConnectProgress> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        conn.peer = Some(peer);
        let socket = conn.socket.as_mut().ok_or(Error::connect("no socket"))?;

        let progress = classify_connect(socket.connect(peer)).map_err(|e| Error::connect_io("connect failed", e))?;
        if progress == ConnectProgress::Connected {
            return Ok(progress);
        }

        // a failure the stack already knows about
        match socket.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return Err(Error::connect_io("socket connect failed", e)),
        }
        self.change_pollfd(id, Interest::NONE, Interest::POLLOUT)
            .map_err(|_| Error::connect("POLLOUT set failed"))?;
        debug!(conn = %id, %peer, "connect in progress");
        Ok(progress)
    }

    fn send_proxy_connect(&mut self, id: ConnId) -> Result<ConnId> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        let request = conn.client.proxy_request.take().unwrap_or_default();
        let written = conn.socket.as_mut().map(|s| s.write(&request));
        if !matches!(written, Some(crate::transport::WriteStatus::Written(n)) if n == request.len()) {
            return Err(self.client_fail(id, Error::proxy("proxy write failed")));
        }
        let secs = self.config.awaiting_timeout_secs;
        self.set_timeout(id, PendingTimeout::AwaitingProxyResponse, secs);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.set_state(LrsState::WaitingProxyReply);
        }
        debug!(conn = %id, "sent proxy CONNECT");
        Ok(id)
    }

    fn send_socks_greeting(&mut self, id: ConnId) -> Result<ConnId> {
        let greeting = socks::greeting();
        if self.socks_send(id, &greeting).is_err() {
            return Err(self.client_fail(id, Error::proxy("socks write failed")));
        }
        let secs = self.config.awaiting_timeout_secs;
        self.set_timeout(id, PendingTimeout::AwaitingSocksGreetingReply, secs);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.set_state(LrsState::WaitingSocksGreetingReply);
        }
        debug!(conn = %id, "sent socks greeting");
        Ok(id)
    }

    /// Write one negotiation message straight to the socket; it is small
    /// enough that anything short of a full write is a failure.
    pub(crate) fn socks_send(&mut self, id: ConnId, msg: &[u8]) -> Result<()> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        match conn.socket.as_mut().map(|s| s.write(msg)) {
            Some(crate::transport::WriteStatus::Written(n)) if n == msg.len() => Ok(()),
            _ => Err(Error::proxy("socks write failed")),
        }
    }

    /// The connection is ready for its request headers: service it once
    /// straight away rather than wait for the next event.
    pub(crate) fn send_handshake(&mut self, id: ConnId) -> Result<ConnId> {
        if let Some(conn) = self.conns.get_mut(id) {
            conn.set_state(LrsState::IssueHandshake);
        }
        let secs = self.config.awaiting_timeout_secs;
        self.set_timeout(id, PendingTimeout::SentClientHandshake, secs);
        self.service_conn(id, Interest::POLLIN);
        if self.contains(id) {
            Ok(id)
        } else {
            Err(Error::connect("first service failed"))
        }
    }

    /// Report `err` and tear the connection down the way its current
    /// visibility requires. Returns `err` for propagation.
    pub(crate) fn client_fail(&mut self, id: ConnId, err: Error) -> Error {
        let msg = err.diagnostic().to_owned();
        if self.conns.get(id).is_some_and(|c| c.in_fds) {
            self.client_connection_error(id, &msg);
            self.close_free(id, &msg);
        } else {
            self.client_fail_early(id, &msg);
        }
        err
    }
}
