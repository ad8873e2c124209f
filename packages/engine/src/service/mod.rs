//! Per-worker service context
//!
//! A [`Worker`] owns a disjoint set of connections plus the resources they
//! share on one thread: the descriptor table, the header table pool, the
//! timeout list and the scratch read buffer. Readiness events enter through
//! [`Worker::service_fd`]; everything else hangs off the role table.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, trace};

pub mod close;
pub mod dispatch;
pub mod periodic;

use crate::config::{EngineConfig, VhostConfig};
use crate::conn::{ConnId, Connection, ConnectionTable, LrsState, PartialWrite, PendingTimeout, RoleTag, TimeoutList};
use crate::dns::{GaiResolver, Resolve};
use crate::error::{Error, Result};
use crate::headers::{Attach, HeaderTable, HeaderTablePool};
use crate::protocol::{CallbackAction, ChildReaper, FrameHeader, ParseOutcome, Protocol, Reason, WireCodec};
use crate::role::{cgi::CgiChannel, Role, WriteKind, WriteProtocol, CGI};
use crate::telemetry::ConnStats;
use crate::transport::{
    Interest, NullPoller, PollFdTable, Poller, ReadStatus, Socket, Socket2Factory, SocketFactory, SocketId, WriteStatus,
};
use crate::vhost::{Vhost, WorkerId};

/// Outcome of [`Worker::read_or_use_preamble`]
#[derive(Debug, PartialEq, Eq)]
pub enum RawRead {
    /// Bytes, either leftover rxflow bytes or freshly read
    Data(Vec<u8>),
    /// The peer closed in an orderly way
    Nothing,
    /// Nothing available yet
    Again,
    Failed,
}

/// One worker thread's connections and shared resources
pub struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) vhost: Arc<Vhost>,
    pub(crate) conns: ConnectionTable,
    pub(crate) fds: PollFdTable,
    pub(crate) ah_pool: HeaderTablePool,
    pub(crate) timeouts: TimeoutList,
    pub(crate) serv_buf: Vec<u8>,
    pub(crate) protocol: Box<dyn Protocol>,
    pub(crate) codec: Box<dyn WireCodec>,
    pub(crate) resolver: Box<dyn Resolve>,
    pub(crate) sockets: Box<dyn SocketFactory>,
    pub(crate) poller: Box<dyn Poller>,
    pub(crate) reaper: Option<Box<dyn ChildReaper>>,
    pub(crate) stats: Arc<ConnStats>,
    pub(crate) now: Instant,
    pub(crate) last_periodic: Option<Instant>,
    /// Connections owed a synthesised POLLIN
    pub(crate) forced: Vec<ConnId>,
}

/// Builder for [`Worker`]
pub struct WorkerBuilder {
    id: WorkerId,
    config: EngineConfig,
    vhost: Option<Arc<Vhost>>,
    protocol: Option<Box<dyn Protocol>>,
    codec: Option<Box<dyn WireCodec>>,
    resolver: Option<Box<dyn Resolve>>,
    sockets: Option<Box<dyn SocketFactory>>,
    poller: Option<Box<dyn Poller>>,
    reaper: Option<Box<dyn ChildReaper>>,
    stats: Option<Arc<ConnStats>>,
    now: Option<Instant>,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self {
            id: WorkerId::default(),
            config: EngineConfig::default(),
            vhost: None,
            protocol: None,
            codec: None,
            resolver: None,
            sockets: None,
            poller: None,
            reaper: None,
            stats: None,
            now: None,
        }
    }
}

impl WorkerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn worker_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Default destination group for client connections
    #[must_use]
    pub fn vhost(mut self, vhost: Arc<Vhost>) -> Self {
        self.vhost = Some(vhost);
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: impl Protocol + 'static) -> Self {
        self.protocol = Some(Box::new(protocol));
        self
    }

    #[must_use]
    pub fn codec(mut self, codec: impl WireCodec + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    #[must_use]
    pub fn sockets(mut self, sockets: impl SocketFactory + 'static) -> Self {
        self.sockets = Some(Box::new(sockets));
        self
    }

    #[must_use]
    pub fn poller(mut self, poller: impl Poller + 'static) -> Self {
        self.poller = Some(Box::new(poller));
        self
    }

    #[must_use]
    pub fn reaper(mut self, reaper: impl ChildReaper + 'static) -> Self {
        self.reaper = Some(Box::new(reaper));
        self
    }

    /// Share a statistics collector across workers
    #[must_use]
    pub fn stats(mut self, stats: Arc<ConnStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Starting clock value; later values come with each event
    #[must_use]
    pub fn start_time(mut self, now: Instant) -> Self {
        self.now = Some(now);
        self
    }

    /// # Errors
    ///
    /// `Error::Config` when the configuration does not validate or the
    /// protocol or codec is missing.
    pub fn build(self) -> Result<Worker> {
        self.config.validate().map_err(Error::config)?;
        let vhost = match self.vhost {
            Some(vhost) => vhost,
            None => Arc::new(Vhost::new(VhostConfig::default())?),
        };
        let protocol = self.protocol.ok_or_else(|| Error::config("a protocol is required"))?;
        let codec = self.codec.ok_or_else(|| Error::config("a wire codec is required"))?;

        let config = Arc::new(self.config);
        info!(
            worker = %self.id,
            vhost = vhost.name(),
            ah_pool = config.ah_pool_size,
            serv_buf = config.pt_serv_buf_size,
            "worker created"
        );
        Ok(Worker {
            id: self.id,
            ah_pool: HeaderTablePool::new(config.ah_pool_size, config.ah_data_size, config.ah_rx_size),
            serv_buf: vec![0; config.pt_serv_buf_size],
            config,
            vhost,
            conns: ConnectionTable::new(),
            fds: PollFdTable::new(),
            timeouts: TimeoutList::new(),
            protocol,
            codec,
            resolver: self.resolver.unwrap_or_else(|| Box::new(GaiResolver::new())),
            sockets: self.sockets.unwrap_or_else(|| Box::new(Socket2Factory::new())),
            poller: self.poller.unwrap_or_else(|| Box::new(NullPoller)),
            reaper: self.reaper,
            stats: self.stats.unwrap_or_default(),
            now: self.now.unwrap_or_else(Instant::now),
            last_periodic: None,
            forced: Vec::new(),
        })
    }
}

impl Worker {
    #[must_use]
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn default_vhost(&self) -> &Arc<Vhost> {
        &self.vhost
    }

    #[must_use]
    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_handle(&self) -> Arc<ConnStats> {
        Arc::clone(&self.stats)
    }

    /// Clock value of the last event
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Advance the worker clock without servicing anything
    pub fn set_now(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    #[must_use]
    pub fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(id)
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: ConnId) -> bool {
        self.conns.contains(id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.conns.ids()
    }

    /// Connection registered under `socket`
    #[must_use]
    pub fn conn_by_socket(&self, socket: SocketId) -> Option<ConnId> {
        self.fds.get(socket).map(|pfd| pfd.conn)
    }

    #[must_use]
    pub fn header_pool(&self) -> &HeaderTablePool {
        &self.ah_pool
    }

    #[must_use]
    pub fn pending_timeout(&self, id: ConnId) -> Option<PendingTimeout> {
        self.timeouts.get(id)
    }

    /// Interest currently registered for the connection's socket
    #[must_use]
    pub fn pollfd_events(&self, id: ConnId) -> Interest {
        self.conns
            .get(id)
            .and_then(Connection::socket_id)
            .and_then(|sid| self.fds.get(sid))
            .map_or(Interest::NONE, |pfd| pfd.events)
    }

    /// Whether a readiness event means there is input to take: POLLIN was
    /// reported and is wanted, or bytes wait in an rxflow buffer that flow
    /// control no longer holds back.
    #[must_use]
    pub fn rx_ready(&self, id: ConnId, revents: Interest) -> bool {
        if (revents & self.pollfd_events(id)).contains(Interest::POLLIN) {
            return true;
        }
        revents.contains(Interest::POLLIN)
            && self
                .conns
                .get(id)
                .is_some_and(|c| c.flow.has_buffer() && !c.flow.is_flowcontrolled())
    }

    /// Clear then set interest bits on the connection's socket. A connection
    /// without a registered socket is left alone.
    ///
    /// # Errors
    ///
    /// `Error::Connect` when the poller refuses the change.
    pub fn change_pollfd(&mut self, id: ConnId, clear: Interest, set: Interest) -> Result<()> {
        let Some(sid) = self.conns.get(id).and_then(Connection::socket_id) else {
            return Ok(());
        };
        let Some(pfd) = self.fds.get_mut(sid) else {
            return Ok(());
        };
        let events = (pfd.events & !clear) | set;
        if events == pfd.events {
            return Ok(());
        }
        pfd.events = events;
        trace!(conn = %id, socket = %sid, events = events.bits(), "pollfd");
        self.poller
            .set_interest(sid, events)
            .map_err(|e| Error::connect_io("pollfd change failed", e))
    }

    /// Register the connection's socket with the descriptor table and poller
    pub(crate) fn insert_fds(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        let sid = conn.socket_id().ok_or(Error::connect("insert wsi failed"))?;
        if !self.fds.insert(sid, id) {
            return Err(Error::connect("insert wsi failed"));
        }
        if let Err(err) = self.poller.insert(sid, Interest::NONE) {
            self.fds.remove(sid);
            return Err(Error::connect_io("insert wsi failed", err));
        }
        conn.in_fds = true;
        debug!(conn = %id, socket = %sid, "inserted into fds");
        Ok(())
    }

    pub(crate) fn remove_fds(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if !conn.in_fds {
            return;
        }
        conn.in_fds = false;
        let Some(sid) = conn.socket_id() else {
            return;
        };
        self.fds.remove(sid);
        if let Err(err) = self.poller.remove(sid) {
            debug!(conn = %id, socket = %sid, error = %err, "poller remove failed");
        }
    }

    /// Bring poll interest in line with the flow-control state, if it changed
    pub fn sync_rx_flow(&mut self, id: ConnId) {
        if self.conns.get(id).is_some_and(|c| c.flow.change_pending) {
            self.apply_rx_flow(id);
        }
    }

    /// POLLIN is armed only when no reason holds receive off and no rxflow
    /// buffer is left to drain.
    pub fn apply_rx_flow(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.flow.change_pending = false;
        let allow = !conn.flow.is_flowcontrolled() && !conn.flow.has_buffer();
        debug!(conn = %id, allow, bitmap = conn.flow.bitmap(), "rx flow");
        let result = if allow {
            self.change_pollfd(id, Interest::NONE, Interest::POLLIN)
        } else {
            self.change_pollfd(id, Interest::POLLIN, Interest::NONE)
        };
        if let Err(err) = result {
            debug!(conn = %id, error = %err, "rx flow pollfd change failed");
        }
    }

    /// Keep bytes read from `id` that the upper layer did not take. They are
    /// handed back before anything else on the next readable pass. Returns
    /// false when the connection is unknown or still draining an earlier
    /// buffer, which then keeps its place.
    pub fn rxflow_cache(&mut self, id: ConnId, remainder: &[u8]) -> bool {
        let Some(conn) = self.conns.get_mut(id) else {
            return false;
        };
        if remainder.is_empty() || !conn.flow.cache(remainder) {
            return false;
        }
        debug!(conn = %id, len = remainder.len(), "rxflow cached");
        self.apply_rx_flow(id);
        true
    }

    /// Deliver `reason` to the user protocol for `id`
    pub fn callback(&mut self, id: ConnId, reason: Reason<'_>) -> CallbackAction {
        let Some(conn) = self.conns.get_mut(id) else {
            return CallbackAction::Continue;
        };
        let action = self.protocol.callback(conn, reason);
        self.apply_user_requests(id);
        action
    }

    /// Act on requests made on the connection during a callback or a codec
    /// read: queued writes, writable and flow-control changes, a keepalive
    /// PONG
    pub fn apply_user_requests(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        let queued = std::mem::take(&mut conn.tx_pending);
        let writable = std::mem::take(&mut conn.writable_requested);
        let flow = conn.flow.change_pending;
        let pong = std::mem::take(&mut conn.ws.pong_received);
        if pong && self.timeouts.get(id) == Some(PendingTimeout::WsPongCheckGetPong) {
            trace!(conn = %id, "keepalive pong");
            self.timeouts.clear(id);
        }
        for (buf, wp) in queued {
            if let Err(err) = self.write(id, &buf, wp) {
                debug!(conn = %id, error = %err, "queued write failed");
                break;
            }
        }
        if writable {
            if let Err(err) = self.callback_on_writable(id) {
                debug!(conn = %id, error = %err, "writable request failed");
            }
        }
        if flow {
            self.apply_rx_flow(id);
        }
    }

    /// Ask for a writable event on `id`.
    ///
    /// # Errors
    ///
    /// `Error::Closed` for an unknown connection, or the pollfd failure.
    pub fn callback_on_writable(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        if conn.socket_is_permanently_unusable {
            return Ok(());
        }

        if conn.h2.http2_substream && conn.socket.is_none() {
            conn.h2.requested_pollout = true;
            let nwsi = self.network_id(id);
            if nwsi == id {
                debug!(conn = %id, "orphan stream wants writable");
                return Ok(());
            }
            trace!(conn = %id, network = %nwsi, "stream wants writable");
            return self.callback_on_writable(nwsi);
        }

        if conn.socket.is_none() {
            // a queued waiter writes through its host
            if let Some(host) = conn.client.queued_on {
                return self.callback_on_writable(host);
            }
            return Ok(());
        }

        if conn.handling_pollout {
            conn.leave_pollout_active = true;
            return Ok(());
        }
        self.change_pollfd(id, Interest::NONE, Interest::POLLOUT)
    }

    /// The connection that owns the socket `id` writes through: the network
    /// connection of a stream, or the host of a queued waiter.
    #[must_use]
    pub fn network_id(&self, id: ConnId) -> ConnId {
        let mut cur = id;
        while let Some(conn) = self.conns.get(cur) {
            if conn.socket.is_some() {
                break;
            }
            let next = if conn.h2.http2_substream {
                conn.parent
            } else {
                conn.client.queued_on
            };
            match next {
                Some(next) if next != cur => cur = next,
                _ => break,
            }
        }
        cur
    }

    /// Get a header table for `id`, or queue it on the pool.
    pub fn ah_attach(&mut self, id: ConnId) -> Attach {
        if let Some(ah) = self.conns.get(id).and_then(|c| c.ah) {
            return Attach::Attached(ah);
        }
        let attach = self.ah_pool.attach(id, self.now);
        match attach {
            Attach::Attached(ah) => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.ah = Some(ah);
                }
                debug!(conn = %id, ah = %ah, "ah attached");
            }
            Attach::Queued => info!(conn = %id, "no header table free, queued"),
        }
        attach
    }

    /// Release the header table even mid-parse. A client waiting with its
    /// connect parameters resumes connecting; any other waiter is owed a
    /// synthesised POLLIN.
    pub fn ah_detach_forced(&mut self, id: ConnId) {
        let ah = match self.conns.get_mut(id).and_then(|c| c.ah.take()) {
            Some(ah) => ah,
            None => {
                self.ah_pool.remove_waiter(id);
                return;
            }
        };
        if let Some(table) = self.ah_pool.get_mut(ah) {
            table.force_to_detachable_state();
        }
        debug!(conn = %id, ah = %ah, "ah detached");

        let mut handover = self.ah_pool.detach(ah, self.now);
        while let Some((next, ah)) = handover.take() {
            let Some(conn) = self.conns.get_mut(next) else {
                error!(conn = %next, ah = %ah, "stale header table waiter");
                handover = self.ah_pool.detach(ah, self.now);
                continue;
            };
            conn.ah = Some(ah);
            info!(conn = %next, ah = %ah, "header table handed to waiter");

            let resume_client =
                conn.role.is_client() && conn.state == LrsState::Unconnected && conn.client.stash.is_some();
            if resume_client {
                if let Err(err) = self.connect_via_info2(next) {
                    debug!(conn = %next, error = %err, "resumed connect failed");
                }
            } else if !self.forced.contains(&next) {
                self.forced.push(next);
            }
        }
    }

    #[must_use]
    pub fn header_table_of(&self, id: ConnId) -> Option<&HeaderTable> {
        let ah = self.conns.get(id)?.ah?;
        self.ah_pool.get(ah)
    }

    pub fn header_table_of_mut(&mut self, id: ConnId) -> Option<&mut HeaderTable> {
        let ah = self.conns.get(id)?.ah?;
        self.ah_pool.get_mut(ah)
    }

    /// Owners of header tables that still hold unparsed rx
    #[must_use]
    pub fn header_table_owners_with_rx(&self) -> Vec<ConnId> {
        self.ah_pool
            .assigned()
            .filter(|(ah, _, _)| self.ah_pool.get(*ah).is_some_and(HeaderTable::has_rx_pending))
            .map(|(_, owner, _)| owner)
            .collect()
    }

    /// Borrow the scratch read buffer at its configured size
    pub(crate) fn take_serv_buf(&mut self) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.serv_buf);
        buf.resize(self.config.pt_serv_buf_size, 0);
        buf
    }

    pub(crate) fn restore_serv_buf(&mut self, buf: Vec<u8>) {
        if buf.capacity() >= self.serv_buf.capacity() {
            self.serv_buf = buf;
        }
    }

    /// Leftover rxflow bytes if any, otherwise a read of at most `cap` bytes
    /// from the socket.
    pub(crate) fn read_or_use_preamble(&mut self, id: ConnId, cap: usize) -> RawRead {
        let Some(conn) = self.conns.get_mut(id) else {
            return RawRead::Failed;
        };

        if let Some((buf, pos)) = conn.flow.take_buffer() {
            let end = pos.saturating_add(cap).min(buf.len());
            let bytes = buf[pos..end].to_vec();
            let drained = end >= buf.len();
            if drained {
                conn.flow.free_buffer();
            } else {
                conn.flow.restore_buffer(buf, end);
            }
            debug!(conn = %id, len = bytes.len(), drained, "using rxflow preamble");
            if drained {
                self.apply_rx_flow(id);
            }
            return RawRead::Data(bytes);
        }

        let Some(socket) = conn.socket.as_mut() else {
            return RawRead::Failed;
        };
        let mut buf = std::mem::take(&mut self.serv_buf);
        buf.resize(self.config.pt_serv_buf_size, 0);
        let cap = cap.min(buf.len());
        match socket.read(&mut buf[..cap]) {
            ReadStatus::Data(n) => {
                buf.truncate(n);
                RawRead::Data(buf)
            }
            ReadStatus::Closed => {
                self.serv_buf = buf;
                RawRead::Nothing
            }
            ReadStatus::MoreService => {
                self.serv_buf = buf;
                RawRead::Again
            }
            ReadStatus::Error => {
                self.serv_buf = buf;
                RawRead::Failed
            }
        }
    }

    pub(crate) fn codec_read_h1(&mut self, id: ConnId, bytes: &[u8]) -> ParseOutcome {
        let Some(conn) = self.conns.get_mut(id) else {
            return ParseOutcome::Closed;
        };
        let ah = conn.ah.and_then(|ah| self.ah_pool.get_mut(ah));
        self.codec.read_h1(conn, ah, bytes)
    }

    pub(crate) fn codec_read_h2(&mut self, id: ConnId, bytes: &[u8]) -> ParseOutcome {
        let Some(conn) = self.conns.get_mut(id) else {
            return ParseOutcome::Closed;
        };
        self.codec.read_h2(conn, bytes)
    }

    pub(crate) fn encode_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
        self.codec.encode_frame(header, payload)
    }

    pub(crate) fn encode_ws_frame(&mut self, id: ConnId, opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        match self.conns.get(id) {
            Some(conn) => self.codec.encode_ws_frame(conn, opcode, fin, payload),
            None => crate::protocol::ws_frame(opcode, fin, payload),
        }
    }

    /// Let the codec accept a websocket upgrade and send whatever answer
    /// it queued, while the connection still has its HTTP role.
    pub(crate) fn process_ws_upgrade(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        self.codec.process_ws_upgrade(conn)?;
        self.apply_user_requests(id);
        Ok(())
    }

    /// Hand bytes to the transport. Whatever it does not take is kept as the
    /// pending partial write and POLLOUT is armed; the whole length counts as
    /// accepted.
    ///
    /// # Errors
    ///
    /// Fails when a partial write is already pending, or the socket is gone
    /// or broken.
    pub fn issue_raw(&mut self, id: ConnId, buf: &[u8]) -> Result<usize> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        if conn.trunc.is_some() {
            error!(conn = %id, len = buf.len(), "write while a partial write is pending");
            return Err(Error::protocol("partial write pending"));
        }
        if conn.socket_is_permanently_unusable {
            return Err(Error::Closed);
        }
        let socket = conn.socket.as_mut().ok_or(Error::Closed)?;
        let written = match socket.write(buf) {
            WriteStatus::Written(n) => n.min(buf.len()),
            WriteStatus::MoreService => 0,
            WriteStatus::Error => {
                conn.socket_is_permanently_unusable = true;
                return Err(Error::Closed);
            }
        };
        trace!(conn = %id, len = buf.len(), written, "issue raw");
        if written < buf.len() {
            debug!(conn = %id, left = buf.len() - written, "partial write kept");
            conn.trunc = Some(PartialWrite {
                buf: buf[written..].to_vec(),
                offset: 0,
            });
            self.callback_on_writable(id)?;
        }
        Ok(buf.len())
    }

    /// Resume the pending partial write. Returns whether it completed.
    ///
    /// # Errors
    ///
    /// Fails on a broken socket, and once the last bytes of a connection
    /// flushing before close are out.
    pub fn flush_partial(&mut self, id: ConnId) -> Result<bool> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        let Some(mut trunc) = conn.trunc.take() else {
            return Ok(true);
        };
        let socket = conn.socket.as_mut().ok_or(Error::Closed)?;
        match socket.write(trunc.remaining()) {
            WriteStatus::Written(n) => trunc.offset += n,
            WriteStatus::MoreService => {}
            WriteStatus::Error => {
                conn.socket_is_permanently_unusable = true;
                return Err(Error::Closed);
            }
        }

        let done = trunc.offset >= trunc.buf.len();
        if done {
            info!(conn = %id, "partial send completed");
            if conn.state == LrsState::FlushingBeforeClose {
                return Err(Error::Closed);
            }
        } else {
            conn.trunc = Some(trunc);
        }
        self.callback_on_writable(id)?;
        Ok(done)
    }

    /// Write `buf` as `wp` on `id`, through the role's framer when it has
    /// one. Writes the state does not allow are dropped as `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Transport failures and a pending partial write.
    pub fn write(&mut self, id: ConnId, buf: &[u8], wp: WriteProtocol) -> Result<usize> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        if conn.socket_is_permanently_unusable {
            return Err(Error::Closed);
        }
        let ops = conn.ops;
        if let Some(result) = ops.frame_outbound_write(self, id, buf, wp) {
            return result;
        }

        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        let legal_close = conn.state.is_closing() && wp.kind == WriteKind::Close;
        if !conn.state.accepts_payload() && !legal_close {
            info!(conn = %id, state = ?conn.state, kind = ?wp.kind, "binning write");
            return Ok(0);
        }
        if matches!(wp.kind, WriteKind::Http | WriteKind::HttpFinal) && conn.http.tx_content_length > 0 {
            conn.http.tx_content_remain = conn.http.tx_content_remain.saturating_sub(buf.len() as u64);
        }
        let nwsi = self.network_id(id);
        self.issue_raw(nwsi, buf)
    }

    pub fn set_timeout(&mut self, id: ConnId, reason: PendingTimeout, secs: u64) {
        trace!(conn = %id, ?reason, secs, "timeout set");
        self.timeouts.set(id, reason, secs, self.now);
    }

    pub fn clear_timeout(&mut self, id: ConnId) {
        self.timeouts.clear(id);
    }

    /// Take over an accepted or foreign socket with `role`.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be registered or the role refuses it;
    /// the connection is gone by then.
    pub fn adopt_socket(&mut self, socket: Box<dyn Socket>, role: &'static dyn Role) -> Result<ConnId> {
        let vhost = Arc::clone(&self.vhost);
        let id = self
            .conns
            .insert_with(|id| Connection::new(id, RoleTag::Unbound, LrsState::Unconnected, role, vhost));
        ConnStats::bump(&self.stats.created);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.socket = Some(socket);
        }
        if let Err(err) = self.insert_fds(id) {
            self.conns.remove(id);
            ConnStats::bump(&self.stats.closed);
            return Err(err);
        }

        match role.adopt(self, id) {
            Some(Ok(())) => {
                info!(conn = %id, role = role.name(), "socket adopted");
                Ok(id)
            }
            Some(Err(err)) => {
                self.close_free(id, "adopt failed");
                Err(err)
            }
            None => {
                self.close_free(id, "adopt unsupported");
                Err(Error::config(format!("role {} cannot adopt a socket", role.name())))
            }
        }
    }

    /// Attach one stdio pipe of a child process to `parent`
    ///
    /// # Errors
    ///
    /// Fails when the parent is unknown or the pipe cannot be registered.
    pub fn adopt_cgi_channel(&mut self, parent: ConnId, socket: Box<dyn Socket>, channel: CgiChannel) -> Result<ConnId> {
        let vhost = Arc::clone(self.conns.get(parent).ok_or(Error::Closed)?.vhost());
        let id = self
            .conns
            .insert_with(|id| Connection::new(id, RoleTag::Cgi, LrsState::Established, &CGI, vhost));
        ConnStats::bump(&self.stats.created);
        if let Some(conn) = self.conns.get_mut(id) {
            conn.socket = Some(socket);
            conn.cgi_channel = Some(channel);
            conn.parent = Some(parent);
        }
        if let Some(parent_conn) = self.conns.get_mut(parent) {
            parent_conn.children.push(id);
        }

        if let Err(err) = self.insert_fds(id) {
            if let Some(parent_conn) = self.conns.get_mut(parent) {
                parent_conn.children.retain(|c| *c != id);
            }
            self.conns.remove(id);
            ConnStats::bump(&self.stats.closed);
            return Err(err);
        }
        if let Err(err) = self.change_pollfd(id, Interest::NONE, channel.interest()) {
            self.close_free(id, "cgi pollfd failed");
            return Err(err);
        }
        debug!(conn = %id, parent = %parent, ?channel, "cgi channel adopted");
        Ok(id)
    }

    /// Tell the parent of a cgi channel that the channel is ready
    pub(crate) fn cgi_notify(&mut self, parent: ConnId, channel: CgiChannel, stdwsi: ConnId) -> CallbackAction {
        self.callback(parent, Reason::Cgi { channel, stdwsi })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("vhost", &self.vhost.name())
            .field("conns", &self.conns.len())
            .field("fds", &self.fds.len())
            .field("ah_in_use", &self.ah_pool.in_use())
            .field("timeouts", &self.timeouts.len())
            .finish_non_exhaustive()
    }
}
