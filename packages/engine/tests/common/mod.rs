//! In-memory sockets, resolver, codec and a recording protocol

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::header::HeaderName;
use wirerole_engine::config::{EngineConfig, VhostConfig};
use wirerole_engine::conn::{ConnId, Connection};
use wirerole_engine::dns::{Resolve, ResolverError};
use wirerole_engine::headers::{HdrToken, HeaderTable};
use wirerole_engine::protocol::{CallbackAction, ChildReaper, ParseOutcome, Protocol, Reason, WireCodec};
use wirerole_engine::role::{CgiChannel, WriteKind};
use wirerole_engine::service::Worker;
use wirerole_engine::transport::{Interest, PollEvent, ReadStatus, Socket, SocketFactory, SocketId, Transport, WriteStatus};
use wirerole_engine::vhost::Vhost;

pub const EXAMPLE_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

#[derive(Debug, Default)]
pub struct SockState {
    pub inbound: VecDeque<u8>,
    pub written: Vec<u8>,
    pub peer_closed: bool,
    pub connect_in_progress: bool,
    pub h2: bool,
    /// Accept at most this many bytes per write
    pub write_limit: Option<usize>,
    pub connected_to: Option<SocketAddr>,
    pub iface: Option<String>,
}

#[derive(Debug, Default)]
struct NetInner {
    sockets: Vec<Arc<Mutex<SockState>>>,
    opened: Vec<SocketAddr>,
    connect_in_progress: bool,
    h2: bool,
}

/// Shared view of every fake socket a test created
#[derive(Debug, Clone, Default)]
pub struct Net {
    inner: Arc<Mutex<NetInner>>,
}

pub struct FakeSocket {
    id: SocketId,
    state: Arc<Mutex<SockState>>,
}

impl Net {
    fn lock(&self) -> std::sync::MutexGuard<'_, NetInner> {
        self.inner.lock().expect("net lock")
    }

    /// Sockets opened from now on report "in progress" on connect
    pub fn set_connect_in_progress(&self, on: bool) {
        self.lock().connect_in_progress = on;
    }

    /// Sockets opened from now on have negotiated h2
    pub fn set_h2(&self, on: bool) {
        self.lock().h2 = on;
    }

    /// A socket outside the factory, for adoption
    pub fn socket(&self) -> (Box<dyn Socket>, SocketId) {
        let mut inner = self.lock();
        let state = Arc::new(Mutex::new(SockState::default()));
        inner.sockets.push(Arc::clone(&state));
        let id = SocketId(inner.sockets.len() as u64);
        (Box::new(FakeSocket { id, state }), id)
    }

    fn state(&self, id: SocketId) -> Arc<Mutex<SockState>> {
        let inner = self.lock();
        Arc::clone(&inner.sockets[(id.0 - 1) as usize])
    }

    pub fn push(&self, id: SocketId, bytes: &[u8]) {
        self.state(id).lock().expect("sock lock").inbound.extend(bytes.iter().copied());
    }

    pub fn hang_up(&self, id: SocketId) {
        self.state(id).lock().expect("sock lock").peer_closed = true;
    }

    pub fn set_write_limit(&self, id: SocketId, limit: Option<usize>) {
        self.state(id).lock().expect("sock lock").write_limit = limit;
    }

    pub fn written(&self, id: SocketId) -> Vec<u8> {
        self.state(id).lock().expect("sock lock").written.clone()
    }

    pub fn written_text(&self, id: SocketId) -> String {
        String::from_utf8_lossy(&self.written(id)).into_owned()
    }

    pub fn clear_written(&self, id: SocketId) {
        self.state(id).lock().expect("sock lock").written.clear();
    }

    pub fn connected_to(&self, id: SocketId) -> Option<SocketAddr> {
        self.state(id).lock().expect("sock lock").connected_to
    }

    /// Addresses handed to the factory, in order
    pub fn opened(&self) -> Vec<SocketAddr> {
        self.lock().opened.clone()
    }
}

impl Transport for FakeSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadStatus {
        let mut state = self.state.lock().expect("sock lock");
        if state.inbound.is_empty() {
            return if state.peer_closed {
                ReadStatus::Closed
            } else {
                ReadStatus::MoreService
            };
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        ReadStatus::Data(n)
    }

    fn write(&mut self, buf: &[u8]) -> WriteStatus {
        let mut state = self.state.lock().expect("sock lock");
        let n = state.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        if n == 0 && !buf.is_empty() {
            return WriteStatus::MoreService;
        }
        state.written.extend_from_slice(&buf[..n]);
        WriteStatus::Written(n)
    }

    fn negotiated_h2(&self) -> bool {
        self.state.lock().expect("sock lock").h2
    }
}

impl Socket for FakeSocket {
    fn set_options(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn bind_interface(&mut self, iface: &str) -> io::Result<()> {
        self.state.lock().expect("sock lock").iface = Some(iface.to_string());
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut state = self.state.lock().expect("sock lock");
        state.connected_to = Some(addr);
        if std::mem::take(&mut state.connect_in_progress) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(())
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }
}

impl SocketFactory for Net {
    fn open(&mut self, addr: &SocketAddr) -> io::Result<Box<dyn Socket>> {
        let (in_progress, h2) = {
            let mut inner = self.lock();
            inner.opened.push(*addr);
            (inner.connect_in_progress, inner.h2)
        };
        let (socket, id) = self.socket();
        {
            let state = self.state(id);
            let mut state = state.lock().expect("sock lock");
            state.connect_in_progress = in_progress;
            state.h2 = h2;
        }
        Ok(socket)
    }
}

/// Resolver answering from a fixed table; address literals resolve to
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct FakeDns {
    table: Arc<Mutex<HashMap<String, Vec<IpAddr>>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl FakeDns {
    pub fn with(host: &str, ips: &[IpAddr]) -> Self {
        let dns = Self::default();
        dns.add(host, ips);
        dns
    }

    pub fn add(&self, host: &str, ips: &[IpAddr]) {
        self.table.lock().expect("dns lock").insert(host.to_string(), ips.to_vec());
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().expect("dns lock").clone()
    }
}

impl Resolve for FakeDns {
    fn resolve(&mut self, host: &str, ipv6: bool) -> Result<Vec<IpAddr>, ResolverError> {
        self.lookups.lock().expect("dns lock").push(host.to_string());
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let table = self.table.lock().expect("dns lock");
        let ips: Vec<IpAddr> = table
            .get(host)
            .ok_or_else(|| ResolverError::no_addresses(host))?
            .iter()
            .copied()
            .filter(|ip| ipv6 || ip.is_ipv4())
            .collect();
        if ips.is_empty() {
            return Err(ResolverError::no_addresses(host));
        }
        Ok(ips)
    }
}

/// Knobs a test turns on the codec after the worker owns it
#[derive(Debug, Clone, Default)]
pub struct CodecControl {
    /// Most bytes each h2 read consumes, one entry per read; all when empty
    budget: Arc<Mutex<VecDeque<usize>>>,
    /// Request heads the next h2 reads report, one per read
    heads: Arc<Mutex<VecDeque<(u32, Vec<(HdrToken, String)>)>>>,
    refuse_upgrade: Arc<Mutex<bool>>,
    /// Websocket payload taken by the reader
    ws_rx: Arc<Mutex<Vec<u8>>>,
}

impl CodecControl {
    pub fn budget(&self, caps: &[usize]) {
        self.budget.lock().expect("budget lock").extend(caps.iter().copied());
    }

    pub fn stream_head(&self, sid: u32, headers: &[(HdrToken, &str)]) {
        let headers = headers.iter().map(|(t, v)| (*t, (*v).to_string())).collect();
        self.heads.lock().expect("heads lock").push_back((sid, headers));
    }

    pub fn refuse_upgrade(&self, on: bool) {
        *self.refuse_upgrade.lock().expect("refuse lock") = on;
    }

    pub fn ws_rx(&self) -> Vec<u8> {
        self.ws_rx.lock().expect("ws lock").clone()
    }
}

/// Minimal HTTP/1 tokenizer and request writer. Websocket input is one
/// unmasked frame per read with a short payload.
#[derive(Debug, Default)]
pub struct TestCodec {
    partial: HashMap<ConnId, Vec<u8>>,
    h2_rx: Arc<Mutex<Vec<u8>>>,
    control: CodecControl,
}

impl TestCodec {
    pub fn h2_rx(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.h2_rx)
    }

    pub fn control(&self) -> CodecControl {
        self.control.clone()
    }

    fn read_ws(&mut self, conn: &mut Connection, buf: &[u8]) -> ParseOutcome {
        let opcode = buf.first().map_or(0, |b| b & 0x0f);
        let payload = buf.get(2..).unwrap_or_default();
        match opcode {
            0x8 => {
                if !conn.ws_close_received(payload) {
                    return ParseOutcome::Closed;
                }
            }
            0x9 => conn.ws_ping_received(payload),
            0xa => conn.ws_pong_received(),
            _ => self.control.ws_rx.lock().expect("ws lock").extend_from_slice(payload),
        }
        ParseOutcome::Consumed(buf.len())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(ah: &mut HeaderTable, head: &str) -> bool {
    let mut lines = head.split("\r\n");
    let Some(status) = lines.next() else {
        return false;
    };
    let Some((version, rest)) = status.split_once(' ') else {
        return false;
    };
    let token = match version {
        "HTTP/1.1" => Some(HdrToken::Http),
        "HTTP/1.0" => Some(HdrToken::Http1_0),
        // a request line
        _ if status.ends_with(" HTTP/1.1") || status.ends_with(" HTTP/1.0") => None,
        _ => return false,
    };
    if let Some(token) = token {
        if ah.simple_create(token, rest).is_err() {
            return false;
        }
    }
    for line in lines.filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
            return false;
        };
        let Some(token) = HdrToken::from_header_name(&name) else {
            continue;
        };
        if ah.simple_create(token, value.trim()).is_err() {
            return false;
        }
    }
    true
}

impl WireCodec for TestCodec {
    fn read_h1(&mut self, conn: &mut Connection, ah: Option<&mut HeaderTable>, buf: &[u8]) -> ParseOutcome {
        let Some(ah) = ah else {
            if conn.role().is_ws() {
                return self.read_ws(conn, buf);
            }
            return ParseOutcome::Closed;
        };
        let mut pending = self.partial.remove(&conn.id()).unwrap_or_default();
        let already = pending.len();
        pending.extend_from_slice(buf);
        let Some(end) = find(&pending, b"\r\n\r\n") else {
            self.partial.insert(conn.id(), pending);
            return ParseOutcome::Consumed(buf.len());
        };
        let head = String::from_utf8_lossy(&pending[..end]).into_owned();
        if !parse_head(ah, &head) {
            return ParseOutcome::Closed;
        }
        conn.set_hdr_parsing_completed(true);
        ParseOutcome::Consumed(end + 4 - already)
    }

    fn read_h2(&mut self, conn: &mut Connection, buf: &[u8]) -> ParseOutcome {
        let cap = self.control.budget.lock().expect("budget lock").pop_front();
        let n = cap.map_or(buf.len(), |cap| cap.min(buf.len()));
        self.h2_rx.lock().expect("h2 lock").extend_from_slice(&buf[..n]);
        let head = self.control.heads.lock().expect("heads lock").pop_front();
        if let Some((sid, headers)) = head {
            assert!(conn.h2_stream_head(sid, headers), "heads arrive on a network connection");
        }
        ParseOutcome::Consumed(n)
    }

    fn client_handshake(&mut self, _conn: &Connection, ah: &HeaderTable) -> Option<Vec<u8>> {
        let method = ah.get(HdrToken::ClientMethod).unwrap_or("GET");
        let uri = ah.get(HdrToken::ClientUri)?;
        let host = ah.get(HdrToken::ClientHost).unwrap_or_default();
        Some(format!("{method} {uri} HTTP/1.1\r\nHost: {host}\r\n\r\n").into_bytes())
    }

    fn h2_preface(&mut self, _conn: &Connection) -> Vec<u8> {
        b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec()
    }

    fn process_ws_upgrade(&mut self, conn: &mut Connection) -> wirerole_engine::Result<()> {
        if *self.control.refuse_upgrade.lock().expect("refuse lock") {
            return Err(wirerole_engine::Error::protocol("upgrade refused"));
        }
        if !conn.h2().http2_substream {
            conn.send(b"HTTP/1.1 101 Switching Protocols\r\n\r\n", WriteKind::HttpHeaders);
        }
        Ok(())
    }
}

/// What the user protocol was told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ev {
    Cce(String),
    ClientHttpWriteable,
    FilterPre,
    Established,
    Rx,
    Read(Vec<u8>),
    Completed,
    Closed,
    RawAdopt,
    RawRx(Vec<u8>),
    RawWriteable,
    RawClose,
    Cgi(CgiChannel),
    CgiTerminated,
    Http,
    HttpWriteable,
    ServerWriteable,
    WsClosed,
    Other,
}

/// How the recording protocol answers
#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    pub refuse_established: bool,
    pub hold_rx: bool,
    pub raw_echo: bool,
    pub close_on_completed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(ConnId, Ev)>>>,
    script: Arc<Mutex<Script>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<(ConnId, Ev)> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn of(&self, id: ConnId) -> Vec<Ev> {
        self.events().into_iter().filter(|(c, _)| *c == id).map(|(_, e)| e).collect()
    }

    pub fn count(&self, id: ConnId, pred: impl Fn(&Ev) -> bool) -> usize {
        self.of(id).iter().filter(|e| pred(e)).count()
    }

    pub fn script(&self, update: impl FnOnce(&mut Script)) {
        update(&mut self.script.lock().expect("script lock"));
    }

    /// Body bytes delivered to `id`, concatenated
    pub fn body(&self, id: ConnId) -> Vec<u8> {
        self.of(id)
            .into_iter()
            .filter_map(|e| match e {
                Ev::Read(bytes) => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl Protocol for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn callback(&mut self, conn: &mut Connection, reason: Reason<'_>) -> CallbackAction {
        let script = *self.script.lock().expect("script lock");
        let ev = match reason {
            Reason::ClientConnectionError(msg) => Ev::Cce(msg.to_string()),
            Reason::ClientHttpWriteable => Ev::ClientHttpWriteable,
            Reason::ClientFilterPreEstablish => Ev::FilterPre,
            Reason::EstablishedClientHttp => Ev::Established,
            Reason::ReceiveClientHttp => Ev::Rx,
            Reason::ReceiveClientHttpRead(bytes) => Ev::Read(bytes.to_vec()),
            Reason::CompletedClientHttp => Ev::Completed,
            Reason::ClosedClientHttp => Ev::Closed,
            Reason::RawAdopt => Ev::RawAdopt,
            Reason::RawRx(bytes) => Ev::RawRx(bytes.to_vec()),
            Reason::RawWriteable => Ev::RawWriteable,
            Reason::RawClose => Ev::RawClose,
            Reason::Cgi { channel, .. } => Ev::Cgi(channel),
            Reason::CgiTerminated => Ev::CgiTerminated,
            Reason::Http => Ev::Http,
            Reason::HttpWriteable => Ev::HttpWriteable,
            Reason::ServerWriteable => Ev::ServerWriteable,
            Reason::Closed => Ev::WsClosed,
            _ => Ev::Other,
        };
        self.events.lock().expect("events lock").push((conn.id(), ev.clone()));

        match ev {
            Ev::Established if script.refuse_established => CallbackAction::Close,
            Ev::Completed if script.close_on_completed => CallbackAction::Close,
            Ev::Rx if script.hold_rx => {
                conn.rx_flow_control(false);
                CallbackAction::Continue
            }
            Ev::RawRx(bytes) if script.raw_echo => {
                conn.send(&bytes, WriteKind::Binary);
                CallbackAction::Continue
            }
            _ => CallbackAction::Continue,
        }
    }
}

/// Hands out parents whose child process has exited
#[derive(Debug, Clone, Default)]
pub struct FakeReaper {
    dead: Arc<Mutex<Vec<ConnId>>>,
}

impl FakeReaper {
    pub fn exited(&self, parent: ConnId) {
        self.dead.lock().expect("reaper lock").push(parent);
    }
}

impl ChildReaper for FakeReaper {
    fn reap_terminated(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut *self.dead.lock().expect("reaper lock"))
    }
}

/// A worker wired to the fakes, with its own clock
pub struct Harness {
    pub w: Worker,
    pub net: Net,
    pub dns: FakeDns,
    pub rec: Recorder,
    pub reaper: FakeReaper,
    pub h2_rx: Arc<Mutex<Vec<u8>>>,
    pub codec: CodecControl,
    pub now: Instant,
}

pub fn harness() -> Harness {
    harness_with(VhostConfig::default(), EngineConfig::default())
}

pub fn harness_with(vhost: VhostConfig, config: EngineConfig) -> Harness {
    let net = Net::default();
    let dns = FakeDns::with("example.com", &[IpAddr::V4(EXAMPLE_IP)]);
    let rec = Recorder::default();
    let reaper = FakeReaper::default();
    let codec = TestCodec::default();
    let h2_rx = codec.h2_rx();
    let control = codec.control();
    let now = Instant::now();
    let w = Worker::builder()
        .config(config)
        .vhost(Arc::new(Vhost::new(vhost).expect("valid vhost")))
        .protocol(rec.clone())
        .codec(codec)
        .resolver(dns.clone())
        .sockets(net.clone())
        .reaper(reaper.clone())
        .start_time(now)
        .build()
        .expect("worker builds");
    Harness {
        w,
        net,
        dns,
        rec,
        reaper,
        h2_rx,
        codec: control,
        now,
    }
}

impl Harness {
    pub fn socket_of(&self, id: ConnId) -> SocketId {
        self.w.conn(id).and_then(Connection::socket_id).expect("connection has a socket")
    }

    pub fn event(&mut self, socket: SocketId, revents: Interest) {
        let now = self.now;
        self.w.service_fd(PollEvent { socket, revents }, now);
    }

    /// Deliver bytes and the readable event, then anything left buffered
    pub fn feed(&mut self, id: ConnId, bytes: &[u8]) {
        let socket = self.socket_of(id);
        self.net.push(socket, bytes);
        self.event(socket, Interest::POLLIN);
        self.w.service_pending();
    }

    /// Everything the h2 codec has consumed so far
    pub fn h2_text(&self) -> String {
        String::from_utf8_lossy(&self.h2_rx.lock().expect("h2 lock")).into_owned()
    }

    pub fn advance(&mut self, secs: u64) {
        self.now += Duration::from_secs(secs);
        let now = self.now;
        self.w.periodic_checks(now);
    }
}
