//! Plain TCP sockets on `socket2`

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::{Domain, Protocol, SockAddr, Type};

use super::{ReadStatus, Socket, SocketFactory, SocketId, Transport, WriteStatus};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Creates non-blocking TCP sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct Socket2Factory {
    pub nodelay: bool,
}

impl Socket2Factory {
    #[must_use]
    pub fn new() -> Self {
        Self { nodelay: true }
    }
}

impl SocketFactory for Socket2Factory {
    fn open(&mut self, addr: &SocketAddr) -> io::Result<Box<dyn Socket>> {
        let inner = socket2::Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        Ok(Box::new(TcpSocket {
            inner,
            id: SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)),
            nodelay: self.nodelay,
        }))
    }
}

/// Non-blocking TCP socket
#[derive(Debug)]
pub struct TcpSocket {
    inner: socket2::Socket,
    id: SocketId,
    nodelay: bool,
}

impl Transport for TcpSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadStatus {
        match self.inner.read(buf) {
            Ok(0) => ReadStatus::Closed,
            Ok(n) => ReadStatus::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                ReadStatus::MoreService
            }
            Err(e) => {
                tracing::debug!(socket = %self.id, error = %e, "read failed");
                ReadStatus::Error
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> WriteStatus {
        match self.inner.write(buf) {
            Ok(n) => WriteStatus::Written(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                WriteStatus::MoreService
            }
            Err(e) => {
                tracing::debug!(socket = %self.id, error = %e, "write failed");
                WriteStatus::Error
            }
        }
    }
}

impl Socket for TcpSocket {
    fn set_options(&mut self) -> io::Result<()> {
        if self.nodelay {
            self.inner.set_tcp_nodelay(true)?;
        }
        self.inner.set_keepalive(true)
    }

    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    fn bind_interface(&mut self, iface: &str) -> io::Result<()> {
        self.inner.bind_device(Some(iface.as_bytes()))
    }

    #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
    fn bind_interface(&mut self, iface: &str) -> io::Result<()> {
        let addr: std::net::IpAddr = iface
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface must be an address"))?;
        self.inner.bind(&SockAddr::from(SocketAddr::new(addr, 0)))
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.inner.connect(&SockAddr::from(addr))
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}
