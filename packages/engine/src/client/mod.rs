//! Client connection engine
//!
//! Outbound connections go through resolve, proxy selection, non-blocking
//! connect, optional HTTP CONNECT or SOCKS5 negotiation and the handshake.
//! A GET may instead piggyback on an existing connection to the same
//! destination, either as a queued transaction or as a new HTTP/2 stream.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use crate::conn::ConnId;
use crate::error::{Error, Result};
use crate::vhost::{TlsFlags, Vhost};

pub mod connect;
pub mod piggyback;
pub mod proxy;
pub mod read;
pub mod redirect;
pub mod response;
pub mod service;
pub mod socks;
pub mod stash;

pub use read::{decode_chunked, ChunkOutcome};
pub use redirect::{resolve_location, RedirectTarget};
pub use stash::Stash;

/// Parameters of one outbound connection
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    /// Host name or address literal to connect to
    pub address: String,
    pub port: u16,
    pub tls: TlsFlags,
    /// Request path, starting with '/'
    pub path: String,
    /// Value of the Host header
    pub host: String,
    pub origin: Option<String>,
    /// Websocket subprotocol list
    pub protocol: Option<String>,
    pub method: Option<String>,
    /// Network interface to bind to
    pub iface: Option<String>,
    /// Allow reusing an existing connection to the same destination
    pub pipeline: bool,
    pub parent: Option<ConnId>,
    /// Destination group; the worker's default when absent
    pub vhost: Option<Arc<Vhost>>,
}

impl ConnectInfo {
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            host: address.clone(),
            address,
            port,
            tls: TlsFlags::NONE,
            path: "/".to_string(),
            origin: None,
            protocol: None,
            method: Some("GET".to_string()),
            iface: None,
            pipeline: false,
            parent: None,
            vhost: None,
        }
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn iface(mut self, iface: impl Into<String>) -> Self {
        self.iface = Some(iface.into());
        self
    }

    #[must_use]
    pub fn tls(mut self, tls: TlsFlags) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn pipeline(mut self, pipeline: bool) -> Self {
        self.pipeline = pipeline;
        self
    }

    #[must_use]
    pub fn parent(mut self, parent: ConnId) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn vhost(mut self, vhost: Arc<Vhost>) -> Self {
        self.vhost = Some(vhost);
        self
    }

    /// # Errors
    ///
    /// `Error::Config` when the address is empty, the port is 0 or the path
    /// does not start with '/'.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::config("address is required"));
        }
        if self.port == 0 {
            return Err(Error::config("port must be greater than 0"));
        }
        if !self.path.starts_with('/') {
            return Err(Error::config(format!("path '{}' must start with '/'", self.path)));
        }
        Ok(())
    }
}

/// Chunked transfer-coding parser position
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Reading the hex chunk size
    #[default]
    Hex,
    /// Size line seen its CR
    Cr,
    Content,
    /// Expecting the CR after chunk data
    PostCr,
    PostLf,
}

/// How the socket reaches the destination
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    #[default]
    Direct,
    HttpProxy,
    Socks,
}

/// Client-side bookkeeping of a connection
#[derive(Debug, Default)]
pub struct ClientState {
    pub(crate) stash: Option<Box<Stash>>,
    /// Host string this connection was opened for, kept for reuse matching
    pub(crate) hostname: Option<String>,
    pub(crate) c_port: u16,
    pub(crate) tls: TlsFlags,
    pub(crate) pipeline: bool,
    pub(crate) keepalive_active: bool,
    pub(crate) keepalive_rejected: bool,
    pub(crate) redirects: u8,
    pub(crate) already_did_cce: bool,
    /// Host side: waiters in arrival order
    pub(crate) txn_queue: VecDeque<ConnId>,
    /// Waiter side: the host this connection is queued on
    pub(crate) queued_on: Option<ConnId>,
    pub(crate) transaction_from_pipeline_queue: bool,
    pub(crate) http_body_pending: bool,
    /// Listed in the vhost's active registry
    pub(crate) registered: bool,
    pub(crate) chunked: bool,
    pub(crate) chunk: ChunkState,
    pub(crate) chunk_remaining: u64,
    pub(crate) connect_addr: Option<IpAddr>,
    pub(crate) via: Via,
    pub(crate) proxy_request: Option<Vec<u8>>,
}

impl ClientState {
    #[must_use]
    pub fn stash(&self) -> Option<&Stash> {
        self.stash.as_deref()
    }

    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.c_port
    }

    #[must_use]
    pub fn tls(&self) -> TlsFlags {
        self.tls
    }

    #[must_use]
    pub fn pipeline(&self) -> bool {
        self.pipeline
    }

    #[must_use]
    pub fn keepalive_active(&self) -> bool {
        self.keepalive_active
    }

    #[must_use]
    pub fn keepalive_rejected(&self) -> bool {
        self.keepalive_rejected
    }

    #[must_use]
    pub fn redirects(&self) -> u8 {
        self.redirects
    }

    #[must_use]
    pub fn already_did_cce(&self) -> bool {
        self.already_did_cce
    }

    /// Waiters queued on this host, oldest first
    #[must_use]
    pub fn txn_queue(&self) -> &VecDeque<ConnId> {
        &self.txn_queue
    }

    #[must_use]
    pub fn queued_on(&self) -> Option<ConnId> {
        self.queued_on
    }

    #[must_use]
    pub fn transaction_from_pipeline_queue(&self) -> bool {
        self.transaction_from_pipeline_queue
    }

    #[must_use]
    pub fn http_body_pending(&self) -> bool {
        self.http_body_pending
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    #[must_use]
    pub fn chunked(&self) -> bool {
        self.chunked
    }

    #[must_use]
    pub fn via(&self) -> Via {
        self.via
    }

    /// Address the socket was connected to
    #[must_use]
    pub fn connect_addr(&self) -> Option<IpAddr> {
        self.connect_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_info_defaults_and_validation() {
        let info = ConnectInfo::new("example.com", 443);
        assert_eq!(info.host, "example.com");
        assert_eq!(info.path, "/");
        assert_eq!(info.method.as_deref(), Some("GET"));
        info.validate().expect("valid");

        let err = ConnectInfo::new("", 80).validate().expect_err("no address");
        assert_eq!(err.diagnostic(), "address is required");
        assert!(ConnectInfo::new("h", 0).validate().is_err());
        assert!(ConnectInfo::new("h", 80).path("x").validate().is_err());
    }
}
