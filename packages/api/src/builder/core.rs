//! `ConnectBuilder`: a client connection described by a URL
//!
//! The URL decides address, port, TLS and path; everything else the
//! connection carries is set fluently before handing it to a worker.

use std::fmt;
use std::sync::Arc;

use http::Method;
use url::Url;
use wirerole_engine::client::ConnectInfo;
use wirerole_engine::conn::ConnId;
use wirerole_engine::service::Worker;
use wirerole_engine::vhost::{TlsFlags, Vhost};
use wirerole_engine::{Error, Result};

/// Builder for one outbound client connection
#[derive(Clone)]
pub struct ConnectBuilder {
    pub(crate) info: ConnectInfo,
    /// Debug logging enabled flag
    pub(crate) debug_enabled: bool,
}

impl ConnectBuilder {
    /// Start from a `http`, `https`, `ws` or `wss` URL
    ///
    /// # Errors
    ///
    /// `Error::Config` when the URL does not parse, has another scheme or
    /// has no host.
    pub fn url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::config(format!("url '{url}': {e}")))?;
        let tls = match parsed.scheme() {
            "https" | "wss" => TlsFlags::USE_SSL,
            "http" | "ws" => TlsFlags::NONE,
            other => return Err(Error::config(format!("unsupported scheme '{other}'"))),
        };
        let authority = parsed
            .host_str()
            .ok_or_else(|| Error::config(format!("url '{url}' has no host")))?;
        let address = authority.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = parsed
            .port_or_known_default()
            .unwrap_or(if tls.use_ssl() { 443 } else { 80 });

        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        let host = match parsed.port() {
            Some(explicit) => format!("{authority}:{explicit}"),
            None => authority.to_string(),
        };

        Ok(Self {
            info: ConnectInfo::new(address, port).tls(tls).path(path).host(host),
            debug_enabled: false,
        })
    }

    #[must_use]
    pub fn method(mut self, method: &Method) -> Self {
        self.info = self.info.method(method.as_str());
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.info = self.info.origin(origin);
        self
    }

    /// Websocket subprotocols, comma separated
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.info = self.info.protocol(protocol);
        self
    }

    /// Override the Host header
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.info = self.info.host(host);
        self
    }

    /// Bind the socket to a network interface
    #[must_use]
    pub fn iface(mut self, iface: impl Into<String>) -> Self {
        self.info = self.info.iface(iface);
        self
    }

    /// Allow sharing an existing connection to the same destination
    #[must_use]
    pub fn pipeline(mut self, pipeline: bool) -> Self {
        self.info = self.info.pipeline(pipeline);
        self
    }

    #[must_use]
    pub fn parent(mut self, parent: ConnId) -> Self {
        self.info = self.info.parent(parent);
        self
    }

    #[must_use]
    pub fn vhost(mut self, vhost: Arc<Vhost>) -> Self {
        self.info = self.info.vhost(vhost);
        self
    }

    /// Log what the builder hands to the worker
    #[must_use]
    pub fn debug(mut self) -> Self {
        self.debug_enabled = true;
        self
    }

    /// The connection parameters, validated
    ///
    /// # Errors
    ///
    /// `Error::Config` from [`ConnectInfo::validate`].
    pub fn build(self) -> Result<ConnectInfo> {
        self.info.validate()?;
        Ok(self.info)
    }

    /// Start the connection on `worker`
    ///
    /// # Errors
    ///
    /// Whatever [`Worker::client_connect_via_info`] reports; the connection
    /// does not exist afterwards.
    pub fn connect(self, worker: &mut Worker) -> Result<ConnId> {
        let debug_enabled = self.debug_enabled;
        let info = self.build()?;
        if debug_enabled {
            log::debug!(
                "connect {}:{}{} tls={} pipeline={}",
                info.address,
                info.port,
                info.path,
                info.tls.use_ssl(),
                info.pipeline
            );
        }
        match worker.client_connect_via_info(info) {
            Ok(id) => {
                if debug_enabled {
                    log::debug!("connection {id} started");
                }
                Ok(id)
            }
            Err(err) => {
                log::warn!("connect failed: {err}");
                Err(err)
            }
        }
    }
}

impl fmt::Debug for ConnectBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectBuilder")
            .field("address", &self.info.address)
            .field("port", &self.info.port)
            .field("path", &self.info.path)
            .field("tls", &self.info.tls.use_ssl())
            .field("debug_enabled", &self.debug_enabled)
            .finish_non_exhaustive()
    }
}
