//! `VhostBuilder`: destination groups and their proxy chain

use std::sync::Arc;

use wirerole_engine::config::{HttpProxyConfig, SocksProxyConfig, VhostConfig};
use wirerole_engine::vhost::Vhost;
use wirerole_engine::{Error, Result};

/// Builder for a [`Vhost`]
#[derive(Debug, Clone, Default)]
pub struct VhostBuilder {
    config: VhostConfig,
}

impl VhostBuilder {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            config: VhostConfig::named(name),
        }
    }

    /// Start from a JSON document holding a [`VhostConfig`]
    ///
    /// # Errors
    ///
    /// `Error::Config` when the JSON does not describe a vhost.
    pub fn from_json(json: &str) -> Result<Self> {
        let config = serde_json::from_str::<VhostConfig>(json)
            .map_err(|e| Error::config(format!("vhost json: {e}")))?;
        Ok(Self { config })
    }

    /// Allow IPv6, preferring it over IPv4
    #[must_use]
    pub fn dual_stack(mut self) -> Self {
        self.config = self.config.dual_stack();
        self
    }

    #[must_use]
    pub fn ipv6_only(mut self) -> Self {
        self.config.ipv6 = true;
        self.config.ipv6_only = true;
        self
    }

    /// Inbound sockets that do not start with HTTP become raw sockets
    #[must_use]
    pub fn fallback_to_raw(mut self) -> Self {
        self.config.fallback_to_raw = true;
        self
    }

    /// HTTP CONNECT proxy in `user:password@host:port` form
    ///
    /// # Errors
    ///
    /// `Error::Config` when the port is missing or not a number.
    pub fn http_proxy(mut self, spec: &str) -> Result<Self> {
        let proxy = HttpProxyConfig::parse(spec).map_err(Error::config)?;
        log::debug!("vhost {} uses http proxy {}:{}", self.config.name, proxy.address, proxy.port);
        self.config = self.config.with_http_proxy(proxy);
        Ok(self)
    }

    #[must_use]
    pub fn socks_proxy(mut self, proxy: SocksProxyConfig) -> Self {
        log::debug!("vhost {} uses socks5 proxy {}:{}", self.config.name, proxy.address, proxy.port);
        self.config = self.config.with_socks_proxy(proxy);
        self
    }

    /// # Errors
    ///
    /// `Error::Config` when the configuration does not validate.
    pub fn build(self) -> Result<Arc<Vhost>> {
        let name = self.config.name.clone();
        match Vhost::new(self.config) {
            Ok(vhost) => Ok(Arc::new(vhost)),
            Err(err) => {
                log::error!("vhost {name}: {err}");
                Err(err)
            }
        }
    }
}
