//! Vhost Configuration Module
//!
//! A vhost groups client connections that share address-family policy,
//! HTTP/2 receive sizing and a proxy chain.

use serde::{Deserialize, Serialize};

use super::proxy::{HttpProxyConfig, SocksProxyConfig};

/// Runtime vhost configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VhostConfig {
    pub name: String,
    /// Allow IPv6 on client connections
    pub ipv6: bool,
    /// Refuse IPv4-mapped addresses on IPv6 connections
    pub ipv6_only: bool,
    /// Size of the receive scratch owned by each HTTP/2 network connection
    pub h2_rx_scratch_size: usize,
    /// Advertise extended CONNECT (websocket over HTTP/2)
    pub enable_connect_protocol: bool,
    /// Hand inbound sockets whose first bytes are not HTTP to the raw role
    pub fallback_to_raw: bool,
    pub http_proxy: Option<HttpProxyConfig>,
    pub socks_proxy: Option<SocksProxyConfig>,
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            ipv6: false,
            ipv6_only: false,
            h2_rx_scratch_size: 16384,
            enable_connect_protocol: false,
            fallback_to_raw: false,
            http_proxy: None,
            socks_proxy: None,
        }
    }
}

impl VhostConfig {
    /// Create a named vhost with default settings
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Dual-stack vhost preferring IPv6
    #[must_use]
    pub fn dual_stack(mut self) -> Self {
        self.ipv6 = true;
        self.ipv6_only = false;
        self
    }

    #[must_use]
    pub fn with_http_proxy(mut self, proxy: HttpProxyConfig) -> Self {
        self.http_proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn with_socks_proxy(mut self, proxy: SocksProxyConfig) -> Self {
        self.socks_proxy = Some(proxy);
        self
    }

    /// Validate vhost configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ipv6_only` is set without `ipv6`
    /// - `h2_rx_scratch_size` cannot hold a frame header
    /// - a configured proxy has port 0 or invalid credentials
    pub fn validate(&self) -> Result<(), String> {
        if self.ipv6_only && !self.ipv6 {
            return Err("ipv6_only requires ipv6".to_string());
        }

        if self.h2_rx_scratch_size < crate::h2::FRAME_HEADER_LEN {
            return Err("h2_rx_scratch_size must hold at least one frame header".to_string());
        }

        if let Some(proxy) = &self.http_proxy {
            if proxy.port == 0 {
                return Err("http proxy port must be greater than 0".to_string());
            }
        }

        if let Some(proxy) = &self.socks_proxy {
            proxy.validate()?;
        }

        Ok(())
    }
}
