//! Engine Configuration Module
//!
//! Buffer sizing, header table pool bounds and timeouts shared by every
//! connection a worker services.

use serde::{Deserialize, Serialize};

/// Hard cap on redirects followed by one client connection
pub const MAX_REDIRECTS: u8 = 3;

/// Runtime engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the per-worker scratch read buffer
    pub pt_serv_buf_size: usize,
    /// Generic protocol timeout in seconds
    pub timeout_secs: u64,
    /// Timeout for proxy and SOCKS replies and connect completion
    pub awaiting_timeout_secs: u64,
    /// Number of header tables in the shared pool
    pub ah_pool_size: usize,
    /// Bytes available for header fragments in one header table
    pub ah_data_size: usize,
    /// Bytes of inbound rx one header table can stash
    pub ah_rx_size: usize,
    /// Seconds a header table may idle before it counts as held
    pub ah_idle_secs: u64,
    /// Product name sent in proxy CONNECT requests
    pub user_agent: String,
    /// Seconds between websocket keepalive PINGs; 0 disables them
    pub ws_ping_pong_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pt_serv_buf_size: 4096,
            timeout_secs: 20,
            awaiting_timeout_secs: 20,
            ah_pool_size: 32,
            ah_data_size: 4096,
            ah_rx_size: 2048,
            ah_idle_secs: 10,
            user_agent: "wirerole".to_string(),
            ws_ping_pong_interval: 0,
        }
    }
}

impl EngineConfig {
    /// Create production-sized engine configuration
    #[must_use]
    pub fn production() -> Self {
        Self {
            pt_serv_buf_size: 16384,
            ah_pool_size: 128,
            ah_data_size: 8192,
            ..Self::default()
        }
    }

    /// Create development-friendly engine configuration
    #[must_use]
    pub fn development() -> Self {
        Self {
            ah_pool_size: 4,
            timeout_secs: 60,
            awaiting_timeout_secs: 60,
            ..Self::default()
        }
    }

    /// Parse configuration from a JSON document. Missing fields keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| crate::Error::config(format!("engine config: {e}")))?;
        config.validate().map_err(crate::Error::config)?;
        Ok(config)
    }

    /// Validate engine configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `pt_serv_buf_size` is smaller than a SOCKS5 connect request
    /// - `ah_pool_size` is 0
    /// - `ah_data_size` or `ah_rx_size` is 0
    /// - `timeout_secs` or `awaiting_timeout_secs` is 0
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), String> {
        if self.pt_serv_buf_size < 512 {
            return Err("pt_serv_buf_size must be at least 512".to_string());
        }

        if self.ah_pool_size == 0 {
            return Err("ah_pool_size must be greater than 0".to_string());
        }

        if self.ah_data_size == 0 || self.ah_rx_size == 0 {
            return Err("header table areas must be greater than 0".to_string());
        }

        if self.timeout_secs == 0 || self.awaiting_timeout_secs == 0 {
            return Err("timeouts must be greater than 0".to_string());
        }

        if self.user_agent.is_empty() {
            return Err("user_agent must not be empty".to_string());
        }

        Ok(())
    }
}
