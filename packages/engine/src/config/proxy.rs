//! Proxy configuration
//!
//! HTTP CONNECT and SOCKS5 proxies a vhost sends its client connections
//! through. An HTTP proxy outranks a SOCKS5 proxy when both are set.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// HTTP CONNECT proxy configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxyConfig {
    pub address: String,
    pub port: u16,
    /// Pre-encoded token for `Proxy-authorization: basic`
    pub basic_auth_token: Option<String>,
}

impl HttpProxyConfig {
    /// Create new HTTP proxy configuration without authentication
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            basic_auth_token: None,
        }
    }

    /// Add basic authentication, encoding `user:password`
    #[must_use]
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        let credentials = format!("{username}:{password}");
        self.basic_auth_token =
            Some(base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes()));
        self
    }

    /// Parse the `user:password@host:port` form accepted by proxy settings
    ///
    /// # Errors
    ///
    /// Returns an error if the port is missing or not a number.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (auth, hostport) = match spec.rsplit_once('@') {
            Some((auth, hostport)) => (Some(auth), hostport),
            None => (None, spec),
        };

        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| format!("proxy '{spec}' has no port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("proxy port '{port}': {e}"))?;

        let config = Self::new(host, port);
        Ok(match auth.and_then(|a| a.split_once(':')) {
            Some((user, pass)) => config.with_credentials(user, pass),
            None => config,
        })
    }
}

/// Proxy authentication methods for SOCKS5
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocksAuth {
    #[default]
    None,
    UsernamePassword { username: String, password: String },
}

/// SOCKS5 proxy configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksProxyConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub auth: SocksAuth,
}

impl SocksProxyConfig {
    /// Create new SOCKS5 configuration with no authentication
    #[must_use]
    pub fn no_auth(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            auth: SocksAuth::None,
        }
    }

    /// Create new SOCKS5 configuration with username/password authentication
    #[must_use]
    pub fn with_auth(
        address: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            auth: SocksAuth::UsernamePassword {
                username: username.into(),
                password: password.into(),
            },
        }
    }

    /// Validate SOCKS5 settings
    ///
    /// # Errors
    ///
    /// Returns an error if the port is 0 or a credential exceeds the 255 byte
    /// limit of the username/password subnegotiation.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("socks proxy port must be greater than 0".to_string());
        }
        if let SocksAuth::UsernamePassword { username, password } = &self.auth {
            if username.len() > 255 || password.len() > 255 {
                return Err("socks credentials must be at most 255 bytes".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_token_is_base64_of_user_colon_pass() {
        let proxy = HttpProxyConfig::new("proxy.local", 3128).with_credentials("Aladdin", "open sesame");
        assert_eq!(
            proxy.basic_auth_token.as_deref(),
            Some("QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
    }

    #[test]
    fn parse_accepts_optional_credentials() {
        let plain = HttpProxyConfig::parse("10.0.0.1:8080").expect("proxy spec should parse");
        assert_eq!(plain.address, "10.0.0.1");
        assert_eq!(plain.port, 8080);
        assert!(plain.basic_auth_token.is_none());

        let authed = HttpProxyConfig::parse("u:p@proxy:3128").expect("proxy spec should parse");
        assert_eq!(authed.address, "proxy");
        assert_eq!(authed.basic_auth_token.as_deref(), Some("dTpw"));

        assert!(HttpProxyConfig::parse("proxy").is_err());
    }
}
