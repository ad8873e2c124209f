//! Resolver errors

use std::io;

/// Failure reported by a [`Resolve`](super::Resolve) implementation
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses found for {0}")]
    NoAddresses(String),
    #[error("invalid host name: {0}")]
    InvalidName(String),
}

impl ResolverError {
    pub fn lookup(host: impl Into<String>, source: io::Error) -> Self {
        Self::Lookup {
            host: host.into(),
            source,
        }
    }

    pub fn no_addresses(host: impl Into<String>) -> Self {
        Self::NoAddresses(host.into())
    }
}
