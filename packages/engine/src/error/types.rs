//! Error types
//!
//! `Error` carries a short fixed diagnostic. The same text is what the user
//! protocol sees in a connection-creation-error notification.

use crate::dns::ResolverError;

/// A Result alias where the Err case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Header table or allocation exhaustion
    Resource,
    /// Host name resolution failure
    Resolve,
    /// Socket creation, bind or connect failure
    Connect,
    /// Protocol violation or illegal operation for the current state
    Protocol,
    /// Redirect counter exceeded
    RedirectLimit,
    /// HTTP CONNECT or SOCKS5 negotiation failure
    Proxy,
    /// The connection no longer exists
    Closed,
    /// Invalid engine or vhost configuration
    Config,
    /// Header table write failure
    HeaderTable,
}

/// Header table write failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderTableError {
    #[error("header table data area exhausted ({needed} bytes needed, {free} free)")]
    NoSpace { needed: usize, free: usize },
    #[error("no header table attached")]
    NotAttached,
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource: {0}")]
    Resource(&'static str),
    #[error("resolve: {msg}")]
    Resolve {
        msg: &'static str,
        #[source]
        source: Option<ResolverError>,
    },
    #[error("connect: {msg}")]
    Connect {
        msg: &'static str,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("protocol: {0}")]
    Protocol(&'static str),
    #[error("too many redirects ({0})")]
    RedirectLimit(u8),
    #[error("proxy: {0}")]
    Proxy(&'static str),
    #[error("connection closed")]
    Closed,
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    HeaderTable(#[from] HeaderTableError),
}

impl Error {
    /// Create a resource exhaustion error
    #[must_use]
    pub fn resource(msg: &'static str) -> Self {
        Self::Resource(msg)
    }

    /// Create a resolution error without an underlying cause
    #[must_use]
    pub fn resolve(msg: &'static str) -> Self {
        Self::Resolve { msg, source: None }
    }

    /// Create a resolution error wrapping the resolver's failure
    #[must_use]
    pub fn resolve_with(msg: &'static str, source: ResolverError) -> Self {
        Self::Resolve {
            msg,
            source: Some(source),
        }
    }

    /// Create a connect error without an underlying cause
    #[must_use]
    pub fn connect(msg: &'static str) -> Self {
        Self::Connect { msg, source: None }
    }

    /// Create a connect error wrapping an io error
    #[must_use]
    pub fn connect_io(msg: &'static str, source: std::io::Error) -> Self {
        Self::Connect {
            msg,
            source: Some(source),
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(msg: &'static str) -> Self {
        Self::Protocol(msg)
    }

    /// Create a proxy negotiation error
    #[must_use]
    pub fn proxy(msg: &'static str) -> Self {
        Self::Proxy(msg)
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Coarse classification of this error
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Resource(_) => Kind::Resource,
            Self::Resolve { .. } => Kind::Resolve,
            Self::Connect { .. } => Kind::Connect,
            Self::Protocol(_) => Kind::Protocol,
            Self::RedirectLimit(_) => Kind::RedirectLimit,
            Self::Proxy(_) => Kind::Proxy,
            Self::Closed => Kind::Closed,
            Self::Config(_) => Kind::Config,
            Self::HeaderTable(_) => Kind::HeaderTable,
        }
    }

    /// Short fixed diagnostic, as delivered with a connection-creation error
    #[must_use]
    pub fn diagnostic(&self) -> &str {
        match self {
            Self::Resource(msg) | Self::Protocol(msg) | Self::Proxy(msg) => msg,
            Self::Resolve { msg, .. } | Self::Connect { msg, .. } => msg,
            Self::RedirectLimit(_) => "too many redirects",
            Self::Closed => "closed",
            Self::Config(msg) => msg,
            Self::HeaderTable(_) => "header table write failed",
        }
    }

    /// Whether the attempt that produced this error is over.
    ///
    /// Header table exhaustion is the only recoverable condition: the
    /// connection waits on the pool instead.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Resource("no header table available"))
    }

    #[must_use]
    pub fn is_redirect_limit(&self) -> bool {
        matches!(self, Self::RedirectLimit(_))
    }

    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    #[must_use]
    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_are_the_short_strings() {
        assert_eq!(Error::connect("connect failed").diagnostic(), "connect failed");
        assert_eq!(Error::RedirectLimit(3).diagnostic(), "too many redirects");
        assert_eq!(
            Error::from(HeaderTableError::NotAttached).kind(),
            Kind::HeaderTable
        );
    }

    #[test]
    fn header_table_exhaustion_is_recoverable() {
        assert!(!Error::resource("no header table available").is_terminal());
        assert!(Error::resource("OOM").is_terminal());
        assert!(Error::proxy("proxy reply").is_terminal());
    }
}
