//! DNS resolution port

use std::net::IpAddr;

pub mod error;
pub mod gai;
pub mod select;

pub use error::ResolverError;
pub use gai::GaiResolver;
pub use select::select_address;

/// Host name resolution.
pub trait Resolve: Send {
    /// Resolve `host`. `ipv6` says whether IPv6 results are wanted at all.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolverError`] when the lookup fails.
    fn resolve(&mut self, host: &str, ipv6: bool) -> Result<Vec<IpAddr>, ResolverError>;
}
