use std::net::{IpAddr, ToSocketAddrs};

use super::{Resolve, ResolverError};

/// Blocking resolver backed by the system `getaddrinfo`.
///
/// The lookup blocks the calling worker. Swap in another [`Resolve`] to
/// resolve off-thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver;

impl GaiResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&mut self, host: &str, ipv6: bool) -> Result<Vec<IpAddr>, ResolverError> {
        if host.is_empty() {
            return Err(ResolverError::InvalidName(String::new()));
        }
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = (host, 0u16)
            .to_socket_addrs()
            .map_err(|e| ResolverError::lookup(host, e))?;
        let mut ips: Vec<IpAddr> = addrs
            .map(|sa| sa.ip())
            .filter(|ip| ipv6 || ip.is_ipv4())
            .collect();
        ips.dedup();

        tracing::debug!(host, count = ips.len(), ipv6, "resolved");
        if ips.is_empty() {
            return Err(ResolverError::no_addresses(host));
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_skip_lookup() {
        let mut gai = GaiResolver::new();
        let ips = gai.resolve("127.0.0.1", false).expect("literal");
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().expect("ip")]);
        let ips = gai.resolve("[::1]", true).expect("literal v6");
        assert_eq!(ips, vec!["::1".parse::<IpAddr>().expect("ip")]);
    }
}
