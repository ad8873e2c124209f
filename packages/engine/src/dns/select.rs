//! Address family reconciliation

use std::net::{IpAddr, Ipv6Addr};

use crate::error::{Error, Result};

/// Pick the address to connect to.
///
/// With `ipv6` an IPv6 result wins; failing that the first IPv4 result is
/// mapped to `::ffff:a.b.c.d` unless `ipv6_only`. Without `ipv6` the first
/// IPv4 result is used.
///
/// # Errors
///
/// `Error::Resolve` when no result is usable for the requested family.
pub fn select_address(ips: &[IpAddr], ipv6: bool, ipv6_only: bool) -> Result<IpAddr> {
    if ipv6 {
        if let Some(v6) = ips.iter().find(|ip| ip.is_ipv6()) {
            return Ok(*v6);
        }
        if ipv6_only {
            return Err(Error::resolve("no usable address"));
        }
        return ips
            .iter()
            .find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(IpAddr::V6(v4.to_ipv6_mapped())),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| Error::resolve("no usable address"));
    }

    ips.iter()
        .find(|ip| ip.is_ipv4())
        .copied()
        .ok_or_else(|| Error::resolve("unable to lookup address"))
}

/// Whether `addr` is an IPv4-mapped IPv6 address
#[must_use]
pub fn is_v4_mapped(addr: &Ipv6Addr) -> bool {
    addr.to_ipv4_mapped().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn v4_result_is_mapped_on_dual_stack() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
        let IpAddr::V6(mapped) = select_address(&[v4], true, false).expect("mapped") else {
            panic!("expected an IPv6 address");
        };
        let octets = mapped.octets();
        assert_eq!(&octets[..10], &[0u8; 10]);
        assert_eq!(&octets[10..12], &[0xff, 0xff]);
        assert_eq!(&octets[12..], &[192, 0, 2, 7]);
        assert!(is_v4_mapped(&mapped));
    }

    #[test]
    fn v6_result_is_preferred() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(select_address(&[v4, v6], true, false).expect("v6"), v6);
    }

    #[test]
    fn ipv6_only_refuses_v4() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let err = select_address(&[v4], true, true).expect_err("no v6");
        assert_eq!(err.diagnostic(), "no usable address");
    }

    #[test]
    fn ipv4_mode_takes_first_v4() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(select_address(&[v6, a, b], false, false).expect("v4"), a);
        let err = select_address(&[v6], false, false).expect_err("no v4");
        assert_eq!(err.diagnostic(), "unable to lookup address");
    }
}
