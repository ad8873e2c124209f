//! Owned copy of the connect parameters
//!
//! The caller's strings may not outlive the connect call, and the header
//! table they end up in may not be available yet. The stash holds them until
//! they are written into the table.

use super::ConnectInfo;
use crate::headers::{HdrToken, HeaderTable};
use crate::error::HeaderTableError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stash {
    pub address: String,
    pub path: String,
    pub host: String,
    pub origin: Option<String>,
    pub protocol: Option<String>,
    pub method: Option<String>,
    pub iface: Option<String>,
}

impl Stash {
    #[must_use]
    pub fn from_info(info: &ConnectInfo) -> Self {
        Self {
            address: info.address.clone(),
            path: info.path.clone(),
            host: info.host.clone(),
            origin: info.origin.clone(),
            protocol: info.protocol.clone(),
            method: info.method.clone(),
            iface: info.iface.clone(),
        }
    }

    /// Token/value pairs in the order they are written
    pub fn tokens(&self) -> impl Iterator<Item = (HdrToken, &str)> {
        [
            (HdrToken::ClientPeerAddress, Some(self.address.as_str())),
            (HdrToken::ClientUri, Some(self.path.as_str())),
            (HdrToken::ClientHost, Some(self.host.as_str())),
            (HdrToken::ClientOrigin, self.origin.as_deref()),
            (HdrToken::ClientSentProtocols, self.protocol.as_deref()),
            (HdrToken::ClientMethod, self.method.as_deref()),
            (HdrToken::ClientIface, self.iface.as_deref()),
        ]
        .into_iter()
        .filter_map(|(token, value)| Some((token, value?)))
    }

    /// Write every stashed value into `ah`
    ///
    /// # Errors
    ///
    /// Fails on the first value the table cannot hold.
    pub fn write_into(&self, ah: &mut HeaderTable) -> Result<(), HeaderTableError> {
        for (token, value) in self.tokens() {
            ah.simple_create(token, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_optionals_are_not_written() {
        let info = ConnectInfo::new("example.com", 80).path("/index.html");
        let stash = Stash::from_info(&info);
        let tokens: Vec<_> = stash.tokens().map(|(t, _)| t).collect();
        assert_eq!(
            tokens,
            [
                HdrToken::ClientPeerAddress,
                HdrToken::ClientUri,
                HdrToken::ClientHost,
                HdrToken::ClientMethod
            ]
        );

        let mut ah = HeaderTable::new(256, 16);
        stash.write_into(&mut ah).expect("fits");
        assert_eq!(ah.get(HdrToken::ClientUri), Some("/index.html"));
        assert_eq!(ah.get(HdrToken::ClientMethod), Some("GET"));
        assert!(!ah.contains(HdrToken::ClientOrigin));
    }
}
