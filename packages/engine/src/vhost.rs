//! Vhosts and the active client connection registry
//!
//! The registry lists client connections that later requests may piggyback
//! on. It is the one structure shared between workers, behind a coarse lock
//! that is only held for a scan-and-link or an unlink.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::sync::{Mutex, MutexGuard};

use crate::config::VhostConfig;
use crate::conn::ConnId;
use crate::error::{Error, Result};

/// Identifies the worker that owns a connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pt{}", self.0)
    }
}

/// Client TLS mode flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TlsFlags(u8);

impl TlsFlags {
    pub const NONE: Self = Self(0);
    pub const USE_SSL: Self = Self(0x01);
    pub const ALLOW_SELFSIGNED: Self = Self(0x02);
    pub const SKIP_HOSTNAME_CHECK: Self = Self(0x04);
    pub const ALLOW_EXPIRED: Self = Self(0x08);
    /// Do not offer h2 in ALPN
    pub const NOT_H2: Self = Self(0x10);

    /// Bits that must agree for two requests to share a connection
    pub const REUSE_MASK: Self = Self(Self::USE_SSL.0 | Self::NOT_H2.0);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn use_ssl(self) -> bool {
        self.contains(Self::USE_SSL)
    }

    #[must_use]
    pub fn reuse_compatible(self, other: Self) -> bool {
        self & Self::REUSE_MASK == other & Self::REUSE_MASK
    }
}

impl BitOr for TlsFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for TlsFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// One reusable client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub worker: WorkerId,
    pub conn: ConnId,
    /// Host string exactly as the connection was asked for
    pub host: String,
    pub port: u16,
    pub tls: TlsFlags,
}

/// Client connections open for piggybacking, newest first
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    entries: VecDeque<RegistryEntry>,
}

impl ActiveRegistry {
    pub fn register(&mut self, entry: RegistryEntry) {
        if !self.contains(entry.worker, entry.conn) {
            self.entries.push_front(entry);
        }
    }

    pub fn unregister(&mut self, worker: WorkerId, conn: ConnId) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.worker == worker && e.conn == conn));
        before != self.entries.len()
    }

    #[must_use]
    pub fn contains(&self, worker: WorkerId, conn: ConnId) -> bool {
        self.entries
            .iter()
            .any(|e| e.worker == worker && e.conn == conn)
    }

    /// Connections of `worker` other than `exclude` opened for the same
    /// host, port and reuse-relevant TLS flags, newest first.
    #[must_use]
    pub fn candidates(
        &self,
        worker: WorkerId,
        exclude: ConnId,
        host: &str,
        port: u16,
        tls: TlsFlags,
    ) -> Vec<ConnId> {
        self.entries
            .iter()
            .filter(|e| {
                e.worker == worker
                    && e.conn != exclude
                    && e.port == port
                    && e.host == host
                    && e.tls.reuse_compatible(tls)
            })
            .map(|e| e.conn)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A destination group sharing configuration and a registry
#[derive(Debug)]
pub struct Vhost {
    config: VhostConfig,
    registry: Mutex<ActiveRegistry>,
}

impl Vhost {
    /// # Errors
    ///
    /// `Error::Config` when the configuration does not validate.
    pub fn new(config: VhostConfig) -> Result<Self> {
        config.validate().map_err(Error::config)?;
        Ok(Self {
            config,
            registry: Mutex::new(ActiveRegistry::default()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &VhostConfig {
        &self.config
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Lock the registry. A poisoned lock is recovered; entries are plain
    /// data.
    pub fn registry(&self) -> MutexGuard<'_, ActiveRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(conn: ConnId, host: &str, tls: TlsFlags) -> RegistryEntry {
        RegistryEntry {
            worker: WorkerId(0),
            conn,
            host: host.to_string(),
            port: 443,
            tls,
        }
    }

    #[test]
    fn candidates_match_host_port_and_tls() {
        let a = ConnId::from_raw(1, 0);
        let b = ConnId::from_raw(2, 0);
        let me = ConnId::from_raw(3, 0);
        let mut reg = ActiveRegistry::default();
        reg.register(entry(a, "a.example", TlsFlags::USE_SSL));
        reg.register(entry(b, "b.example", TlsFlags::USE_SSL));

        let tls = TlsFlags::USE_SSL | TlsFlags::ALLOW_SELFSIGNED;
        assert_eq!(reg.candidates(WorkerId(0), me, "a.example", 443, tls), vec![a]);
        assert!(reg
            .candidates(WorkerId(0), me, "a.example", 443, TlsFlags::NONE)
            .is_empty());
        assert!(reg
            .candidates(WorkerId(1), me, "a.example", 443, tls)
            .is_empty());
        assert!(reg.unregister(WorkerId(0), a));
        assert!(!reg.unregister(WorkerId(0), a));
    }
}
