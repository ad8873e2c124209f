//! Configuration Module
//!
//! Engine-wide (per worker) settings, per-vhost settings and the proxy chain
//! a vhost routes its client connections through.

pub mod engine;
pub mod proxy;
pub mod vhost;

pub use engine::EngineConfig;
pub use proxy::{HttpProxyConfig, SocksAuth, SocksProxyConfig};
pub use vhost::VhostConfig;
