//! wirerole public API
//!
//! Fluent entry points over the connection-role engine: describe a client
//! connection by URL, group destinations into vhosts, and drive them with a
//! [`Worker`].

#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

pub mod builder;

pub use builder::*;

// Re-export important types from the engine package
pub use wirerole_engine::prelude::*;
pub use wirerole_engine::{Error, Result};

/// Main entry point providing static builder methods
pub struct Wirerole;

impl Wirerole {
    /// Describe a client connection by URL
    ///
    /// Shorthand for `ConnectBuilder::url()`
    ///
    /// # Errors
    ///
    /// See [`ConnectBuilder::url`].
    pub fn connect(url: &str) -> Result<ConnectBuilder> {
        ConnectBuilder::url(url)
    }

    /// Start configuring a vhost
    #[must_use]
    pub fn vhost(name: &str) -> VhostBuilder {
        VhostBuilder::named(name)
    }

    /// Start configuring a worker
    #[must_use]
    pub fn worker() -> WorkerBuilder {
        Worker::builder()
    }
}

/// Describe a client connection by URL
///
/// # Errors
///
/// See [`ConnectBuilder::url`].
pub fn connect(url: &str) -> Result<ConnectBuilder> {
    ConnectBuilder::url(url)
}
