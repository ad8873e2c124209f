//! Fluent builders for client connections and vhosts

pub mod core;
pub mod vhost;

pub use self::core::ConnectBuilder;
pub use self::vhost::VhostBuilder;
