//! Telemetry and connection statistics

pub mod stats;

pub use stats::{ConnStats, ConnStatsSnapshot};
