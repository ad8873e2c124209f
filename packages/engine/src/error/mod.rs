//! Error handling for the connection-role engine
//!
//! One error enum covers every terminal path the engine can take. Transient
//! connect states ("in progress", "would block") are never errors.

pub mod types;

pub use types::{Error, HeaderTableError, Kind, Result};
