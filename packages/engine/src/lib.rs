//! # wirerole engine
//!
//! Connection-role engine for a single-threaded event loop. Every connection
//! is bound to one role (HTTP/1, HTTP/2, raw socket or CGI pass-through) that
//! decides how readiness events are serviced, and a lifecycle state that
//! decides which operations are legal.
//!
//! ## Features
//!
//! - **Role table** with optional capabilities per role
//! - **HTTP/2 drain** taking input from the rxflow buffer, the network
//!   scratch or the socket, in that order
//! - **Client engine**: resolve, HTTP CONNECT and SOCKS5 proxies,
//!   non-blocking connect, pipelining onto existing connections, redirects
//! - **CGI pass-through** of child stdin, stdout and stderr
//!
//! The engine does no I/O of its own beyond sockets: wire parsing sits
//! behind [`protocol::WireCodec`], user code behind [`protocol::Protocol`]
//! and readiness behind [`transport::Poller`].

#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod conn;
pub mod dns;
pub mod error;
pub mod h2;
pub mod headers;
pub mod protocol;
pub mod role;
pub mod service;
pub mod telemetry;
pub mod transport;
pub mod vhost;

pub mod prelude;

pub use error::{Error, Result};
pub use prelude::*;
