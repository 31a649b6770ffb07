//! # fastpass-core
//!
//! Runtime glue: owns the background thread(s) that drive `fastpass-proto`'s
//! connection state machine and `fastpass-scheduler`'s timeslot scheduler
//! against a real datagram transport (§6A, §9).
//!
//! ## Crate structure
//!
//! - [`transport`] — `Datagram` trait + `UdpTransport` impl, decoupling the
//!   runtime from a concrete socket
//! - [`runtime`] — `FastpassRuntime`: worker + reader threads, command
//!   channel, graceful shutdown
//! - [`config`] — `FastpassConfig`: TOML-loadable merge of the proto,
//!   scheduler, and pacer config sections

pub mod config;
pub mod runtime;
pub mod transport;

pub use config::{ConfigError, FastpassConfig};
pub use runtime::{FastpassRuntime, SendError};
pub use transport::{Datagram, UdpTransport};
