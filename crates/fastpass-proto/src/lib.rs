//! # fastpass-proto
//!
//! FPPROTO: the reliable, reset-capable control protocol connecting an
//! endpoint to its arbiter.
//!
//! ## Crate structure
//!
//! - [`window`] — Sliding-window bitmap primitive, shared by outgoing and
//!   incoming windows
//! - [`wire`] — Packet header and payload serialization
//! - [`error`] — Decode failure type
//! - [`pool`] — Slab-based packet descriptor arena
//! - [`ops`] — Host callback traits (`ConnectionOps`, `TimerOps`)
//! - [`connection`] — The FPPROTO state machine
//! - [`pacer`] — Request-packet token-bucket pacer
//! - [`stats`] — Per-connection counters

pub mod connection;
pub mod error;
pub mod ops;
pub mod pacer;
pub mod pool;
pub mod stats;
pub mod wire;
pub mod window;

pub use connection::{ConnectionConfig, FastpassConnection, OutgoingDatagram, OutgoingPayload, Role};
pub use error::DecodeError;
pub use ops::{ConnectionOps, TimerOps};
pub use pacer::{PacerConfig, RequestPacer};
