//! Error types for the one genuine fallible boundary in this crate: wire
//! decode (§7). Everything past decode is handled via counters, never
//! `Result` — see [`crate::stats::ConnectionStats`].

use thiserror::Error;

/// Failure decoding a wire-format header or payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet truncated before expected field boundary")]
    Truncated,
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("unknown payload type tag {0:#x}")]
    UnknownPayloadType(u8),
    #[error("destination id out of bounds")]
    DestinationOutOfBounds,
}
