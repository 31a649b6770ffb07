//! # Connection Callbacks
//!
//! Replaces the C `fpproto_ops` function-pointer table (§9) with a small
//! trait, the same way `strata-bonding`'s `LinkSender` decouples the
//! scheduler from a concrete socket. The connection invokes these while
//! holding its internal lock (§5) — implementations must not reenter the
//! connection and must acquire any other locks in the order given in §5.
//!
//! Each ACK/NACK callback is an ownership transfer: the [`PacketDescriptor`]
//! passed in is no longer tracked by the connection, and the callback is
//! responsible for ultimately dropping it.

use crate::pool::PacketDescriptor;
use crate::wire::{AllocPayload, AreqPayload};

/// Application-level reactions to connection events.
pub trait ConnectionOps {
    /// A reset epoch was established (local or peer-initiated). All
    /// previously in-flight state (outstanding requests, horizon, etc.)
    /// must be discarded by the application.
    fn handle_reset(&mut self, reset_timestamp: u64);

    /// `pd` was acknowledged by the peer. Ownership transfers to the
    /// callback.
    fn handle_ack(&mut self, pd: PacketDescriptor);

    /// `pd` was lost (timed out or fell off the outgoing window) without
    /// being acked. Ownership transfers to the callback.
    fn handle_neg_ack(&mut self, pd: PacketDescriptor);

    /// An `ALLOC` payload arrived from the arbiter.
    fn handle_alloc(&mut self, alloc: &AllocPayload, now_ns: u64);

    /// An `AREQ` payload arrived (arbiter-side only; no-op for endpoints).
    fn handle_areq(&mut self, areq: &AreqPayload) {
        let _ = areq;
    }
}

/// Timer and pacer-trigger side effects the connection needs from its host
/// environment (§5 "Suspension points" — the connection itself never
/// blocks; these are thin scheduling requests).
pub trait TimerOps {
    /// Arm (or re-arm) the retransmit timer to fire at `deadline_ns`.
    fn set_retransmit_timer(&mut self, deadline_ns: u64);

    /// Cancel the retransmit timer (outgoing window became empty).
    fn cancel_retransmit_timer(&mut self);
}
