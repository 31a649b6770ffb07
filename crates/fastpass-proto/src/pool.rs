//! # Packet Descriptor Pool
//!
//! Slab-keyed arena for [`PacketDescriptor`]s, replacing a manual
//! ring+mempool with an arena plus free-list. A descriptor's
//! ownership is always exactly one of: held in the outgoing window, handed
//! to a callback, or freed — the pool only ever returns an owned value out
//! and takes it back once, so double-free is a type error rather than a
//! runtime bug.

use slab::Slab;

use crate::wire::AllocRequest;

/// Immutable once committed (§3). Carries everything FPPROTO needs to
/// resend, ack, or nack this packet.
///
/// Timestamps throughout this crate are plain nanosecond counts rather
/// than `quanta::Instant`, since timeslot reconstruction, skew windows, and
/// retransmit deadlines are all expressed in raw nanoseconds; a host process
/// is expected to source `now_ns` from its own clock (typically
/// `quanta::Clock`, which `fastpass-core` uses).
#[derive(Debug, Clone)]
pub struct PacketDescriptor {
    pub seqno: u64,
    pub sent_timestamp_ns: u64,
    /// Highest sequence acked by the peer as of send time.
    pub ack_seq: u64,
    /// Bitmap of the 16 predecessors of `ack_seq`, as of send time.
    pub ack_vec: u16,
    pub reset: Option<ResetInfo>,
    pub alloc_requests: Vec<AllocRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetInfo {
    pub timestamp: u64,
}

impl PacketDescriptor {
    pub fn new(seqno: u64, sent_timestamp_ns: u64, ack_seq: u64, ack_vec: u16) -> Self {
        PacketDescriptor {
            seqno,
            sent_timestamp_ns,
            ack_seq,
            ack_vec,
            reset: None,
            alloc_requests: Vec::new(),
        }
    }

    pub fn with_reset(mut self, timestamp: u64) -> Self {
        self.reset = Some(ResetInfo { timestamp });
        self
    }

    pub fn with_alloc_requests(mut self, requests: Vec<AllocRequest>) -> Self {
        self.alloc_requests = requests;
        self
    }
}

/// Opaque handle into the pool, valid until the descriptor is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle(usize);

/// Slab-backed arena of in-flight descriptors, keyed by slab index (not
/// seqno directly — the outgoing window maps seqno -> handle).
#[derive(Debug, Default)]
pub struct DescriptorPool {
    entries: Slab<PacketDescriptor>,
}

impl DescriptorPool {
    pub fn with_capacity(capacity: usize) -> Self {
        DescriptorPool {
            entries: Slab::with_capacity(capacity),
        }
    }

    /// Insert a descriptor, taking ownership. Returns a handle. This is the
    /// only fallible allocation point in the hot path (§4.7
    /// "Outgoing descriptor allocation failure"); in practice `Slab` grows
    /// on demand, so failure here models a hard resource ceiling enforced
    /// by the caller (e.g. a configured `max_outstanding`), not slab
    /// exhaustion.
    pub fn insert(&mut self, pd: PacketDescriptor) -> DescriptorHandle {
        DescriptorHandle(self.entries.insert(pd))
    }

    pub fn get(&self, handle: DescriptorHandle) -> Option<&PacketDescriptor> {
        self.entries.get(handle.0)
    }

    /// Remove and return ownership of the descriptor. Panics if the handle
    /// was already freed — double-free is a logic bug, not a recoverable
    /// condition.
    pub fn take(&mut self, handle: DescriptorHandle) -> PacketDescriptor {
        self.entries.remove(handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
