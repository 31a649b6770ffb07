//! # FPPROTO Connection
//!
//! The reliable, reset-capable control channel (§4.3). Pure logic — no I/O,
//! no threads, no sockets, exactly like `strata-transport`'s sender/receiver
//! state machines. A host drives it with three entry points:
//!
//! - [`FastpassConnection::commit_packet`] — hand it an outgoing payload; it
//!   assigns a sequence number and arms the retransmit timer if needed.
//! - [`FastpassConnection::receive_datagram`] — feed it a raw inbound
//!   datagram; it validates, dedups, processes ACKs, and dispatches payloads
//!   to [`ConnectionOps`].
//! - [`FastpassConnection::check_retransmit_timer`] — call when the
//!   retransmit deadline set via [`TimerOps`] fires.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::ops::{ConnectionOps, TimerOps};
use crate::pool::{DescriptorPool, PacketDescriptor};
use crate::wire::{
    checksum, decode_payloads, AckPayload, AllocPayload, AreqPayload, Header, Payload,
    ResetPayload, HEADER_LEN,
};
use crate::stats::ConnectionStats;
use crate::window::SlidingWindow;

/// §4.3: offsets applied to the reset timestamp to derive each direction's
/// initial sequence number, so the two halves of the bidirectional stream
/// can never collide.
pub const TO_CONTROLLER_SEQNO_OFFSET: u64 = 0;
pub const TO_ENDPOINT_SEQNO_OFFSET: u64 = 0xDEAD_BEEF;

/// Which side of the arbiter<->endpoint link this connection represents.
/// Determines which offset applies to locally-assigned vs. peer-assigned
/// sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Endpoint,
    Arbiter,
}

impl Role {
    fn local_offset(self) -> u64 {
        match self {
            Role::Endpoint => TO_CONTROLLER_SEQNO_OFFSET,
            Role::Arbiter => TO_ENDPOINT_SEQNO_OFFSET,
        }
    }

    fn peer_offset(self) -> u64 {
        match self {
            Role::Endpoint => TO_ENDPOINT_SEQNO_OFFSET,
            Role::Arbiter => TO_CONTROLLER_SEQNO_OFFSET,
        }
    }
}

/// `FASTPASS_BAD_PKT_RESET_THRESHOLD` (§4.3).
pub const BAD_PKT_RESET_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionConfig {
    pub outwnd_capacity: u32,
    pub inwnd_capacity: u32,
    pub send_timeout_ns: u64,
    pub reset_window_ns: u64,
    pub bad_pkt_reset_threshold: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            outwnd_capacity: 256,
            inwnd_capacity: 1024,
            send_timeout_ns: 200_000,       // retrans_timeout_ns
            reset_window_ns: 2_000_000_000, // reset_window_us, in ns
            bad_pkt_reset_threshold: BAD_PKT_RESET_THRESHOLD,
        }
    }
}

/// A fully-assembled outgoing datagram, ready for the transport.
pub struct OutgoingDatagram {
    pub bytes: bytes::Bytes,
    pub seqno: u64,
}

/// Builder for the payload portion of a committed packet; the connection
/// fills in seqno/ack fields.
#[derive(Debug, Clone, Default)]
pub struct OutgoingPayload {
    pub reset: Option<ResetPayload>,
    pub areq: Option<AreqPayload>,
    pub alloc: Option<AllocPayload>,
    pub ack: Option<AckPayload>,
}

pub struct FastpassConnection {
    role: Role,
    config: ConnectionConfig,

    next_seqno: u64,
    in_max_seqno: u64,
    last_reset_time: Option<u64>,
    in_sync: bool,
    is_destroyed: bool,

    outwnd: SlidingWindow,
    inwnd: SlidingWindow,
    pool: DescriptorPool,
    handles: HashMap<u64, crate::pool::DescriptorHandle>,

    consecutive_bad_pkts: u32,
    retransmit_deadline_ns: Option<u64>,

    pub stats: ConnectionStats,
}

impl FastpassConnection {
    pub fn new(role: Role, config: ConnectionConfig) -> Self {
        FastpassConnection {
            outwnd: SlidingWindow::new(config.outwnd_capacity),
            inwnd: SlidingWindow::new(config.inwnd_capacity),
            pool: DescriptorPool::with_capacity(config.outwnd_capacity as usize),
            handles: HashMap::new(),
            next_seqno: 0,
            in_max_seqno: 0,
            last_reset_time: None,
            in_sync: false,
            is_destroyed: false,
            consecutive_bad_pkts: 0,
            retransmit_deadline_ns: None,
            role,
            config,
            stats: ConnectionStats::new(),
        }
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// §5 cancellation: mark this connection destroyed. Any descriptors
    /// still in the outgoing window are returned to the pool *without*
    /// invoking callbacks (they're simply dropped here).
    pub fn destroy(&mut self) {
        self.is_destroyed = true;
        self.handles.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.is_destroyed
    }

    // ─── Reset handshake (§4.3) ──────────────────────────────────────

    /// Force a local reset — from the bad-packet escape hatch or an AREQ
    /// feedback inconsistency (§7 "Desync"). Drains the outgoing window via
    /// `handle_neg_ack`, picks `new_reset_timestamp` as the new epoch basis,
    /// and leaves the connection `UNSYNCED` until the peer acknowledges it
    /// (the next outgoing packet will carry a RESET payload).
    pub fn force_reset(
        &mut self,
        new_reset_timestamp: u64,
        ops: &mut impl ConnectionOps,
    ) {
        self.drain_outwnd_as_lost(ops);
        self.last_reset_time = Some(new_reset_timestamp);
        self.next_seqno = new_reset_timestamp.wrapping_add(self.role.local_offset());
        self.in_max_seqno = 0;
        self.inwnd = SlidingWindow::new(self.config.inwnd_capacity);
        self.in_sync = false;
        self.consecutive_bad_pkts = 0;
        ops.handle_reset(new_reset_timestamp);
    }

    /// Process a RESET payload observed from the peer, per the table in
    /// §4.3.
    fn receive_reset(&mut self, t: u64, now_ns: u64, ops: &mut impl ConnectionOps) {
        let skew = now_ns.abs_diff(t);
        if skew > self.config.reset_window_ns {
            self.stats.reset_both_old += 1;
            warn!(reset_timestamp = t, now_ns, "reset rejected: outside skew window");
            return;
        }

        match self.last_reset_time {
            Some(local) if local == t => {
                // Idempotent: already accepted this exact epoch.
            }
            Some(local) => {
                let recent = now_ns.abs_diff(local) < self.config.reset_window_ns;
                if !recent || t > local {
                    self.accept_reset(t, ops);
                } else {
                    self.stats.reset_both_old += 1;
                }
            }
            None => self.accept_reset(t, ops),
        }
    }

    fn accept_reset(&mut self, t: u64, ops: &mut impl ConnectionOps) {
        self.drain_outwnd_as_lost(ops);
        self.last_reset_time = Some(t);
        self.next_seqno = t.wrapping_add(self.role.local_offset());
        self.in_max_seqno = t.wrapping_add(self.role.peer_offset()).wrapping_sub(1);
        self.inwnd = SlidingWindow::new(self.config.inwnd_capacity);
        self.in_sync = true;
        self.consecutive_bad_pkts = 0;
        self.stats.resets_accepted += 1;
        debug!(reset_timestamp = t, "reset accepted, epoch established");
        ops.handle_reset(t);
    }

    fn drain_outwnd_as_lost(&mut self, ops: &mut impl ConnectionOps) {
        let seqnos: Vec<u64> = self.handles.keys().copied().collect();
        for seq in seqnos {
            if let Some(handle) = self.handles.remove(&seq) {
                let pd = self.pool.take(handle);
                ops.handle_neg_ack(pd);
            }
        }
        self.outwnd = SlidingWindow::new(self.config.outwnd_capacity);
        self.retransmit_deadline_ns = None;
    }

    // ─── Outgoing window (§4.3 "Outgoing window") ────────────────────

    /// Assigns a sequence number, snapshots ack state, commits the
    /// descriptor to the outgoing window, and arms the retransmit timer if
    /// the window was empty. Returns the committed descriptor's sequence
    /// number.
    pub fn commit_packet(
        &mut self,
        payload: OutgoingPayload,
        now_ns: u64,
        ops: &mut impl ConnectionOps,
        timers: &mut impl TimerOps,
    ) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno = self.next_seqno.wrapping_add(1);

        let ack_seq = self.in_max_seqno;
        let ack_vec = self.recent_ack_vec();

        let mut pd = PacketDescriptor::new(seqno, now_ns, ack_seq, ack_vec);
        if let Some(areq) = &payload.areq {
            pd = pd.with_alloc_requests(areq.requests.clone());
        }
        if let Some(reset) = &payload.reset {
            pd = pd.with_reset(reset.reset_timestamp);
        }

        let was_empty = self.outwnd.num_set() == 0;
        let lost = self.outwnd.advance(seqno);
        self.outwnd
            .mark(seqno)
            .expect("freshly-advanced head is always in range");

        let handle = self.pool.insert(pd);
        self.handles.insert(seqno, handle);
        self.stats.packets_sent += 1;

        for lost_seq in lost {
            if let Some(h) = self.handles.remove(&lost_seq) {
                let pd = self.pool.take(h);
                self.stats.fall_off_outwnd += 1;
                ops.handle_neg_ack(pd);
            }
        }

        if was_empty {
            let deadline = now_ns + self.config.send_timeout_ns;
            self.retransmit_deadline_ns = Some(deadline);
            timers.set_retransmit_timer(deadline);
        }

        seqno
    }

    /// Encode a committed packet (identified by `seqno`) plus the supplied
    /// payload chunks into wire bytes, for transmission.
    pub fn encode_outgoing(
        &self,
        seqno: u64,
        payload: &OutgoingPayload,
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
    ) -> Option<OutgoingDatagram> {
        let handle = *self.handles.get(&seqno)?;
        let pd = self.pool.get(handle)?;

        let mut body = BytesMut::new();
        if let Some(reset) = &payload.reset {
            reset.encode(&mut body);
        }
        if let Some(areq) = &payload.areq {
            areq.encode(&mut body);
        }
        if let Some(alloc) = &payload.alloc {
            alloc.encode(&mut body);
        }
        if let Some(ack) = &payload.ack {
            ack.encode(&mut body);
        }

        let cksum = checksum(src_ip, dst_ip, &body);
        let header = Header {
            checksum: cksum,
            seqno_low: (seqno & 0x3FFF) as u16,
            ack_seq_low: (pd.ack_seq & 0xFFFF) as u16,
            ack_vec: pd.ack_vec,
        };

        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        header.encode(&mut out);
        out.extend_from_slice(&body);

        Some(OutgoingDatagram {
            bytes: out.freeze(),
            seqno,
        })
    }

    fn recent_ack_vec(&self) -> u16 {
        let mut v = 0u16;
        for i in 0..16u64 {
            let seq = self.in_max_seqno.wrapping_sub(1 + i);
            if self.inwnd.is_set(seq) {
                v |= 1 << i;
            }
        }
        v
    }

    // ─── Incoming datagrams ───────────────────────────────────────────

    /// Validate and process one inbound datagram. Never panics or returns
    /// an error to the caller — all failures are counted per §7.
    pub fn receive_datagram(
        &mut self,
        data: &[u8],
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        now_ns: u64,
        ops: &mut impl ConnectionOps,
    ) {
        if self.is_destroyed {
            return;
        }
        match self.try_receive_datagram(data, src_ip, dst_ip, now_ns, ops) {
            Ok(()) => {
                self.consecutive_bad_pkts = 0;
            }
            Err(e) => self.record_bad_packet(e, now_ns, ops),
        }
    }

    fn record_bad_packet(&mut self, e: DecodeError, now_ns: u64, ops: &mut impl ConnectionOps) {
        match e {
            DecodeError::Truncated => self.stats.rx_truncated += 1,
            DecodeError::BadChecksum => self.stats.rx_checksum_err += 1,
            DecodeError::UnknownPayloadType(_) | DecodeError::DestinationOutOfBounds => {
                self.stats.rx_unknown_payload += 1
            }
        }
        self.consecutive_bad_pkts += 1;
        self.stats.consecutive_bad_pkts = self.consecutive_bad_pkts as u64;
        if self.consecutive_bad_pkts >= self.config.bad_pkt_reset_threshold {
            self.stats.reset_from_bad_pkts += 1;
            self.force_reset(now_ns, ops);
        }
    }

    fn try_receive_datagram(
        &mut self,
        data: &[u8],
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        now_ns: u64,
        ops: &mut impl ConnectionOps,
    ) -> Result<(), DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let (header_bytes, payload_bytes) = data.split_at(HEADER_LEN);
        let computed = checksum(src_ip, dst_ip, payload_bytes);
        let mut hbuf = header_bytes;
        let header = Header::decode(&mut hbuf)?;
        if header.checksum != computed {
            return Err(DecodeError::BadChecksum);
        }

        let mut pbuf = payload_bytes;
        let payloads = decode_payloads(&mut pbuf)?;

        // RESET payloads re-base the incoming window (in_max_seqno) and must
        // be applied before this packet's own seqno is reconstructed and
        // recorded against it — otherwise a reset carried on the same packet
        // that establishes the new epoch would have its bookkeeping
        // immediately clobbered by the epoch transition.
        for payload in &payloads {
            if let Payload::Reset(ResetPayload { reset_timestamp }) = payload {
                self.receive_reset(*reset_timestamp, now_ns, ops);
            }
        }

        let expected_seq = self.in_max_seqno.wrapping_add(1);
        let seqno = Header::reconstruct_seqno(header.seqno_low, expected_seq);
        let is_new = self.process_incoming_seqno(seqno);

        let expected_ack = self.next_seqno;
        let ack_seq = Header::reconstruct_ack_seq(header.ack_seq_low, expected_ack);
        self.process_ack(ack_seq, header.ack_vec, now_ns, ops);

        if !is_new {
            return Ok(());
        }

        for payload in payloads {
            if matches!(payload, Payload::Reset(_)) {
                continue;
            }
            self.dispatch_payload(payload, now_ns, ops)?;
        }
        Ok(())
    }

    fn process_incoming_seqno(&mut self, seqno: u64) -> bool {
        let cap = self.config.inwnd_capacity as u64;
        let has_head = self.inwnd.head().is_some();
        let too_old_threshold = self.in_max_seqno.saturating_sub(cap - 1);
        if has_head && seqno < too_old_threshold {
            self.stats.seqno_before_inwnd += 1;
            return false;
        }
        if !has_head || seqno > self.in_max_seqno {
            let shift = if has_head { seqno - self.in_max_seqno } else { 0 };
            if shift >= cap {
                self.stats.inwnd_jumped += 1;
            }
            self.inwnd.advance(seqno);
            self.in_max_seqno = seqno;
        }
        if self.inwnd.is_set(seqno) {
            self.stats.rx_dup_pkt += 1;
            return false;
        }
        self.inwnd
            .mark(seqno)
            .expect("seqno is the new head or within range");
        self.stats.rx_pkts += 1;
        true
    }

    fn process_ack(&mut self, ack_seq: u64, ack_vec: u16, now_ns: u64, ops: &mut impl ConnectionOps) {
        self.try_ack_one(ack_seq, ops);
        for i in 0..16u64 {
            if (ack_vec as u64) & (1 << i) != 0 {
                let seq = ack_seq.wrapping_sub(1 + i);
                self.try_ack_one(seq, ops);
            }
        }
        self.rearm_retransmit_timer_after_ack(now_ns);
    }

    fn try_ack_one(&mut self, seq: u64, ops: &mut impl ConnectionOps) {
        if self.outwnd.is_set(seq) {
            if let Some(handle) = self.handles.remove(&seq) {
                self.outwnd.clear(seq);
                let pd = self.pool.take(handle);
                self.stats.acked_packets += 1;
                ops.handle_ack(pd);
            }
        }
    }

    fn rearm_retransmit_timer_after_ack(&mut self, now_ns: u64) {
        match self.earliest_unacked_deadline() {
            Some(deadline) => self.retransmit_deadline_ns = Some(deadline),
            None => self.retransmit_deadline_ns = None,
        }
        let _ = now_ns;
    }

    fn earliest_unacked_deadline(&self) -> Option<u64> {
        let seq = self.outwnd.earliest_set()?;
        let handle = *self.handles.get(&seq)?;
        let pd = self.pool.get(handle)?;
        Some(pd.sent_timestamp_ns + self.config.send_timeout_ns)
    }

    fn dispatch_payload(
        &mut self,
        payload: Payload,
        now_ns: u64,
        ops: &mut impl ConnectionOps,
    ) -> Result<(), DecodeError> {
        match payload {
            Payload::Reset(ResetPayload { reset_timestamp }) => {
                self.receive_reset(reset_timestamp, now_ns, ops);
            }
            Payload::Areq(areq) => ops.handle_areq(&areq),
            Payload::Alloc(alloc) => self.handle_alloc_payload(&alloc, now_ns, ops)?,
            Payload::Ack(AckPayload { ack_seq, ack_vec }) => {
                self.process_ack(ack_seq as u64, (ack_vec & 0xFFFF) as u16, now_ns, ops);
                // Wide bits beyond the 16-bit header vector: walk the rest too.
                for i in 16..32u64 {
                    if (ack_vec as u64) & (1 << i) != 0 {
                        let seq = (ack_seq as u64).wrapping_sub(1 + i);
                        self.try_ack_one(seq, ops);
                    }
                }
            }
            Payload::Padding => {}
        }
        Ok(())
    }

    fn handle_alloc_payload(
        &mut self,
        alloc: &AllocPayload,
        now_ns: u64,
        ops: &mut impl ConnectionOps,
    ) -> Result<(), DecodeError> {
        const MAX_FLOWS_INDEX: usize = 4096;
        for &dst in &alloc.dst_ids {
            if dst as usize >= MAX_FLOWS_INDEX {
                self.stats.rx_unknown_payload += 1;
                return Err(DecodeError::DestinationOutOfBounds);
            }
        }
        ops.handle_alloc(alloc, now_ns);
        Ok(())
    }

    // ─── Retransmit timer (§4.3) ──────────────────────────────────────

    /// Call when the timer armed via [`TimerOps::set_retransmit_timer`]
    /// fires. Clears and NACKs every descriptor whose deadline has passed,
    /// then reprograms (or cancels) the timer for the next earliest.
    pub fn check_retransmit_timer(
        &mut self,
        now_ns: u64,
        ops: &mut impl ConnectionOps,
        timers: &mut impl TimerOps,
    ) {
        loop {
            let Some(seq) = self.outwnd.earliest_set() else {
                self.retransmit_deadline_ns = None;
                timers.cancel_retransmit_timer();
                return;
            };
            let Some(&handle) = self.handles.get(&seq) else {
                // Shouldn't happen (window and handles are kept in sync),
                // but don't spin forever if it does.
                self.outwnd.clear(seq);
                continue;
            };
            let deadline = {
                let pd = self.pool.get(handle).expect("handle in map is valid");
                pd.sent_timestamp_ns + self.config.send_timeout_ns
            };
            if deadline > now_ns {
                self.retransmit_deadline_ns = Some(deadline);
                timers.set_retransmit_timer(deadline);
                return;
            }
            self.outwnd.clear(seq);
            let pd = self.pool.take(self.handles.remove(&seq).unwrap());
            self.stats.timeout_pkts += 1;
            ops.handle_neg_ack(pd);
        }
    }

    pub fn outwnd_len(&self) -> u32 {
        self.outwnd.num_set()
    }

    pub fn next_seqno(&self) -> u64 {
        self.next_seqno
    }

    pub fn in_max_seqno(&self) -> u64 {
        self.in_max_seqno
    }
}
