//! # Endpoint Scheduler
//!
//! Ties the destination table, flow queue, request pacer, and timeslot
//! horizon into the qdisc-like contract (§6): `enqueue`, `dequeue`,
//! `handle_timeslot`, plus the request/allocation bookkeeping driven by
//! `fastpass-proto`'s connection callbacks. Mapping flow identity (e.g. a
//! destination IP) onto a dense `dst_id` (`classify`, §4.5) is an I/O-layer
//! concern and lives above this crate, alongside the transport socket.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use fastpass_proto::ops::ConnectionOps;
use fastpass_proto::pool::PacketDescriptor;
use fastpass_proto::wire::{AllocPayload, AllocRequest, AreqPayload, EMU_FLAGS_DROP};

use crate::config::{SchedulerConfig, MAX_FLOWS, PKT_MAX_AREQ, REQUEST_WINDOW_SIZE};
use crate::destination::{account_bytes, DestinationTable, FlowState};
use crate::horizon::{Horizon, SlotAction};
use crate::stats::SchedulerStats;

/// The distinguished "internal" destination id that bypasses scheduling and
/// is dequeued immediately (§4.5).
pub const INTERNAL_DST_ID: u16 = 0;

/// Resource-exhaustion guard on a single destination's pending-byte queue;
/// the destination's own `state` already bounds the *request* queue to one
/// entry per id, but nothing upstream bounds how much unscheduled data a
/// slow destination can pile up.
const MAX_QUEUE_DEPTH: usize = 1024;

/// A queued outbound packet, held until its destination's timeslot comes due.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub dst_id: u16,
    pub bytes: Bytes,
}

/// Outcome of [`FastpassScheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted onto the destination's pending-byte queue.
    Queued,
    /// `dst_id` was the internal bucket; the packet bypassed scheduling and
    /// is already sitting in the ready queue.
    Internal,
    /// The destination's queue was already at [`MAX_QUEUE_DEPTH`].
    Dropped,
}

/// Endpoint-side scheduler: demand accounting, request assembly, and
/// allocation admission (§4.5, §4.6).
pub struct FastpassScheduler {
    config: SchedulerConfig,
    destinations: DestinationTable,
    flow_queue: VecDeque<u16>,
    horizon: Horizon,
    /// Per-destination pending-byte queues, dense like `DestinationTable`.
    queues: Vec<VecDeque<QueuedPacket>>,
    /// Packets released by `handle_timeslot`, ready for immediate egress.
    ready_queue: VecDeque<QueuedPacket>,
    pub stats: SchedulerStats,
    /// Set when AREQ feedback (§4.6 last paragraph) finds the counters
    /// inconsistent; the host should force a connection reset and clear
    /// this with [`Self::take_needs_reset`].
    needs_reset: bool,
}

impl FastpassScheduler {
    pub fn new(config: SchedulerConfig, now_ns: u64) -> Self {
        let current_tslot = config.current_tslot(now_ns);
        FastpassScheduler {
            config,
            destinations: DestinationTable::new(),
            flow_queue: VecDeque::new(),
            horizon: Horizon::new(current_tslot),
            queues: (0..MAX_FLOWS).map(|_| VecDeque::new()).collect(),
            ready_queue: VecDeque::new(),
            stats: SchedulerStats::default(),
            needs_reset: false,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn destination(&self, dst_id: u16) -> &crate::destination::Destination {
        self.destinations.get(dst_id)
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub fn take_needs_reset(&mut self) -> bool {
        std::mem::take(&mut self.needs_reset)
    }

    // ─── qdisc contract (§6) ────────────────────────────────────────────

    /// Classify-then-account a newly transmitted packet (§4.5 `enqueue`).
    pub fn enqueue(&mut self, dst_id: u16, bytes: Bytes) -> EnqueueOutcome {
        if dst_id == INTERNAL_DST_ID {
            self.ready_queue.push_back(QueuedPacket { dst_id, bytes });
            return EnqueueOutcome::Internal;
        }
        let idx = dst_id as usize;
        if idx >= MAX_FLOWS {
            self.stats.rx_unknown_dst += 1;
            return EnqueueOutcome::Dropped;
        }
        if self.queues[idx].len() >= MAX_QUEUE_DEPTH {
            self.stats.flow_queue_dropped += 1;
            return EnqueueOutcome::Dropped;
        }

        let size_bytes = bytes.len() as u64;
        self.queues[idx].push_back(QueuedPacket { dst_id, bytes });

        let dest = self.destinations.get_mut(dst_id);
        let should_queue = account_bytes(dest, size_bytes, self.config.tslot_bytes, self.config.used_slack);
        if should_queue {
            dest.state = FlowState::RequestQueue;
            self.flow_queue.push_back(dst_id);
        }
        self.stats.demand_tslots = self.destinations.total_demand();
        EnqueueOutcome::Queued
    }

    /// Pop the next packet admitted for egress, if any.
    pub fn dequeue(&mut self) -> Option<QueuedPacket> {
        self.ready_queue.pop_front()
    }

    /// Advance the horizon to the timeslot corresponding to `now_ns`,
    /// releasing every boundary crossed via the internal `handle_timeslot`
    /// admission callback (§4.6 "Per-timeslot release").
    pub fn advance_to(&mut self, now_ns: u64) {
        let target = self.config.current_tslot(now_ns);
        while self.horizon.current_tslot() < target {
            if let Some(action) = self.horizon.advance_one() {
                self.handle_timeslot(action);
            }
        }
    }

    /// `handle_timeslot(handle, dst_id, action, id)` (§6): what to do with a
    /// destination's queue when one of its granted timeslots is released.
    fn handle_timeslot(&mut self, action: SlotAction) {
        let dst_id = action.dst_id();
        self.destinations.get_mut(dst_id).used += 1;
        match action {
            SlotAction::Admit { .. } => {
                if let Some(pkt) = self.queues[dst_id as usize].pop_front() {
                    self.ready_queue.push_back(pkt);
                }
            }
            SlotAction::Drop { .. } => {
                self.queues[dst_id as usize].pop_front();
            }
        }
    }

    /// Drain every queued and ready packet, returning ownership to the
    /// caller (§6 `stop_qdisc`). After this the scheduler holds no bytes.
    pub fn shutdown(&mut self) -> Vec<QueuedPacket> {
        let mut drained: Vec<QueuedPacket> = self.ready_queue.drain(..).collect();
        for q in &mut self.queues {
            drained.extend(q.drain(..));
        }
        drained
    }

    // ─── Watchdog (§4.6) ────────────────────────────────────────────────

    pub fn has_ready_timeslot(&self) -> bool {
        self.horizon.is_current_set()
    }

    pub fn next_wakeup_tslot(&self) -> Option<u64> {
        self.horizon.next_set_tslot()
    }

    // ─── Request assembly (§4.5) ────────────────────────────────────────

    /// Assemble up to `FASTPASS_PKT_MAX_AREQ` destinations' requests,
    /// triggered by the request pacer firing. `None` if the dequeued
    /// destinations all turned out to be fully acked already.
    pub fn build_areq(&mut self) -> Option<AreqPayload> {
        let mut requests = Vec::new();
        for _ in 0..PKT_MAX_AREQ {
            let Some(dst_id) = self.flow_queue.pop_front() else {
                break;
            };
            let dest = self.destinations.get_mut(dst_id);
            dest.state = FlowState::Unqueued;

            let new_requested = dest.demand.min(dest.acked + REQUEST_WINDOW_SIZE - 1);
            if new_requested <= dest.acked {
                continue;
            }
            dest.requested = new_requested;
            requests.push(AllocRequest {
                dst_id,
                cumulative_low: (new_requested & 0xFFFF) as u16,
            });
        }
        if requests.is_empty() {
            None
        } else {
            Some(AreqPayload { requests })
        }
    }

    /// `true` if any destination's demand still outruns its requested
    /// volume — the pacer should be re-armed (§4.5 step 5).
    pub fn demand_exceeds_requested(&self) -> bool {
        self.destinations.any_unrequested_demand()
    }

    // ─── ALLOC reception (§4.6) ─────────────────────────────────────────

    fn handle_alloc_inner(&mut self, alloc: &AllocPayload, now_ns: u64) {
        let current_tslot = self.config.current_tslot(now_ns);
        // `base_tslot_low` is the wire's 16-bit field (§4.2); reconstruct the
        // full timeslot the same "anchor a quarter-span back, wrap the low
        // bits in from there" way §4.6 describes for its 20-bit variant,
        // scaled down to the field width actually on the wire.
        let anchor = current_tslot.wrapping_sub(1 << 14);
        let mut full_tslot =
            anchor.wrapping_add((alloc.base_tslot_low as u64).wrapping_sub(anchor) & 0xFFFF);

        let mut released_idx = 0usize;
        for desc in &alloc.descriptors {
            full_tslot = full_tslot.wrapping_add(1 + desc.flags() as u64);
            if desc.is_skip() {
                continue;
            }

            let dst_index = desc.dst_index() as usize;
            let dst_id = match alloc.dst_ids.get(dst_index - 1) {
                Some(&id) => id,
                None => {
                    self.stats.rx_unknown_payload += 1;
                    return; // dst_index points past dst_ids: abort entire ALLOC payload
                }
            };
            let packet_id = alloc
                .slot_ids
                .as_ref()
                .and_then(|ids| ids.get(released_idx).copied());
            released_idx += 1;

            if dst_id as usize >= MAX_FLOWS {
                self.stats.rx_unknown_dst += 1;
                continue; // unknown dst: drop just this slot, not the whole payload
            }

            if full_tslot < current_tslot.saturating_sub(self.config.miss_threshold) {
                self.stats.alloc_too_late += 1;
                self.force_redemand(dst_id);
                continue;
            }
            if full_tslot >= current_tslot + self.config.max_preload {
                self.stats.alloc_premature += 1;
                self.force_redemand(dst_id);
                continue;
            }

            let demand_satisfied = {
                let dest = self.destinations.get_mut(dst_id);
                dest.used >= dest.demand
            };
            if demand_satisfied {
                self.stats.unwanted_alloc += 1;
                continue;
            }

            let action = if desc.flags() & EMU_FLAGS_DROP != 0 {
                SlotAction::Drop { dst_id, packet_id }
            } else {
                SlotAction::Admit { dst_id, packet_id }
            };

            if full_tslot < current_tslot {
                // Still behind current_tslot but within miss_threshold
                // tolerance (checked above) by the time this ALLOC was
                // processed. The horizon only addresses
                // [current_tslot, current_tslot + HORIZON_LEN), so release
                // it immediately instead of scheduling it into the future.
                self.handle_timeslot(action);
            } else {
                self.horizon.admit(full_tslot, action);
            }
            self.destinations.get_mut(dst_id).alloc += 1;
        }

        if self.horizon.is_current_set() {
            debug!("allocation landed in the current timeslot, egress ready");
        }
    }

    /// Too-late / too-early remedy (§4.6 steps 3-4): count this slot as
    /// spent (`used`, `alloc`) while also bumping `demand`, so the excess
    /// re-triggers a request.
    fn force_redemand(&mut self, dst_id: u16) {
        let dest = self.destinations.get_mut(dst_id);
        dest.used += 1;
        dest.alloc += 1;
        dest.demand += 1;
        if dest.state == FlowState::Unqueued {
            dest.state = FlowState::RequestQueue;
            self.flow_queue.push_back(dst_id);
        }
    }
}

/// Reconstruct a 16-bit low-bits cumulative count nearest to `anchor`
/// (§4.6's `count = alloc - (1<<15) + ((low - (alloc - (1<<15))) & 0xFFFF)`,
/// generalized to any anchor since the same shape reconstructs `acked` from
/// an AREQ's `cumulative_low` against `requested`).
fn reconstruct_cumulative16(anchor: u64, low16: u64) -> u64 {
    let base = anchor.wrapping_sub(1 << 15);
    base.wrapping_add(low16.wrapping_sub(base) & 0xFFFF)
}

impl ConnectionOps for FastpassScheduler {
    fn handle_reset(&mut self, _reset_timestamp: u64) {
        self.destinations = DestinationTable::new();
        self.flow_queue.clear();
        self.horizon = Horizon::new(self.horizon.current_tslot());
        for q in &mut self.queues {
            q.clear();
        }
        self.ready_queue.clear();
        self.needs_reset = false;
    }

    fn handle_ack(&mut self, pd: PacketDescriptor) {
        for req in &pd.alloc_requests {
            if req.dst_id as usize >= MAX_FLOWS {
                continue;
            }
            let dest = self.destinations.get_mut(req.dst_id);
            let acked = reconstruct_cumulative16(dest.requested, req.cumulative_low as u64);
            if acked > dest.acked {
                dest.acked = acked;
            }
        }
    }

    fn handle_neg_ack(&mut self, pd: PacketDescriptor) {
        for req in &pd.alloc_requests {
            if req.dst_id as usize >= MAX_FLOWS {
                continue;
            }
            let dest = self.destinations.get_mut(req.dst_id);
            if dest.requested > dest.acked && dest.state == FlowState::Unqueued {
                dest.state = FlowState::RequestQueue;
                self.flow_queue.push_back(req.dst_id);
            }
        }
    }

    fn handle_alloc(&mut self, alloc: &AllocPayload, now_ns: u64) {
        self.handle_alloc_inner(alloc, now_ns);
    }

    fn handle_areq(&mut self, areq: &AreqPayload) {
        // Arriving at an endpoint, an AREQ-shaped payload is the arbiter's
        // periodic cumulative-allocation feedback (§4.6 last paragraph),
        // not a request (those only flow endpoint -> arbiter).
        for req in &areq.requests {
            if req.dst_id as usize >= MAX_FLOWS {
                self.stats.rx_unknown_dst += 1;
                continue;
            }
            let dest = self.destinations.get_mut(req.dst_id);
            let count = reconstruct_cumulative16(dest.alloc, req.cumulative_low as u64);
            if count > dest.alloc {
                let delta = count - dest.alloc;
                dest.demand += delta;
                dest.used += delta;
                dest.alloc += delta;
                self.stats.timeslots_assumed_lost += delta;
            }
            if count > dest.requested {
                self.stats.areq_reset_forced += 1;
                self.needs_reset = true;
                warn!(dst_id = req.dst_id, count, requested = dest.requested, "AREQ feedback inconsistent with requested volume, forcing reset");
            }
        }
    }
}
