//! # Timeslot Horizon
//!
//! A 64-bit future-allocation bitmask with a parallel destination array
//! (§3, §4.6). Reuses `fastpass-proto::window`'s bit-shift-as-time-advances
//! shape, but fixed at exactly 64 bits (`FASTPASS_HORIZON`) since the
//! horizon — unlike the protocol windows — is indexed by `timeslot mod 64`
//! rather than a 64-bit sequence space.

use crate::config::HORIZON_LEN;

/// What `handle_timeslot` should do with the destination's queue when this
/// slot is released (§6 `handle_timeslot` contract / §4.6 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    /// `ADMIT_BY_ID` / `ADMIT_HEAD`: release a packet for `dst_id` normally.
    Admit { dst_id: u16, packet_id: Option<u16> },
    /// `DROP_BY_ID`: the referenced packet is discarded rather than sent
    /// (emulation mode, `EMU_FLAGS_DROP`).
    Drop { dst_id: u16, packet_id: Option<u16> },
}

impl SlotAction {
    pub fn dst_id(self) -> u16 {
        match self {
            SlotAction::Admit { dst_id, .. } | SlotAction::Drop { dst_id, .. } => dst_id,
        }
    }
}

/// Bit `i` set ⇔ `schedule[(current_tslot + i) mod HORIZON_LEN]` holds a
/// valid [`SlotAction`] allocated to that future timeslot.
pub struct Horizon {
    mask: u64,
    schedule: [Option<SlotAction>; HORIZON_LEN],
    current_tslot: u64,
}

impl Horizon {
    pub fn new(current_tslot: u64) -> Self {
        Horizon {
            mask: 0,
            schedule: [None; HORIZON_LEN],
            current_tslot,
        }
    }

    pub fn current_tslot(&self) -> u64 {
        self.current_tslot
    }

    fn slot_index(&self, tslot: u64) -> usize {
        (tslot % HORIZON_LEN as u64) as usize
    }

    /// Mark `tslot` (must be within `[current_tslot, current_tslot + 63]`)
    /// allocated to `action`. Callers must never pass a `tslot` behind
    /// `current_tslot` — the mask only ever addresses future slots, so a
    /// caller admitting something already behind `current_tslot` must
    /// release it immediately instead (see `FastpassScheduler::handle_alloc_inner`).
    pub fn admit(&mut self, tslot: u64, action: SlotAction) {
        debug_assert!(tslot >= self.current_tslot);
        debug_assert!(tslot - self.current_tslot < HORIZON_LEN as u64);
        let idx = self.slot_index(tslot);
        self.mask |= 1 << (tslot - self.current_tslot);
        self.schedule[idx] = Some(action);
    }

    pub fn is_current_set(&self) -> bool {
        self.mask & 1 != 0
    }

    /// The nearest future timeslot with a set bit, if any.
    pub fn next_set_tslot(&self) -> Option<u64> {
        if self.mask == 0 {
            return None;
        }
        let offset = self.mask.trailing_zeros() as u64;
        Some(self.current_tslot + offset)
    }

    /// Release the current timeslot's allocation (if any), then advance the
    /// horizon by one slot.
    pub fn advance_one(&mut self) -> Option<SlotAction> {
        let idx = self.slot_index(self.current_tslot);
        let released = if self.mask & 1 != 0 {
            self.schedule[idx].take()
        } else {
            None
        };
        self.mask >>= 1;
        self.current_tslot = self.current_tslot.wrapping_add(1);
        released
    }

    /// Advance the horizon to `new_current_tslot`, discarding (without
    /// releasing) any timeslots skipped over. Used when the watchdog
    /// observes wall-clock has moved past several unreleased timeslots.
    pub fn advance_to(&mut self, new_current_tslot: u64) {
        while self.current_tslot < new_current_tslot {
            self.advance_one();
        }
    }

    pub fn action_at(&self, tslot: u64) -> Option<SlotAction> {
        if tslot < self.current_tslot || tslot - self.current_tslot >= HORIZON_LEN as u64 {
            return None;
        }
        self.schedule[self.slot_index(tslot)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_sets_bit_and_schedule() {
        let mut h = Horizon::new(100);
        h.admit(
            104,
            SlotAction::Admit {
                dst_id: 7,
                packet_id: None,
            },
        );
        assert!(!h.is_current_set());
        assert_eq!(h.next_set_tslot(), Some(104));
        assert_eq!(h.action_at(104).map(SlotAction::dst_id), Some(7));
    }

    #[test]
    fn advance_one_releases_current_and_shifts() {
        let mut h = Horizon::new(100);
        h.admit(
            100,
            SlotAction::Admit {
                dst_id: 3,
                packet_id: None,
            },
        );
        h.admit(
            101,
            SlotAction::Admit {
                dst_id: 5,
                packet_id: None,
            },
        );
        assert!(h.is_current_set());
        let released = h.advance_one();
        assert_eq!(released.map(SlotAction::dst_id), Some(3));
        assert_eq!(h.current_tslot(), 101);
        assert!(h.is_current_set());
        assert_eq!(h.action_at(101).map(SlotAction::dst_id), Some(5));
    }

    #[test]
    fn advance_to_skips_unreleased_slots() {
        let mut h = Horizon::new(0);
        h.admit(
            5,
            SlotAction::Admit {
                dst_id: 9,
                packet_id: None,
            },
        );
        h.advance_to(6);
        assert_eq!(h.current_tslot(), 6);
        assert_eq!(h.next_set_tslot(), None, "slot 5 was skipped, not admitted");
    }
}
