//! Scheduler-wide tunables, defaulted straight from the external interface
//! table (§6), the same way `strata-bonding`'s `SchedulerConfig` enumerates
//! every knob with an explicit `Default` impl.

/// Maximum number of distinct destinations the dense per-flow tables can
/// address. Matches the bound `fastpass-proto` enforces on decoded `ALLOC`
/// destination indices.
pub const MAX_FLOWS: usize = 4096;

/// Number of future timeslots the horizon bitmask can track (`FASTPASS_HORIZON`).
pub const HORIZON_LEN: usize = 64;

/// Max destination ids batched into a single AREQ chunk (`FASTPASS_PKT_MAX_AREQ`).
pub const PKT_MAX_AREQ: usize = 10;

/// Bound on outstanding (unacked) requested volume per destination
/// (`FASTPASS_REQUEST_WINDOW_SIZE`).
pub const REQUEST_WINDOW_SIZE: u64 = 1 << 16;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Bytes worth of data that amount to one timeslot's worth of credit.
    pub tslot_bytes: u64,
    /// Timeslot reconstruction multiplier: `tslot = (now_ns * tslot_mul) >> tslot_shift`.
    pub tslot_mul: u64,
    pub tslot_shift: u32,
    /// Timeslots an allocation may lag `current_tslot` before being
    /// considered missed.
    pub miss_threshold: u64,
    /// Timeslots an allocation may lead `current_tslot` before being
    /// considered premature.
    pub max_preload: u64,
    /// Periodic watchdog/update timer period, informational only at this layer.
    pub update_timer_ns: u64,
    /// Extra allocated-but-unused headroom tolerated before a destination is
    /// re-queued for another request round (§4.5 `used_slack`). Defaults to
    /// zero: a fresh allocation is re-requested as soon as demand exceeds
    /// what has already been allocated.
    pub used_slack: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tslot_bytes: 1_538, // one MTU-ish Ethernet frame
            tslot_mul: 1,
            tslot_shift: 0,
            miss_threshold: 16,
            max_preload: 64,
            update_timer_ns: 2_048,
            used_slack: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn current_tslot(&self, now_ns: u64) -> u64 {
        now_ns.wrapping_mul(self.tslot_mul) >> self.tslot_shift
    }
}
