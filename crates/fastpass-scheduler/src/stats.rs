//! Scheduler-wide counters, same shape as `fastpass_proto::stats::ConnectionStats`.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub demand_tslots: u64,
    pub alloc_too_late: u64,
    pub alloc_premature: u64,
    pub unwanted_alloc: u64,
    pub timeslots_assumed_lost: u64,
    pub flow_queue_dropped: u64,
    pub rx_unknown_dst: u64,
    pub rx_unknown_payload: u64,
    pub areq_reset_forced: u64,
}
