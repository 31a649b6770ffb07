//! Endpoint-side timeslot scheduler built on top of `fastpass-proto`: demand
//! accounting, request assembly, and allocation admission (§3-4.6).

pub mod config;
pub mod destination;
pub mod horizon;
pub mod scheduler;
pub mod stats;

pub use config::{SchedulerConfig, HORIZON_LEN, MAX_FLOWS, PKT_MAX_AREQ, REQUEST_WINDOW_SIZE};
pub use destination::{Destination, DestinationTable, FlowState};
pub use horizon::{Horizon, SlotAction};
pub use scheduler::{EnqueueOutcome, FastpassScheduler, QueuedPacket, INTERNAL_DST_ID};
pub use stats::SchedulerStats;
