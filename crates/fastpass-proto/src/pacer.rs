//! # Request Pacer
//!
//! Token-bucket gate on how often request-packet assembly may run (§4.4),
//! the same shape as `strata-transport::congestion`'s pacing-rate gate but
//! stripped down to the single knob FPPROTO needs: a fixed per-request cost
//! rather than an adaptive BBR estimate.

/// `trigger`/`reset` parameters, named directly after the C constants.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PacerConfig {
    /// Nanosecond cost charged to the bucket per triggered event.
    pub req_cost_ns: u64,
    /// Maximum nanoseconds the bucket may accumulate ("how early" a trigger
    /// can fire relative to the ideal schedule).
    pub req_bucketlen_ns: u64,
    /// Minimum gap enforced between two triggers regardless of bucket state.
    pub req_min_gap_ns: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        let req_cost_ns = 2_097_152;
        PacerConfig {
            req_cost_ns,
            req_bucketlen_ns: 4 * req_cost_ns,
            req_min_gap_ns: 1_000,
        }
    }
}

/// Token-bucket request pacer. All mutation happens through `&mut self`, so
/// callers provide their own serialization (the connection calls this while
/// already holding its internal lock, per §5).
#[derive(Debug, Clone)]
pub struct RequestPacer {
    config: PacerConfig,
    last_refill_ns: u64,
    triggered: bool,
}

impl RequestPacer {
    pub fn new(config: PacerConfig, now_ns: u64) -> Self {
        RequestPacer {
            config,
            last_refill_ns: now_ns,
            triggered: false,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Request that request-packet assembly run. Returns `Some(next_event_ns)`
    /// the first time this is called since the last [`RequestPacer::reset`];
    /// returns `None` if a trigger is already pending (caller should do
    /// nothing further — assembly will run once the pending event fires).
    pub fn trigger(&mut self, now_ns: u64) -> Option<u64> {
        if self.triggered {
            return None;
        }
        self.triggered = true;
        let earliest_by_cost = self.last_refill_ns + self.config.req_cost_ns;
        let earliest_by_gap = now_ns + self.config.req_min_gap_ns;
        Some(earliest_by_cost.max(earliest_by_gap))
    }

    /// Consume tokens for the event that just ran at `now_ns` and clear the
    /// pending trigger, capping the refill point so the bucket never
    /// accumulates more than `req_bucketlen_ns` of credit.
    pub fn reset(&mut self, now_ns: u64) {
        let floor = now_ns.saturating_sub(self.config.req_bucketlen_ns);
        self.last_refill_ns = self.last_refill_ns.max(floor);
        self.triggered = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_then_trigger_again_is_noop() {
        let mut pacer = RequestPacer::new(PacerConfig::default(), 0);
        assert!(pacer.trigger(0).is_some());
        assert!(pacer.trigger(10).is_none(), "already triggered");
    }

    #[test]
    fn reset_clears_trigger_allowing_new_one() {
        let mut pacer = RequestPacer::new(PacerConfig::default(), 0);
        pacer.trigger(0);
        pacer.reset(1_000);
        assert!(!pacer.is_triggered());
        assert!(pacer.trigger(1_000).is_some());
    }

    #[test]
    fn min_gap_enforced_even_with_empty_bucket() {
        let config = PacerConfig {
            req_cost_ns: 0,
            req_bucketlen_ns: 1_000,
            req_min_gap_ns: 500,
        };
        let mut pacer = RequestPacer::new(config, 0);
        let next = pacer.trigger(100).unwrap();
        assert_eq!(next, 600, "floor is now + min_gap when cost is zero");
    }

    #[test]
    fn cost_dominates_when_larger_than_gap() {
        let config = PacerConfig {
            req_cost_ns: 5_000,
            req_bucketlen_ns: 10_000,
            req_min_gap_ns: 100,
        };
        let mut pacer = RequestPacer::new(config, 1_000);
        let next = pacer.trigger(1_050).unwrap();
        assert_eq!(next, 6_000, "last_refill(1000) + cost(5000)");
    }

    #[test]
    fn bucket_credit_is_capped_by_bucketlen() {
        let config = PacerConfig {
            req_cost_ns: 100,
            req_bucketlen_ns: 1_000,
            req_min_gap_ns: 0,
        };
        let mut pacer = RequestPacer::new(config, 0);
        // Idle for a long time: refill point should not regress behind
        // now - bucketlen.
        pacer.reset(1_000_000);
        assert_eq!(pacer.last_refill_ns, 1_000_000 - 1_000);
    }
}
