//! Per-connection counters, exported for JSON/Prometheus the way
//! `strata-transport::stats` exposes `SenderStats`/`ReceiverStats`.

use serde::Serialize;

/// All FPPROTO-level counters named directly after §4.3/§4.7.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    // ─── Outgoing ───
    pub packets_sent: u64,
    pub acked_packets: u64,
    pub fall_off_outwnd: u64,
    pub timeout_pkts: u64,
    pub req_alloc_errors: u64,

    // ─── Incoming ───
    pub rx_pkts: u64,
    pub rx_dup_pkt: u64,
    pub seqno_before_inwnd: u64,
    pub inwnd_jumped: u64,
    pub rx_unknown_payload: u64,

    // ─── Reset handshake ───
    pub reset_from_bad_pkts: u64,
    pub reset_both_old: u64,
    pub resets_accepted: u64,

    // ─── Malformed input ───
    pub rx_checksum_err: u64,
    pub rx_truncated: u64,
    pub consecutive_bad_pkts: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of sent packets that were never acked (fell off the window
    /// or timed out).
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            let lost = self.fall_off_outwnd + self.timeout_pkts;
            lost as f64 / self.packets_sent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_rate_zero_when_nothing_sent() {
        assert_eq!(ConnectionStats::new().loss_rate(), 0.0);
    }

    #[test]
    fn loss_rate_counts_fall_off_and_timeout() {
        let mut s = ConnectionStats::new();
        s.packets_sent = 10;
        s.fall_off_outwnd = 1;
        s.timeout_pkts = 1;
        assert!((s.loss_rate() - 0.2).abs() < 1e-9);
    }
}
