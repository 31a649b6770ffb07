//! End-to-end scenarios driving two real `FastpassConnection`s (endpoint and
//! arbiter) against each other over the actual wire codec, not synthetic
//! datagrams.

use fastpass_proto::connection::{ConnectionConfig, FastpassConnection, OutgoingPayload, Role};
use fastpass_proto::ops::{ConnectionOps, TimerOps};
use fastpass_proto::pool::PacketDescriptor;
use fastpass_proto::wire::{AllocPayload, AreqPayload};

const ENDPOINT_IP: [u8; 4] = [10, 0, 0, 1];
const ARBITER_IP: [u8; 4] = [10, 0, 0, 2];

#[derive(Default)]
struct RecordingOps {
    acked: Vec<u64>,
    neg_acked: Vec<u64>,
    resets: Vec<u64>,
}

impl ConnectionOps for RecordingOps {
    fn handle_reset(&mut self, t: u64) {
        self.resets.push(t);
    }
    fn handle_ack(&mut self, pd: PacketDescriptor) {
        self.acked.push(pd.seqno);
    }
    fn handle_neg_ack(&mut self, pd: PacketDescriptor) {
        self.neg_acked.push(pd.seqno);
    }
    fn handle_alloc(&mut self, _alloc: &AllocPayload, _now_ns: u64) {}
    fn handle_areq(&mut self, _areq: &AreqPayload) {}
}

#[derive(Default)]
struct RecordingTimers {
    deadline: Option<u64>,
}

impl TimerOps for RecordingTimers {
    fn set_retransmit_timer(&mut self, deadline_ns: u64) {
        self.deadline = Some(deadline_ns);
    }
    fn cancel_retransmit_timer(&mut self) {
        self.deadline = None;
    }
}

/// Drive both sides through the RESET handshake until each has accepted an
/// epoch, returning the two connections synced and ready to exchange data.
fn handshake() -> (FastpassConnection, FastpassConnection) {
    let mut endpoint = FastpassConnection::new(Role::Endpoint, ConnectionConfig::default());
    let mut arbiter = FastpassConnection::new(Role::Arbiter, ConnectionConfig::default());
    let mut ops = RecordingOps::default();

    // Endpoint initiates with reset_timestamp = 1000; the arbiter has no
    // prior epoch, so it simply adopts it.
    endpoint.force_reset(1_000, &mut ops);

    let mut timers = RecordingTimers::default();
    let payload = OutgoingPayload {
        reset: Some(fastpass_proto::wire::ResetPayload {
            reset_timestamp: 1_000,
        }),
        ..Default::default()
    };
    let seq = endpoint.commit_packet(payload.clone(), 0, &mut ops, &mut timers);
    let datagram = endpoint
        .encode_outgoing(seq, &payload, ENDPOINT_IP, ARBITER_IP)
        .unwrap();

    arbiter.receive_datagram(&datagram.bytes, ENDPOINT_IP, ARBITER_IP, 1, &mut ops);
    assert_eq!(ops.resets, vec![1_000, 1_000]);
    assert!(arbiter.in_sync());

    (endpoint, arbiter)
}

#[test]
fn lost_ack_times_out_exactly_once() {
    let (mut endpoint, _arbiter) = handshake();
    let mut ops = RecordingOps::default();
    let mut timers = RecordingTimers::default();

    let seq = endpoint.commit_packet(OutgoingPayload::default(), 10_000, &mut ops, &mut timers);
    assert_eq!(timers.deadline, Some(10_000 + 200_000));

    // The arbiter never sees this packet; no ACK ever arrives.
    let fire_at = 10_000 + 200_000 + 1;
    endpoint.check_retransmit_timer(fire_at, &mut ops, &mut timers);

    assert_eq!(endpoint.stats.timeout_pkts, 1);
    assert_eq!(endpoint.stats.acked_packets, 0);
    assert_eq!(ops.neg_acked, vec![seq]);
}

#[test]
fn acked_packet_is_removed_from_outgoing_window() {
    let (mut endpoint, mut arbiter) = handshake();
    let mut ops = RecordingOps::default();
    let mut timers = RecordingTimers::default();

    let seq = endpoint.commit_packet(OutgoingPayload::default(), 20_000, &mut ops, &mut timers);
    let datagram = endpoint
        .encode_outgoing(seq, &OutgoingPayload::default(), ENDPOINT_IP, ARBITER_IP)
        .unwrap();
    arbiter.receive_datagram(&datagram.bytes, ENDPOINT_IP, ARBITER_IP, 20_001, &mut ops);
    assert_eq!(arbiter.stats.rx_pkts, 1);

    // Arbiter's next outgoing packet implicitly acks endpoint's seq via its
    // header's ack_seq/ack_vec fields, which reflect in_max_seqno.
    let ack_payload = OutgoingPayload::default();
    let ack_seq = arbiter.commit_packet(ack_payload.clone(), 20_002, &mut ops, &mut timers);
    let ack_datagram = arbiter
        .encode_outgoing(ack_seq, &ack_payload, ARBITER_IP, ENDPOINT_IP)
        .unwrap();

    endpoint.receive_datagram(&ack_datagram.bytes, ARBITER_IP, ENDPOINT_IP, 20_003, &mut ops);
    assert_eq!(endpoint.stats.acked_packets, 1);
    assert_eq!(ops.acked, vec![seq]);
    assert_eq!(endpoint.outwnd_len(), 0);
}

#[test]
fn ten_consecutive_malformed_packets_force_a_single_reset() {
    let (mut endpoint, _arbiter) = handshake();
    let mut ops = RecordingOps::default();
    let mut timers = RecordingTimers::default();

    let seq = endpoint.commit_packet(OutgoingPayload::default(), 0, &mut ops, &mut timers);
    assert_eq!(endpoint.outwnd_len(), 1);

    for _ in 0..10 {
        endpoint.receive_datagram(&[0u8; 3], ENDPOINT_IP, ARBITER_IP, 0, &mut ops);
    }

    assert_eq!(endpoint.stats.reset_from_bad_pkts, 1);
    assert_eq!(endpoint.outwnd_len(), 0);
    assert!(ops.neg_acked.contains(&seq));
}

#[test]
fn reset_handshake_race_deterministic_winner() {
    let mut endpoint = FastpassConnection::new(Role::Endpoint, ConnectionConfig::default());
    let mut arbiter = FastpassConnection::new(Role::Arbiter, ConnectionConfig::default());
    let mut ops = RecordingOps::default();
    let mut timers = RecordingTimers::default();

    // Both sides reset independently within the skew window; endpoint picks
    // the lower timestamp, arbiter the higher one.
    endpoint.force_reset(1_000, &mut ops);
    arbiter.force_reset(1_500, &mut ops);

    let endpoint_reset = OutgoingPayload {
        reset: Some(fastpass_proto::wire::ResetPayload {
            reset_timestamp: 1_000,
        }),
        ..Default::default()
    };
    let seq = endpoint.commit_packet(endpoint_reset.clone(), 0, &mut ops, &mut timers);
    let datagram = endpoint
        .encode_outgoing(seq, &endpoint_reset, ENDPOINT_IP, ARBITER_IP)
        .unwrap();

    // Arbiter already has a more recent local reset (1500 > 1000, and within
    // its own skew window), so it does not re-adopt the endpoint's epoch.
    arbiter.receive_datagram(&datagram.bytes, ENDPOINT_IP, ARBITER_IP, 100, &mut ops);

    let arbiter_reset = OutgoingPayload {
        reset: Some(fastpass_proto::wire::ResetPayload {
            reset_timestamp: 1_500,
        }),
        ..Default::default()
    };
    let aseq = arbiter.commit_packet(arbiter_reset.clone(), 100, &mut ops, &mut timers);
    let adatagram = arbiter
        .encode_outgoing(aseq, &arbiter_reset, ARBITER_IP, ENDPOINT_IP)
        .unwrap();

    endpoint.receive_datagram(&adatagram.bytes, ARBITER_IP, ENDPOINT_IP, 200, &mut ops);

    // The endpoint's older reset loses the race and it adopts the arbiter's
    // higher-timestamp epoch instead.
    assert!(endpoint.in_sync());
}
