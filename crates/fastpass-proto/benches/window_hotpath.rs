//! Per-operation hotpath benchmarks for the sliding window and connection
//! fast path.
//!
//! Run with: cargo bench --package fastpass-proto

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fastpass_proto::connection::{ConnectionConfig, FastpassConnection, OutgoingPayload, Role};
use fastpass_proto::ops::{ConnectionOps, TimerOps};
use fastpass_proto::pool::PacketDescriptor;
use fastpass_proto::wire::{AllocPayload, AreqPayload};
use fastpass_proto::window::SlidingWindow;

struct NullOps;

impl ConnectionOps for NullOps {
    fn handle_reset(&mut self, _reset_timestamp: u64) {}
    fn handle_ack(&mut self, _pd: PacketDescriptor) {}
    fn handle_neg_ack(&mut self, _pd: PacketDescriptor) {}
    fn handle_alloc(&mut self, _alloc: &AllocPayload, _now_ns: u64) {}
    fn handle_areq(&mut self, _areq: &AreqPayload) {}
}

struct NullTimers;

impl TimerOps for NullTimers {
    fn set_retransmit_timer(&mut self, _deadline_ns: u64) {}
    fn cancel_retransmit_timer(&mut self) {}
}

fn bench_window_mark_advance(c: &mut Criterion) {
    c.bench_function("sliding_window_mark_sequential", |b| {
        let mut w = SlidingWindow::new(256);
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            black_box(w.mark(seq).unwrap());
        });
    });
}

fn bench_window_is_set(c: &mut Criterion) {
    let mut w = SlidingWindow::new(1024);
    for seq in 0..1024 {
        w.mark(seq).unwrap();
    }
    c.bench_function("sliding_window_is_set_hit", |b| {
        b.iter(|| black_box(w.is_set(black_box(900))));
    });
}

fn bench_commit_packet(c: &mut Criterion) {
    c.bench_function("connection_commit_packet", |b| {
        let mut conn = FastpassConnection::new(Role::Endpoint, ConnectionConfig::default());
        let mut ops = NullOps;
        conn.force_reset(0, &mut ops);
        let mut timers = NullTimers;
        let mut now = 0u64;
        b.iter(|| {
            now += 1;
            black_box(conn.commit_packet(OutgoingPayload::default(), now, &mut ops, &mut timers));
        });
    });
}

criterion_group!(
    benches,
    bench_window_mark_advance,
    bench_window_is_set,
    bench_commit_packet,
);
criterion_main!(benches);
