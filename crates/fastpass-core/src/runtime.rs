//! # Runtime
//!
//! Background-thread glue wiring the wire codec, [`FastpassConnection`], and
//! [`FastpassScheduler`] to a real [`Datagram`] transport (§6A, §9
//! "cyclic references" note). Shaped directly after `strata-bonding`'s
//! `BondingRuntime`: a bounded `crossbeam-channel` command queue drained by
//! one worker thread, a second thread doing the blocking socket read, and a
//! graceful `Shutdown` message sent from `Drop`.
//!
//! Keeping both the command queue and inbound datagrams on one channel,
//! drained by a single thread, is this crate's version of §5's
//! single-writer-per-subsystem rule: the connection and scheduler are never
//! touched from two threads at once.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

use fastpass_proto::connection::{ConnectionConfig, FastpassConnection, OutgoingPayload, Role};
use fastpass_proto::ops::{ConnectionOps, TimerOps};
use fastpass_proto::pacer::{PacerConfig, RequestPacer};
use fastpass_scheduler::{FastpassScheduler, QueuedPacket, SchedulerConfig};

use crate::transport::Datagram;

/// How often the worker wakes up even with nothing in the channel, to drive
/// horizon advancement, pacer checks, and the retransmit timer.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Error returned when a packet cannot be handed to the runtime.
#[derive(Debug)]
pub enum SendError {
    Full,
    Disconnected,
}

enum RuntimeMessage {
    Outbound(u16, Bytes),
    Inbound(Bytes, SocketAddr),
    Shutdown,
}

/// Thread-safe handle to a running Fastpass endpoint.
///
/// Owns a worker thread running the connection + scheduler state machine,
/// and (when constructed via [`FastpassRuntime::spawn`]) a reader thread
/// blocked on the transport's `recv_from`. Dropping the handle triggers a
/// graceful shutdown of both.
pub struct FastpassRuntime {
    sender: Sender<RuntimeMessage>,
    released: Receiver<QueuedPacket>,
    stats: Arc<Mutex<fastpass_scheduler::SchedulerStats>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    reader: Option<thread::JoinHandle<()>>,
}

impl FastpassRuntime {
    /// Spawn a runtime driving `transport` as the given `role`, talking to
    /// `peer_addr`. `now_ns` seeds the initial reset epoch and the
    /// scheduler's starting timeslot.
    pub fn spawn(
        role: Role,
        transport: Arc<dyn Datagram>,
        peer_addr: SocketAddr,
        connection_config: ConnectionConfig,
        scheduler_config: SchedulerConfig,
        pacer_config: PacerConfig,
        now_ns: u64,
    ) -> Self {
        let (tx, rx) = bounded(4096);
        let (released_tx, released_rx) = bounded(4096);
        let stats = Arc::new(Mutex::new(fastpass_scheduler::SchedulerStats::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_stats = stats.clone();
        let worker_transport = transport.clone();
        let worker = thread::Builder::new()
            .name("fastpass-worker".into())
            .spawn(move || {
                worker_loop(
                    rx,
                    released_tx,
                    worker_stats,
                    worker_transport,
                    role,
                    peer_addr,
                    connection_config,
                    scheduler_config,
                    pacer_config,
                    now_ns,
                )
            })
            .expect("failed to spawn fastpass worker thread");

        let reader_tx = tx.clone();
        let reader_transport = transport;
        let reader_shutdown = shutdown.clone();
        let reader = thread::Builder::new()
            .name("fastpass-reader".into())
            .spawn(move || reader_loop(reader_tx, reader_transport, reader_shutdown))
            .expect("failed to spawn fastpass reader thread");

        FastpassRuntime {
            sender: tx,
            released: released_rx,
            stats,
            shutdown,
            worker: Some(worker),
            reader: Some(reader),
        }
    }

    /// Hand a data packet to the scheduler for classification/admission.
    /// Returns immediately; admission happens asynchronously on the worker
    /// thread.
    pub fn send_packet(&self, dst_id: u16, bytes: Bytes) -> Result<(), SendError> {
        match self.sender.try_send(RuntimeMessage::Outbound(dst_id, bytes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SendError::Disconnected),
        }
    }

    /// Non-blocking poll for a packet the scheduler has admitted onto the
    /// horizon and released.
    pub fn try_recv_released(&self) -> Option<QueuedPacket> {
        self.released.try_recv().ok()
    }

    /// Snapshot of the scheduler's counters.
    pub fn stats(&self) -> fastpass_scheduler::SchedulerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Gracefully shut down both threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.sender.send(RuntimeMessage::Shutdown);
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

impl Drop for FastpassRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Blocks on `transport.recv_from` and forwards every datagram to the
/// worker. The transport is expected to have a short read timeout set (see
/// [`crate::transport::UdpTransport::set_read_timeout`]) so this loop can
/// observe `shutdown` between reads instead of blocking forever.
fn reader_loop(tx: Sender<RuntimeMessage>, transport: Arc<dyn Datagram>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; 2048];
    while !shutdown.load(Ordering::SeqCst) {
        match transport.recv_from(&mut buf) {
            Ok((n, from)) => {
                let bytes = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(RuntimeMessage::Inbound(bytes, from)).is_err() {
                    break;
                }
            }
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) => {}
            Err(e) => {
                warn!(error = %e, "transport recv_from failed");
            }
        }
    }
}

/// Timer state the worker loop polls each tick rather than a real OS timer,
/// since the loop already wakes up on `TICK_INTERVAL`.
#[derive(Default)]
struct PolledTimers {
    retransmit_deadline_ns: Option<u64>,
}

impl TimerOps for PolledTimers {
    fn set_retransmit_timer(&mut self, deadline_ns: u64) {
        self.retransmit_deadline_ns = Some(deadline_ns);
    }
    fn cancel_retransmit_timer(&mut self) {
        self.retransmit_deadline_ns = None;
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    rx: Receiver<RuntimeMessage>,
    released_tx: Sender<QueuedPacket>,
    stats: Arc<Mutex<fastpass_scheduler::SchedulerStats>>,
    transport: Arc<dyn Datagram>,
    role: Role,
    peer_addr: SocketAddr,
    connection_config: ConnectionConfig,
    scheduler_config: SchedulerConfig,
    pacer_config: PacerConfig,
    start_ns: u64,
) {
    let clock = quanta::Clock::new();
    let start_instant = clock.now();
    let now_ns = move || start_ns + clock.now().duration_since(start_instant).as_nanos() as u64;

    let local_ip = transport.local_ip().unwrap_or([0, 0, 0, 0]);
    let peer_ip = match peer_addr.ip() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => [0, 0, 0, 0],
    };

    let mut connection = FastpassConnection::new(role, connection_config);
    let mut scheduler = FastpassScheduler::new(scheduler_config, start_ns);
    let mut pacer = RequestPacer::new(pacer_config, start_ns);
    let mut timers = PolledTimers::default();
    let mut pacer_deadline_ns: Option<u64> = None;

    send_reset(&mut connection, &mut scheduler, &transport, local_ip, peer_ip, peer_addr, start_ns, &mut timers);

    loop {
        match rx.recv_timeout(TICK_INTERVAL) {
            Ok(RuntimeMessage::Outbound(dst_id, bytes)) => {
                scheduler.enqueue(dst_id, bytes);
            }
            Ok(RuntimeMessage::Inbound(bytes, from)) => {
                connection.receive_datagram(&bytes, peer_ip_of(from), local_ip, now_ns(), &mut scheduler);
            }
            Ok(RuntimeMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = now_ns();
        scheduler.advance_to(now);
        while let Some(pkt) = scheduler.dequeue() {
            if released_tx.try_send(pkt).is_err() {
                break;
            }
        }

        if role == Role::Endpoint {
            drive_request_pacer(
                &mut connection,
                &mut scheduler,
                &mut pacer,
                &mut pacer_deadline_ns,
                &transport,
                local_ip,
                peer_ip,
                peer_addr,
                now,
                &mut timers,
            );
        }

        if let Some(deadline) = timers.retransmit_deadline_ns {
            if now >= deadline {
                connection.check_retransmit_timer(now, &mut scheduler, &mut timers);
            }
        }

        if scheduler.take_needs_reset() {
            debug!("AREQ feedback forced a reset");
            connection.force_reset(now, &mut scheduler);
            send_reset_payload(&mut connection, &mut scheduler, &transport, local_ip, peer_ip, peer_addr, now, &mut timers);
        }

        if let Ok(mut guard) = stats.lock() {
            *guard = scheduler.stats.clone();
        }
    }
}

fn peer_ip_of(addr: SocketAddr) -> [u8; 4] {
    match addr.ip() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => [0, 0, 0, 0],
    }
}

#[allow(clippy::too_many_arguments)]
fn send_reset(
    connection: &mut FastpassConnection,
    scheduler: &mut FastpassScheduler,
    transport: &Arc<dyn Datagram>,
    local_ip: [u8; 4],
    peer_ip: [u8; 4],
    peer_addr: SocketAddr,
    now_ns: u64,
    timers: &mut PolledTimers,
) {
    connection.force_reset(now_ns, scheduler);
    send_reset_payload(connection, scheduler, transport, local_ip, peer_ip, peer_addr, now_ns, timers);
}

#[allow(clippy::too_many_arguments)]
fn send_reset_payload(
    connection: &mut FastpassConnection,
    scheduler: &mut FastpassScheduler,
    transport: &Arc<dyn Datagram>,
    local_ip: [u8; 4],
    peer_ip: [u8; 4],
    peer_addr: SocketAddr,
    now_ns: u64,
    timers: &mut PolledTimers,
) {
    let payload = OutgoingPayload {
        reset: Some(fastpass_proto::wire::ResetPayload {
            reset_timestamp: now_ns,
        }),
        ..Default::default()
    };
    send_payload(connection, scheduler, transport, payload, local_ip, peer_ip, peer_addr, now_ns, timers);
}

#[allow(clippy::too_many_arguments)]
fn drive_request_pacer(
    connection: &mut FastpassConnection,
    scheduler: &mut FastpassScheduler,
    pacer: &mut RequestPacer,
    pacer_deadline_ns: &mut Option<u64>,
    transport: &Arc<dyn Datagram>,
    local_ip: [u8; 4],
    peer_ip: [u8; 4],
    peer_addr: SocketAddr,
    now_ns: u64,
    timers: &mut PolledTimers,
) {
    match *pacer_deadline_ns {
        Some(deadline) if now_ns >= deadline => {
            pacer.reset(now_ns);
            *pacer_deadline_ns = None;
            if let Some(areq) = scheduler.build_areq() {
                let payload = OutgoingPayload {
                    areq: Some(areq),
                    ..Default::default()
                };
                send_payload(connection, scheduler, transport, payload, local_ip, peer_ip, peer_addr, now_ns, timers);
            }
        }
        Some(_) => {}
        None => {
            if scheduler.demand_exceeds_requested() {
                if let Some(deadline) = pacer.trigger(now_ns) {
                    *pacer_deadline_ns = Some(deadline);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn send_payload(
    connection: &mut FastpassConnection,
    scheduler: &mut FastpassScheduler,
    transport: &Arc<dyn Datagram>,
    payload: OutgoingPayload,
    local_ip: [u8; 4],
    peer_ip: [u8; 4],
    peer_addr: SocketAddr,
    now_ns: u64,
    timers: &mut PolledTimers,
) {
    let seqno = connection.commit_packet(payload.clone(), now_ns, scheduler, timers);
    if let Some(datagram) = connection.encode_outgoing(seqno, &payload, local_ip, peer_ip) {
        if let Err(e) = transport.send_to(&datagram.bytes, peer_addr) {
            warn!(error = %e, "failed to send datagram");
        }
    }
}
