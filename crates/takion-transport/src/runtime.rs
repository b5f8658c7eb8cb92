//! # Runtime
//!
//! Runs a [`Session`] against a real UDP socket on two threads:
//!
//! - **`takion-io`** owns the socket and the session: inbound datagrams,
//!   outbound control, timers.
//! - **`takion-fec`** owns the [`ReassemblyBuffer`] so FEC decodes never hold
//!   up heartbeats.
//!
//! ```text
//!   socket ──▶ takion-io ──shards──▶ takion-fec ──frames──▶ consumer
//!                 ▲                      │
//!                 └──── retired groups ──┘   (CORRUPTFRAME reports)
//! ```
//!
//! Both queues are bounded crossbeam channels. Dropping the runtime
//! disconnects the session and joins both threads.

use crate::config::SessionConfig;
use crate::crypto::EcdhKeypair;
use crate::message::TakionMessage;
use crate::reassembly::{Frame, ReassemblyBuffer, RetiredGroup, StreamShard};
use crate::session::{DisconnectReason, Session, SessionEvent, SessionState};
use crate::stats::{CongestionStats, ReassemblyStats, SessionStats};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use quanta::Instant;
use serde::Serialize;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest datagram the console sends.
const RECV_BUFFER_LEN: usize = 65_536;
/// Upper bound on how long the I/O loop sleeps in `recv`.
const IO_TICK: Duration = Duration::from_millis(5);
const SHARD_QUEUE: usize = 4096;
const RETIRED_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 64;

// ─── Consumer ───────────────────────────────────────────────────────────────

/// Receiver of everything the engine produces.
///
/// Frames arrive on the FEC thread, everything else on the I/O thread; calls
/// are serialized through one lock.
pub trait StreamConsumer: Send + 'static {
    /// A reassembled frame, in non-decreasing frame order per stream.
    fn on_frame(&mut self, frame: &Frame);

    fn on_connection_quality(&mut self, _stats: &CongestionStats) {}

    /// Pass-through control: STREAMINFO, FPSCHANGE, SERVERSETTINGS,
    /// IDRREQUEST, XMBCOMMAND and the rest.
    fn on_control(&mut self, _message: &TakionMessage) {}

    /// Called exactly once, after the last frame.
    fn on_disconnect(&mut self, reason: &DisconnectReason);
}

type SharedConsumer<C> = Arc<Mutex<C>>;

fn with_consumer<C: StreamConsumer>(consumer: &SharedConsumer<C>, f: impl FnOnce(&mut C)) {
    let mut guard = consumer.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Counters published by the runtime threads.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub state: SessionState,
    pub session: SessionStats,
    pub congestion: CongestionStats,
    pub reassembly: ReassemblyStats,
    /// Shards dropped because the FEC thread fell behind.
    pub shards_dropped: u64,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        RuntimeStats {
            state: SessionState::Disconnected,
            session: SessionStats::default(),
            congestion: CongestionStats::default(),
            reassembly: ReassemblyStats::default(),
            shards_dropped: 0,
        }
    }
}

enum Command {
    Control(TakionMessage),
    Disconnect,
}

// ─── Runtime ────────────────────────────────────────────────────────────────

/// Handle to a running session.
pub struct TakionRuntime {
    command_tx: Sender<Command>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<RuntimeStats>>,
    io: Option<thread::JoinHandle<()>>,
    peer: SocketAddr,
}

impl TakionRuntime {
    /// Bind an ephemeral socket, connect it to `peer` and start the handshake.
    pub fn connect<C: StreamConsumer>(
        peer: SocketAddr,
        config: SessionConfig,
        keys: EcdhKeypair,
        session_key: impl Into<String>,
        consumer: C,
    ) -> anyhow::Result<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(peer)?;
        let session = Session::new(config, keys, session_key);
        Self::start(socket, session, consumer)
    }

    /// Drive `session` over an already connected socket.
    pub fn start<C: StreamConsumer>(
        socket: UdpSocket,
        mut session: Session,
        consumer: C,
    ) -> anyhow::Result<Self> {
        let peer = socket.peer_addr()?;
        socket.set_read_timeout(Some(IO_TICK))?;

        let reassembly_config = session.config().reassembly.clone();
        session.connect(Instant::now())?;

        let (shard_tx, shard_rx) = bounded::<StreamShard>(SHARD_QUEUE);
        let (retired_tx, retired_rx) = bounded::<Vec<RetiredGroup>>(RETIRED_QUEUE);
        let (command_tx, command_rx) = bounded::<Command>(COMMAND_QUEUE);
        let consumer: SharedConsumer<C> = Arc::new(Mutex::new(consumer));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(RuntimeStats::default()));

        let fec = {
            let consumer = consumer.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("takion-fec".into())
                .spawn(move || {
                    let buffer = ReassemblyBuffer::new(reassembly_config);
                    fec_worker(buffer, shard_rx, retired_tx, consumer, stats)
                })?
        };

        let io = {
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let worker = IoWorker {
                socket,
                session,
                shard_tx: Some(shard_tx),
                fec: Some(fec),
                reason: None,
                retired_rx,
                command_rx,
                consumer,
                stats,
                shutdown,
                shards_dropped: 0,
            };
            thread::Builder::new()
                .name("takion-io".into())
                .spawn(move || worker.run())?
        };

        info!(%peer, "takion runtime started");
        Ok(TakionRuntime {
            command_tx,
            shutdown,
            stats,
            io: Some(io),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Latest counters.
    pub fn stats(&self) -> RuntimeStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> SessionState {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Whether the session has ended and both threads are done.
    pub fn is_finished(&self) -> bool {
        self.io.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Queue a control message. The session drops it unless it is streaming.
    pub fn send_control(&self, message: TakionMessage) -> anyhow::Result<()> {
        self.command_tx
            .send(Command::Control(message))
            .map_err(|e| anyhow::anyhow!("session is gone: {}", e))
    }

    /// Send DISCONNECT, stop both threads and release the socket. Idempotent.
    pub fn disconnect(&mut self) {
        let _ = self.command_tx.try_send(Command::Disconnect);
        self.shutdown.store(true, Ordering::Relaxed);
        // The I/O thread joins the FEC thread before it exits.
        if let Some(handle) = self.io.take() {
            if handle.join().is_err() {
                warn!("takion-io thread panicked");
            }
        }
    }
}

impl Drop for TakionRuntime {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ─── I/O thread ─────────────────────────────────────────────────────────────

struct IoWorker<C: StreamConsumer> {
    socket: UdpSocket,
    session: Session,
    /// Dropped when the session ends so the FEC thread drains and exits.
    shard_tx: Option<Sender<StreamShard>>,
    fec: Option<thread::JoinHandle<()>>,
    reason: Option<DisconnectReason>,
    retired_rx: Receiver<Vec<RetiredGroup>>,
    command_rx: Receiver<Command>,
    consumer: SharedConsumer<C>,
    stats: Arc<Mutex<RuntimeStats>>,
    shutdown: Arc<AtomicBool>,
    shards_dropped: u64,
}

impl<C: StreamConsumer> IoWorker<C> {
    fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let mut last_stats = Instant::now();
        let mut finished = self.flush_events();

        while !finished {
            if self.shutdown.load(Ordering::Relaxed) {
                self.session.disconnect();
                self.flush_events();
                break;
            }
            loop {
                match self.command_rx.try_recv() {
                    Ok(Command::Control(message)) => {
                        if let Err(err) = self.session.send_control(message) {
                            debug!(%err, "control message dropped");
                        }
                    }
                    Ok(Command::Disconnect) | Err(TryRecvError::Disconnected) => {
                        self.session.disconnect();
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
            if self.flush_events() {
                break;
            }

            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    let datagram = Bytes::copy_from_slice(&buf[..n]);
                    self.session.handle_datagram(Instant::now(), datagram);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => debug!(error = %e, "socket receive failed"),
            }

            let retired: Vec<RetiredGroup> = self.retired_rx.try_iter().flatten().collect();
            if !retired.is_empty() {
                self.session.report_retired(&retired);
            }
            self.session.poll_timers(Instant::now());
            finished = self.flush_events();

            if last_stats.elapsed() >= Duration::from_millis(100) {
                self.publish_stats();
                last_stats = Instant::now();
            }
        }
        self.publish_stats();
        // Closing the shard queue ends the FEC thread.
        self.shard_tx = None;
        if let Some(handle) = self.fec.take() {
            if handle.join().is_err() {
                warn!("takion-fec thread panicked");
            }
        }
        let reason = self.reason.take().unwrap_or(DisconnectReason::Local);
        with_consumer(&self.consumer, |c| c.on_disconnect(&reason));
        let congestion = self.session.congestion().stats();
        info!(
            code = reason.code(),
            drop_ratio = self.session.stats().drop_ratio(),
            cumulative_loss = congestion.cumulative_loss(),
            rto_ms = congestion.rto_ms,
            "takion-io stopped"
        );
    }

    /// Act on queued session events. Returns true once the session ended.
    fn flush_events(&mut self) -> bool {
        let mut finished = false;
        while let Some(event) = self.session.poll_event() {
            match event {
                SessionEvent::Transmit(datagram) => {
                    if let Err(e) = self.socket.send(&datagram) {
                        debug!(error = %e, len = datagram.len(), "socket send failed");
                    }
                }
                SessionEvent::Shard(shard) => self.forward_shard(shard),
                SessionEvent::Control(message) => {
                    with_consumer(&self.consumer, |c| c.on_control(&message))
                }
                SessionEvent::ConnectionQuality(stats) => {
                    with_consumer(&self.consumer, |c| c.on_connection_quality(&stats))
                }
                SessionEvent::StateChanged { to, .. } => {
                    self.stats.lock().unwrap_or_else(|e| e.into_inner()).state = to;
                }
                SessionEvent::Disconnected(reason) => {
                    self.reason = Some(reason);
                    finished = true;
                }
            }
        }
        finished
    }

    fn forward_shard(&mut self, shard: StreamShard) {
        let Some(tx) = &self.shard_tx else {
            return;
        };
        match tx.try_send(shard) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shards_dropped += 1;
                if self.shards_dropped.is_power_of_two() {
                    warn!(dropped = self.shards_dropped, "FEC queue full, shard dropped");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("FEC thread gone");
                self.shard_tx = None;
            }
        }
    }

    fn publish_stats(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.state = self.session.state();
        stats.session = self.session.stats().clone();
        stats.congestion = self.session.congestion().stats();
        stats.shards_dropped = self.shards_dropped;
    }
}

// ─── FEC thread ─────────────────────────────────────────────────────────────

fn fec_worker<C: StreamConsumer>(
    mut buffer: ReassemblyBuffer,
    shard_rx: Receiver<StreamShard>,
    retired_tx: Sender<Vec<RetiredGroup>>,
    consumer: SharedConsumer<C>,
    stats: Arc<Mutex<RuntimeStats>>,
) {
    let mut last_stats = Instant::now();
    while let Ok(shard) = shard_rx.recv() {
        let frame = buffer.accept(shard);
        // Frames of retired lower groups go first to keep delivery ordered.
        let retired = buffer.drain_retired();
        deliver_retired(&consumer, &retired);
        if let Some(frame) = frame {
            with_consumer(&consumer, |c| c.on_frame(&frame));
        }
        if !retired.is_empty() && retired_tx.try_send(retired).is_err() {
            debug!("retired-group report dropped");
        }
        if last_stats.elapsed() >= Duration::from_millis(100) {
            stats.lock().unwrap_or_else(|e| e.into_inner()).reassembly = buffer.stats();
            last_stats = Instant::now();
        }
    }

    buffer.flush();
    let retired = buffer.drain_retired();
    deliver_retired(&consumer, &retired);
    let summary = buffer.stats();
    debug!(
        flushed = retired.len(),
        recovery_ratio = summary.recovery_ratio(),
        "takion-fec stopped"
    );
    stats.lock().unwrap_or_else(|e| e.into_inner()).reassembly = summary;
}

fn deliver_retired<C: StreamConsumer>(consumer: &SharedConsumer<C>, retired: &[RetiredGroup]) {
    for frame in retired.iter().filter_map(|g| g.frame.as_ref()) {
        with_consumer(consumer, |c| c.on_frame(frame));
    }
}
