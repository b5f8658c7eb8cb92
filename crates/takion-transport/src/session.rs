//! # Session State Machine
//!
//! Drives one Takion session from the first INIT to the final DISCONNECT.
//! The machine is sans-IO: datagrams and clock ticks go in, [`SessionEvent`]s
//! come out, and the caller owns the socket.
//!
//! ```text
//!   Disconnected ──connect──▶ Init ──COOKIE_ACK──▶ AwaitBang ──BANG──▶ Negotiating
//!                             │ INIT/COOKIE         │ BIG                │ INFO ⇄ STREAMINFO
//!                             ▼                     ▼                    ▼
//!                        HandshakeTimeout    HandshakeRejected     BandwidthTest
//!                                                                        │ Senkusha
//!                                                                        ▼
//!   Disconnected ◀──────────── Disconnecting ◀──DISCONNECT/local──── Streaming
//! ```
//!
//! Every handshake step is a bounded [`Phase`]: an attempt counter plus a
//! deadline. A timeout or a protocol error costs one attempt and resends the
//! step's request; running out of attempts ends the session with
//! [`DisconnectReason::HandshakeTimeout`]. Authentication failures end it
//! immediately.

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use rand::RngExt;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::congestion::CongestionMonitor;
use crate::crypto::{derive_session, CryptoContext, CryptoError, EcdhKeypair, Role};
use crate::launch::{LaunchError, LaunchParams, FPS_30};
use crate::message::{
    BangPayload, BigPayload, CodecError, ConnectionQualityPayload, CorruptFramePayload,
    DisconnectPayload, InfoPayload, PacketLossPayload, PeriodicTimestampPayload,
    SenkushaBandwidth, SenkushaClientMtu, SenkushaEcho, SenkushaMtu, SenkushaPayload,
    StreamInfoPayload, TakionMessage,
};
use crate::packet::{
    AvPacket, Chunk, CongestionPacket, ControlPacket, HeaderType, InitParams, StreamKind,
};
use crate::reassembly::{RetiredGroup, StreamShard};
use crate::stats::{CongestionStats, SessionStats};

/// Channel for client messages and HEARTBEAT replies.
pub const CONTROL_CHANNEL: u16 = 1;
/// Channel STREAMINFOACK is sent on.
pub const STREAM_INFO_ACK_CHANNEL: u16 = 9;
/// Chunk flags on outbound DATA.
pub const DATA_FLAGS: u8 = 1;
/// Reason string of a local disconnect.
pub const CLIENT_DISCONNECT_REASON: &str = "Client Disconnecting";

// ─── Session State ──────────────────────────────────────────────────────────

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum SessionState {
    /// No session; datagrams are ignored.
    Disconnected,
    /// Association setup (INIT / COOKIE).
    Init,
    /// BIG sent, waiting for BANG.
    AwaitBang,
    /// Exchanging INFO and STREAMINFO.
    Negotiating,
    /// Senkusha echo, MTU and bandwidth probes.
    BandwidthTest,
    /// Receiving audio and video.
    Streaming,
    /// Tearing down.
    Disconnecting,
}

impl SessionState {
    /// Whether the session key exists in this state.
    pub fn is_keyed(self) -> bool {
        matches!(
            self,
            SessionState::Negotiating | SessionState::BandwidthTest | SessionState::Streaming
        )
    }
}

// ─── Reasons and Errors ─────────────────────────────────────────────────────

/// Why a session ended. Every variant is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    #[error("disconnected by the client")]
    Local,
    #[error("console disconnected: {reason}")]
    Remote { reason: String, code: Option<u32> },
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("{phase} timed out after {attempts} attempts")]
    HandshakeTimeout { phase: &'static str, attempts: u32 },
    #[error("authentication failed at key position {key_pos}")]
    AuthenticationFailed { key_pos: u32 },
    #[error("no datagram from the console for {0:?}")]
    PeerTimeout(Duration),
}

impl DisconnectReason {
    /// Stable identifier for logs and consumers.
    pub fn code(&self) -> &'static str {
        match self {
            DisconnectReason::Local => "local",
            DisconnectReason::Remote { .. } => "remote",
            DisconnectReason::HandshakeRejected(_) => "handshake_rejected",
            DisconnectReason::HandshakeTimeout { .. } => "handshake_timeout",
            DisconnectReason::AuthenticationFailed { .. } => "authentication_failed",
            DisconnectReason::PeerTimeout(_) => "peer_timeout",
        }
    }

    /// Whether the session ended on a fault rather than on request.
    pub fn is_error(&self) -> bool {
        !matches!(self, DisconnectReason::Local | DisconnectReason::Remote { .. })
    }
}

/// Errors returned by caller-driven session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation} is not possible while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Output of the state machine, drained with [`Session::poll_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A datagram to send to the console.
    Transmit(Bytes),
    /// A decrypted AV shard for the reassembly buffer.
    Shard(StreamShard),
    /// A control message for the consumer (STREAMINFO and pass-through kinds).
    Control(TakionMessage),
    /// Periodic quality snapshot, sent to the console at the same time.
    ConnectionQuality(CongestionStats),
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// The session ended. Always the last event.
    Disconnected(DisconnectReason),
}

// ─── Phases ─────────────────────────────────────────────────────────────────

/// One bounded handshake step.
#[derive(Debug, Clone, Copy)]
struct Phase {
    name: &'static str,
    attempts: u32,
    limit: u32,
    timeout: Duration,
    deadline: Instant,
}

impl Phase {
    fn start(name: &'static str, limit: u32, timeout: Duration, now: Instant) -> Self {
        Phase {
            name,
            attempts: 1,
            limit: limit.max(1),
            timeout,
            deadline: now + timeout,
        }
    }

    fn exhausted(&self) -> bool {
        self.attempts >= self.limit
    }

    fn retry(&mut self, now: Instant) {
        self.attempts += 1;
        self.deadline = now + self.timeout;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    AwaitInitAck,
    AwaitCookieAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeStep {
    Echo,
    Mtu,
    Bandwidth,
    ClientMtu,
}

impl ProbeStep {
    fn name(self) -> &'static str {
        match self {
            ProbeStep::Echo => "SENKUSHA ECHO",
            ProbeStep::Mtu => "SENKUSHA MTU",
            ProbeStep::Bandwidth => "SENKUSHA BANDWIDTH",
            ProbeStep::ClientMtu => "SENKUSHA CLIENT_MTU",
        }
    }

    fn next(self) -> Option<ProbeStep> {
        match self {
            ProbeStep::Echo => Some(ProbeStep::Mtu),
            ProbeStep::Mtu => Some(ProbeStep::Bandwidth),
            ProbeStep::Bandwidth => Some(ProbeStep::ClientMtu),
            ProbeStep::ClientMtu => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    step: ProbeStep,
    id: u32,
    sent_at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct Negotiation {
    stream_info: bool,
    peer_info: bool,
}

// ─── Per-stream tracking ────────────────────────────────────────────────────

/// Extends a wrapping 16-bit counter to a monotonic 32-bit one.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexUnwrapper {
    highest: Option<u32>,
}

impl IndexUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `index` relative to the highest index seen so far. Indices up
    /// to half the range behind it are treated as reordered, not wrapped.
    /// Returns `None` for an index that would fall before zero.
    pub fn unwrap(&mut self, index: u16) -> Option<u32> {
        let Some(highest) = self.highest else {
            self.highest = Some(index as u32);
            return Some(index as u32);
        };
        let delta = index.wrapping_sub(highest as u16) as i16 as i64;
        let value = u32::try_from(highest as i64 + delta).ok()?;
        if value > highest {
            self.highest = Some(value);
        }
        Some(value)
    }
}

/// Packet-index loss window for one stream between congestion reports.
#[derive(Debug, Clone, Copy, Default)]
struct LossTracker {
    start: Option<u32>,
    end: u32,
    received: u32,
}

impl LossTracker {
    fn record(&mut self, packet: u32) {
        match self.start {
            Some(start) if packet < start => {}
            Some(_) if self.received > 0 => {
                self.end = self.end.max(packet);
                self.received += 1;
            }
            Some(_) => {
                self.end = packet;
                self.received = 1;
            }
            None => {
                self.start = Some(packet);
                self.end = packet;
                self.received = 1;
            }
        }
    }

    /// Close the window: `(start, end, received)`, or nothing if no packet
    /// arrived since the last one.
    fn take(&mut self) -> Option<(u32, u32, u32)> {
        let start = self.start?;
        if self.received == 0 {
            return None;
        }
        let window = (start, self.end, self.received);
        self.start = Some(self.end.wrapping_add(1));
        self.received = 0;
        Some(window)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamTrack {
    frames: IndexUnwrapper,
    packets: IndexUnwrapper,
    loss: LossTracker,
}

#[derive(Debug, Clone, Copy)]
struct StreamTimers {
    since: Instant,
    heartbeat: Instant,
    timestamp: Instant,
    congestion: Instant,
    quality: Instant,
}

/// Coalesce frame indices into inclusive `(start, end)` runs.
pub fn corrupt_ranges(frames: &[u32]) -> Vec<(u32, u32)> {
    let mut sorted = frames.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for frame in sorted {
        match ranges.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(frame) => *end = frame,
            _ => ranges.push((frame, frame)),
        }
    }
    ranges
}

// ─── Session ────────────────────────────────────────────────────────────────

/// The client side of one Takion session.
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    keys: EcdhKeypair,
    /// Session id from the control connection, echoed in BIG.
    session_key: String,
    launch_mask: Option<Vec<u8>>,
    crypto: Option<CryptoContext>,
    local_tag: u32,
    remote_tag: u32,
    next_tsn: u32,
    init_step: InitStep,
    cookie: Bytes,
    big: Option<TakionMessage>,
    phase: Option<Phase>,
    negotiation: Negotiation,
    probe: Option<Probe>,
    next_probe_id: u32,
    mtu: u32,
    monitor: CongestionMonitor,
    video: StreamTrack,
    audio: StreamTrack,
    timers: Option<StreamTimers>,
    last_recv: Instant,
    events: VecDeque<SessionEvent>,
    stats: SessionStats,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("local_tag", &self.local_tag)
            .field("remote_tag", &self.remote_tag)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in `Disconnected`.
    ///
    /// `session_key` is the id the control connection handed out; `keys`
    /// carries the handshake key that ends up in the launch spec.
    pub fn new(config: SessionConfig, keys: EcdhKeypair, session_key: impl Into<String>) -> Self {
        let monitor = CongestionMonitor::new(
            config.congestion.clone(),
            config.stream.min_bitrate,
            config.stream.bitrate,
        );
        Session {
            mtu: config.stream.mtu,
            config,
            state: SessionState::Disconnected,
            keys,
            session_key: session_key.into(),
            launch_mask: None,
            crypto: None,
            local_tag: 0,
            remote_tag: 0,
            next_tsn: 0,
            init_step: InitStep::AwaitInitAck,
            cookie: Bytes::new(),
            big: None,
            phase: None,
            negotiation: Negotiation::default(),
            probe: None,
            next_probe_id: 1,
            monitor,
            video: StreamTrack::default(),
            audio: StreamTrack::default(),
            timers: None,
            last_recv: Instant::now(),
            events: VecDeque::new(),
            stats: SessionStats::new(),
        }
    }

    /// XOR mask for the launch spec, supplied by the control connection.
    pub fn with_launch_mask(mut self, mask: Vec<u8>) -> Self {
        self.launch_mask = Some(mask);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn congestion(&self) -> &CongestionMonitor {
        &self.monitor
    }

    /// Negotiated MTU (the configured one until Senkusha settles it).
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Next queued event.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// Earliest instant at which [`Session::poll_timers`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if let Some(phase) = &self.phase {
            return Some(phase.deadline);
        }
        let timers = self.timers.as_ref()?;
        [
            timers.heartbeat,
            timers.timestamp,
            timers.congestion,
            timers.quality,
            self.last_recv + self.config.timers.inactivity,
        ]
        .into_iter()
        .min()
    }

    // ─── Caller operations ──────────────────────────────────────────────

    /// Start the handshake: build BIG, then open the association with INIT.
    pub fn connect(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }
        self.big = Some(self.build_big()?);

        let mut rng = rand::rng();
        self.local_tag = rng.random::<u32>().max(1);
        self.next_tsn = rng.random::<u32>();
        self.remote_tag = 0;
        self.init_step = InitStep::AwaitInitAck;
        self.negotiation = Negotiation::default();
        self.probe = None;
        self.timers = None;
        self.mtu = self.config.stream.mtu;
        self.video = StreamTrack::default();
        self.audio = StreamTrack::default();
        self.last_recv = now;

        self.set_state(SessionState::Init);
        let handshake = &self.config.handshake;
        self.phase = Some(Phase::start("INIT", handshake.attempts, handshake.timeout, now));
        self.send_current_request(now);
        Ok(())
    }

    /// Local disconnect: send DISCONNECT and tear down.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.finish(DisconnectReason::Local);
    }

    /// Send a control message on behalf of the consumer.
    pub fn send_control(&mut self, message: TakionMessage) -> Result<(), SessionError> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::InvalidState {
                operation: "send_control",
                state: self.state,
            });
        }
        self.send_message(CONTROL_CHANNEL, &message);
        Ok(())
    }

    /// Report block groups the reassembly buffer gave up on. Lost video
    /// frames go out as CORRUPTFRAME, consecutive frames in one message.
    pub fn report_retired(&mut self, groups: &[RetiredGroup]) {
        if self.state != SessionState::Streaming {
            return;
        }
        let frames: Vec<u32> = groups
            .iter()
            .filter(|g| g.stream == StreamKind::Video)
            .map(|g| g.frame_index)
            .collect();
        for (start, end) in corrupt_ranges(&frames) {
            debug!(start, end, "reporting corrupt frames");
            let message = TakionMessage::CorruptFrame(CorruptFramePayload { start, end });
            self.send_message(CONTROL_CHANNEL, &message);
        }
    }

    /// Run handshake retries, periodic reports and the inactivity check.
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(phase) = &self.phase {
            if now >= phase.deadline {
                debug!(phase = phase.name, attempt = phase.attempts, "handshake step timed out");
                self.fail_attempt(now);
            }
            return;
        }
        if self.state != SessionState::Streaming {
            return;
        }
        let inactivity = self.config.timers.inactivity;
        if now.saturating_duration_since(self.last_recv) >= inactivity {
            warn!(?inactivity, "console went silent");
            self.finish(DisconnectReason::PeerTimeout(inactivity));
            return;
        }
        let Some(mut timers) = self.timers else {
            return;
        };
        let intervals = self.config.timers.clone();

        if now >= timers.heartbeat {
            timers.heartbeat = now + intervals.heartbeat;
            self.send_message(CONTROL_CHANNEL, &TakionMessage::Heartbeat);
        }
        if now >= timers.timestamp {
            timers.timestamp = now + intervals.timestamp;
            let elapsed = now.saturating_duration_since(timers.since).as_millis() as u64;
            let message =
                TakionMessage::PeriodicTimestamp(PeriodicTimestampPayload { timestamp: elapsed });
            self.send_message(CONTROL_CHANNEL, &message);
        }
        if now >= timers.congestion {
            timers.congestion = now + intervals.congestion;
            self.report_loss();
        }
        if now >= timers.quality {
            timers.quality = now + intervals.quality;
            self.report_quality();
        }
        if self.state == SessionState::Streaming {
            self.timers = Some(timers);
        }
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Process one datagram from the console.
    pub fn handle_datagram(&mut self, now: Instant, datagram: Bytes) {
        if matches!(
            self.state,
            SessionState::Disconnected | SessionState::Disconnecting
        ) {
            trace!(len = datagram.len(), "datagram ignored, no session");
            return;
        }
        self.stats.datagrams_in += 1;
        self.stats.bytes_in += datagram.len() as u64;

        let header_type = match datagram.first().map(|b| HeaderType::from_first_byte(*b)) {
            Some(Ok(header_type)) => header_type,
            Some(Err(err)) => {
                self.protocol_error(now, &err);
                return;
            }
            None => return,
        };
        match header_type {
            HeaderType::Control => self.handle_control(now, datagram),
            HeaderType::Video | HeaderType::Audio => self.handle_av(now, datagram),
            HeaderType::Congestion => {
                trace!("congestion datagram from console ignored");
            }
        }
    }

    fn handle_control(&mut self, now: Instant, datagram: Bytes) {
        let datagram = match self.crypto.as_mut() {
            Some(crypto) => match crypto.open(&datagram, None) {
                Ok(plain) => plain,
                Err(err) => {
                    self.crypto_error(now, err);
                    return;
                }
            },
            None => datagram,
        };
        let packet = match ControlPacket::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                self.protocol_error(now, &err);
                return;
            }
        };
        if packet.tag != self.local_tag {
            debug!(
                tag = packet.tag,
                expected = self.local_tag,
                "control datagram for another association"
            );
            self.stats.protocol_errors += 1;
            return;
        }
        self.last_recv = now;

        match packet.chunk {
            Chunk::InitAck { params, cookie }
                if self.state == SessionState::Init
                    && self.init_step == InitStep::AwaitInitAck =>
            {
                debug!(remote_tag = params.tag, "INIT_ACK received");
                self.remote_tag = params.tag;
                self.cookie = cookie;
                self.init_step = InitStep::AwaitCookieAck;
                let handshake = &self.config.handshake;
                self.phase = Some(Phase::start(
                    "COOKIE",
                    handshake.attempts,
                    handshake.timeout,
                    now,
                ));
                self.send_current_request(now);
            }
            Chunk::CookieAck(_)
                if self.state == SessionState::Init
                    && self.init_step == InitStep::AwaitCookieAck =>
            {
                debug!("association established");
                self.set_state(SessionState::AwaitBang);
                let handshake = &self.config.handshake;
                self.phase = Some(Phase::start("BIG", handshake.attempts, handshake.timeout, now));
                self.send_current_request(now);
            }
            Chunk::DataAck { tsn, .. } => {
                trace!(tsn, "DATA_ACK");
            }
            Chunk::Data { tsn, channel, data } => {
                self.stats.messages_in += 1;
                match TakionMessage::decode(data) {
                    Ok(message) => {
                        trace!(tsn, channel, kind = %message.message_type().name(), "DATA");
                        self.dispatch(now, message);
                    }
                    Err(err) => self.protocol_error(now, &err),
                }
                if self.state.is_keyed() || self.state == SessionState::AwaitBang {
                    self.send_chunk(0, Chunk::data_ack(tsn));
                }
            }
            other => {
                debug!(chunk = ?other.chunk_type(), state = ?self.state, "unexpected chunk");
                self.protocol_error(now, &"unexpected chunk");
            }
        }
    }

    fn handle_av(&mut self, now: Instant, datagram: Bytes) {
        if !self.state.is_keyed() {
            trace!(state = ?self.state, "AV datagram before the session key");
            self.stats.protocol_errors += 1;
            return;
        }
        let header = match AvPacket::decode(datagram.clone()) {
            Ok(packet) => packet.header,
            Err(err) => {
                self.protocol_error(now, &err);
                return;
            }
        };
        let offset = header.payload_offset();
        let plain = match self.crypto.as_mut() {
            Some(crypto) => match crypto.open(&datagram, Some(offset)) {
                Ok(plain) => plain,
                Err(err) => {
                    self.crypto_error(now, err);
                    return;
                }
            },
            None => return,
        };
        self.last_recv = now;

        let payload = plain.slice(offset.min(plain.len())..);
        let track = match header.stream {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        };
        let (Some(frame_index), Some(packet)) = (
            track.frames.unwrap(header.frame_index),
            track.packets.unwrap(header.packet_index),
        ) else {
            trace!(
                stream = ?header.stream,
                frame_index = header.frame_index,
                "AV datagram predates the stream"
            );
            return;
        };
        track.loss.record(packet);
        self.monitor.record_payload(now, payload.len());

        let shard = match header.stream {
            StreamKind::Video => StreamShard {
                stream: StreamKind::Video,
                frame_index,
                block_group: header.block_group,
                shard_index: header.unit_index,
                k: header.units_src,
                m: header.units_fec,
                packet_index: header.packet_index,
                data: payload,
            },
            // Each audio data unit is a frame of its own, cut to the unit size.
            StreamKind::Audio if header.is_data() => {
                let size = match header.audio_unit_size as usize {
                    0 => payload.len(),
                    size => size.min(payload.len()),
                };
                StreamShard {
                    stream: StreamKind::Audio,
                    frame_index,
                    block_group: header.unit_index,
                    shard_index: 0,
                    k: 1,
                    m: 0,
                    packet_index: header.packet_index,
                    data: payload.slice(..size),
                }
            }
            StreamKind::Audio => return,
        };
        self.events.push_back(SessionEvent::Shard(shard));
    }

    fn dispatch(&mut self, now: Instant, message: TakionMessage) {
        match message {
            TakionMessage::Disconnect(payload) => {
                info!(reason = %payload.reason, "console disconnected");
                self.finish(DisconnectReason::Remote {
                    reason: payload.reason,
                    code: payload.event_code.map(|c| c.code),
                });
                return;
            }
            TakionMessage::Heartbeat if self.state.is_keyed() => {
                self.send_message(CONTROL_CHANNEL, &TakionMessage::Heartbeat);
                return;
            }
            _ => {}
        }

        match (self.state, message) {
            (SessionState::AwaitBang, TakionMessage::Bang(bang)) => self.handle_bang(now, bang),
            (SessionState::Negotiating, TakionMessage::StreamInfo(info)) => {
                self.acknowledge_stream_info(info);
                self.negotiation.stream_info = true;
                self.check_negotiated(now);
            }
            (SessionState::Negotiating, TakionMessage::Info(info)) => {
                self.monitor.set_bounds(info.min_bitrate, info.bitrate);
                self.negotiation.peer_info = true;
                self.check_negotiated(now);
            }
            (SessionState::BandwidthTest, TakionMessage::Senkusha(reply)) => {
                self.handle_probe_reply(now, reply)
            }
            (SessionState::Streaming, TakionMessage::StreamInfo(info)) => {
                self.acknowledge_stream_info(info)
            }
            (SessionState::Streaming, TakionMessage::Info(info)) => {
                self.monitor.set_bounds(info.min_bitrate, info.bitrate);
            }
            (SessionState::Streaming, TakionMessage::Senkusha(reply)) => {
                trace!(command = ?reply.command(), "late Senkusha reply");
            }
            (
                SessionState::Streaming,
                message @ (TakionMessage::Big(_) | TakionMessage::Bang(_)),
            ) => {
                let err = CodecError::UnexpectedType {
                    actual: message.message_type(),
                    context: "streaming",
                };
                self.protocol_error(now, &err);
            }
            (SessionState::Streaming, message) => {
                self.events.push_back(SessionEvent::Control(message));
            }
            (state, message) => {
                let err = CodecError::UnexpectedType {
                    actual: message.message_type(),
                    context: state_context(state),
                };
                self.protocol_error(now, &err);
            }
        }
    }

    fn handle_bang(&mut self, now: Instant, bang: BangPayload) {
        if !bang.version_accepted || !bang.encrypted_key_accepted {
            warn!(
                version_accepted = bang.version_accepted,
                key_accepted = bang.encrypted_key_accepted,
                server_version = bang.server_version,
                "console refused BIG"
            );
            let what = if bang.version_accepted { "encrypted key" } else { "client version" };
            self.finish(DisconnectReason::HandshakeRejected(format!("console refused the {what}")));
            return;
        }
        let (Some(pub_key), Some(sig)) = (bang.ecdh_pub_key, bang.ecdh_sig) else {
            self.finish(DisconnectReason::HandshakeRejected("BANG carries no ECDH key".into()));
            return;
        };
        let crypto = derive_session(&self.keys, &pub_key, &sig).and_then(|key| {
            CryptoContext::new(&key, Role::Client, self.config.replay_window)
        });
        match crypto {
            Ok(crypto) => {
                info!(server_version = bang.server_version, "session key established");
                self.crypto = Some(crypto);
                self.set_state(SessionState::Negotiating);
                let handshake = &self.config.handshake;
                self.phase = Some(Phase::start("INFO", handshake.attempts, handshake.timeout, now));
                self.send_current_request(now);
            }
            Err(err) => {
                warn!(%err, "BANG key rejected");
                self.finish(DisconnectReason::HandshakeRejected(err.to_string()));
            }
        }
    }

    fn acknowledge_stream_info(&mut self, info: StreamInfoPayload) {
        debug!(resolutions = info.resolution.len(), "STREAMINFO received");
        self.send_message(STREAM_INFO_ACK_CHANNEL, &TakionMessage::StreamInfoAck);
        self.events
            .push_back(SessionEvent::Control(TakionMessage::StreamInfo(info)));
    }

    fn check_negotiated(&mut self, now: Instant) {
        if !(self.negotiation.stream_info && self.negotiation.peer_info) {
            return;
        }
        debug!(
            min_bitrate = self.monitor.min_bitrate(),
            max_bitrate = self.monitor.max_bitrate(),
            "negotiation complete"
        );
        self.set_state(SessionState::BandwidthTest);
        self.start_probe(now, ProbeStep::Echo);
    }

    // ─── Senkusha ───────────────────────────────────────────────────────

    fn start_probe(&mut self, now: Instant, step: ProbeStep) {
        let id = self.next_probe_id;
        self.next_probe_id = self.next_probe_id.wrapping_add(1);
        self.probe = Some(Probe {
            step,
            id,
            sent_at: now,
        });
        let handshake = &self.config.handshake;
        self.phase = Some(Phase::start(
            step.name(),
            handshake.senkusha_attempts,
            handshake.senkusha_timeout,
            now,
        ));
        self.send_current_request(now);
    }

    fn probe_request(&self, probe: &Probe) -> SenkushaPayload {
        match probe.step {
            ProbeStep::Echo => SenkushaPayload::Echo(SenkushaEcho { state: true }),
            ProbeStep::Mtu => SenkushaPayload::Mtu(SenkushaMtu {
                id: probe.id,
                mtu_req: self.mtu,
                num: 1,
                ..Default::default()
            }),
            ProbeStep::Bandwidth => SenkushaPayload::Bandwidth(SenkushaBandwidth {
                id: probe.id,
                ..Default::default()
            }),
            ProbeStep::ClientMtu => SenkushaPayload::ClientMtu(SenkushaClientMtu {
                id: probe.id,
                mtu_req: self.mtu,
                state: true,
                mtu_down: Some(self.mtu),
            }),
        }
    }

    fn handle_probe_reply(&mut self, now: Instant, reply: SenkushaPayload) {
        let Some(probe) = self.probe else {
            return;
        };
        let expected = self.probe_request(&probe);
        if reply.command() != expected.command() || reply.id() != expected.id() {
            debug!(
                got = ?reply.command(),
                id = ?reply.id(),
                want = ?expected.command(),
                "Senkusha reply does not match the pending probe"
            );
            self.protocol_error(now, &"mismatched Senkusha reply");
            return;
        }
        let rtt = now.saturating_duration_since(probe.sent_at);
        self.monitor.record_rtt(rtt);
        debug!(step = probe.step.name(), rtt_us = rtt.as_micros() as u64, "probe answered");

        match reply {
            SenkushaPayload::Mtu(mtu) => {
                let measured = mtu.mtu_sent.unwrap_or(mtu.mtu_req);
                if measured > 0 {
                    self.mtu = measured.min(self.config.stream.mtu);
                }
                debug!(mtu = self.mtu, "MTU settled");
            }
            SenkushaPayload::Bandwidth(bw) => {
                if let Some(kbps) = bw.bandwidth.filter(|&kbps| kbps > 0) {
                    self.monitor.set_effective_bandwidth(kbps);
                    debug!(kbps, target = self.monitor.target_bitrate(), "bandwidth measured");
                }
            }
            SenkushaPayload::Echo(_) | SenkushaPayload::ClientMtu(_) => {}
        }

        match probe.step.next() {
            Some(step) => self.start_probe(now, step),
            None => self.enter_streaming(now),
        }
    }

    fn enter_streaming(&mut self, now: Instant) {
        self.phase = None;
        self.probe = None;
        let intervals = &self.config.timers;
        self.timers = Some(StreamTimers {
            since: now,
            heartbeat: now + intervals.heartbeat,
            timestamp: now + intervals.timestamp,
            congestion: now + intervals.congestion,
            quality: now + intervals.quality,
        });
        self.last_recv = now;
        self.set_state(SessionState::Streaming);
        info!(
            mtu = self.mtu,
            target_bitrate = self.monitor.target_bitrate(),
            "streaming"
        );
    }

    // ─── Periodic reports ───────────────────────────────────────────────

    fn report_loss(&mut self) {
        let mut received_total = 0u32;
        let mut lost_total = 0u32;
        for stream in [StreamKind::Video, StreamKind::Audio] {
            let track = match stream {
                StreamKind::Video => &mut self.video,
                StreamKind::Audio => &mut self.audio,
            };
            let Some((start, end, received)) = track.loss.take() else {
                continue;
            };
            self.monitor.record_loss(stream, start, end, received);
            let expected = end.wrapping_sub(start).wrapping_add(1);
            let lost = expected.saturating_sub(received);
            received_total = received_total.saturating_add(received);
            lost_total = lost_total.saturating_add(lost);
            if lost > 0 {
                debug!(?stream, start, end, received, lost, "packet loss");
                let message = TakionMessage::PacketLoss(PacketLossPayload {
                    start,
                    end,
                    packets_received: received,
                });
                self.send_message(CONTROL_CHANNEL, &message);
            }
        }
        if lost_total > 0 {
            let packet = CongestionPacket {
                received: received_total.min(u16::MAX as u32) as u16,
                lost: lost_total.min(u16::MAX as u32) as u16,
                gmac: 0,
                key_pos: 0,
            };
            self.send_sealed(packet.encode());
        }
    }

    fn report_quality(&mut self) {
        let report: ConnectionQualityPayload = self.monitor.quality_report();
        self.send_message(CONTROL_CHANNEL, &TakionMessage::ConnectionQuality(report));
        self.events
            .push_back(SessionEvent::ConnectionQuality(self.monitor.stats()));
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    fn build_big(&self) -> Result<TakionMessage, SessionError> {
        let stream = &self.config.stream;
        let params = LaunchParams {
            resolution: stream.resolution,
            max_fps: stream.max_fps,
            bitrate: stream.bitrate,
            mtu: stream.mtu,
            rtt_ms: stream.rtt_ms,
            handshake_key: *self.keys.handshake_key(),
        };
        let launch_spec = params.encode(self.launch_mask.as_deref())?;
        Ok(TakionMessage::Big(BigPayload {
            client_version: stream.client_version,
            session_key: self.session_key.clone(),
            launch_spec,
            encrypted_key: Bytes::from_static(&[0; 4]),
            ecdh_pub_key: Some(Bytes::copy_from_slice(&self.keys.public_key())),
            ecdh_sig: Some(Bytes::copy_from_slice(&self.keys.public_sig()?)),
        }))
    }

    fn client_info(&self) -> InfoPayload {
        let stream = &self.config.stream;
        InfoPayload {
            effective_bw: stream.bitrate,
            bitrate: stream.bitrate,
            min_bitrate: stream.min_bitrate,
            target_bitrate: self.monitor.target_bitrate(),
            corrupt_frame_freq: 0,
            mtu: self.mtu,
            fps: stream.max_fps,
            monitor_interval: self.config.timers.congestion.as_millis() as u32,
            ext_overhead: 0,
            int_overhead: 0,
            timeout_interval: self.config.timers.inactivity.as_millis() as u32,
            min_resume_quality: 0,
            min_fps: FPS_30.min(stream.max_fps),
        }
    }

    /// (Re)send the request of the current handshake step.
    fn send_current_request(&mut self, now: Instant) {
        match self.state {
            SessionState::Init => match self.init_step {
                InitStep::AwaitInitAck => {
                    let chunk = Chunk::Init(InitParams::new(self.local_tag, self.next_tsn));
                    self.send_chunk(0, chunk);
                }
                InitStep::AwaitCookieAck => {
                    let chunk = Chunk::Cookie(self.cookie.clone());
                    self.send_chunk(0, chunk);
                }
            },
            SessionState::AwaitBang => {
                if let Some(big) = self.big.clone() {
                    self.send_message(CONTROL_CHANNEL, &big);
                }
            }
            SessionState::Negotiating => {
                let info = TakionMessage::Info(self.client_info());
                self.send_message(CONTROL_CHANNEL, &info);
            }
            SessionState::BandwidthTest => {
                if let Some(probe) = self.probe.as_mut() {
                    probe.sent_at = now;
                    let probe = *probe;
                    let request = TakionMessage::Senkusha(self.probe_request(&probe));
                    self.send_message(CONTROL_CHANNEL, &request);
                }
            }
            _ => {}
        }
    }

    fn send_message(&mut self, channel: u16, message: &TakionMessage) {
        let tsn = self.next_tsn;
        self.next_tsn = self.next_tsn.wrapping_add(1);
        trace!(tsn, channel, kind = %message.message_type().name(), "send");
        let chunk = Chunk::Data {
            tsn,
            channel,
            data: message.encode(),
        };
        self.stats.messages_out += 1;
        self.send_chunk(DATA_FLAGS, chunk);
    }

    fn send_chunk(&mut self, flags: u8, chunk: Chunk) {
        let datagram = ControlPacket::new(self.remote_tag, flags, chunk).encode();
        self.send_sealed(datagram);
    }

    /// Authenticate (once keyed) and queue a datagram.
    fn send_sealed(&mut self, mut datagram: BytesMut) {
        if let Some(crypto) = self.crypto.as_mut() {
            if let Err(err) = crypto.seal(&mut datagram, None) {
                warn!(%err, "could not seal outbound datagram");
                return;
            }
        }
        self.stats.datagrams_out += 1;
        self.stats.bytes_out += datagram.len() as u64;
        self.events
            .push_back(SessionEvent::Transmit(datagram.freeze()));
    }

    // ─── Failure paths ──────────────────────────────────────────────────

    fn protocol_error(&mut self, now: Instant, err: &dyn std::fmt::Display) {
        self.stats.protocol_errors += 1;
        debug!(state = ?self.state, %err, "protocol error, datagram dropped");
        if self.phase.is_some() {
            self.fail_attempt(now);
        }
    }

    fn crypto_error(&mut self, now: Instant, err: CryptoError) {
        match err {
            CryptoError::Replayed { key_pos } => {
                self.stats.replays_dropped += 1;
                debug!(key_pos, "replayed datagram dropped");
            }
            CryptoError::AuthenticationFailed { key_pos } => {
                self.stats.auth_failures += 1;
                warn!(key_pos, "datagram failed authentication");
                self.finish(DisconnectReason::AuthenticationFailed { key_pos });
            }
            CryptoError::Packet(err) => self.protocol_error(now, &err),
            other => {
                warn!(err = %other, "crypto failure");
                self.finish(DisconnectReason::HandshakeRejected(other.to_string()));
            }
        }
    }

    /// Charge one attempt to the current phase and resend its request.
    fn fail_attempt(&mut self, now: Instant) {
        let Some(phase) = self.phase.as_mut() else {
            return;
        };
        if phase.exhausted() {
            let (name, attempts) = (phase.name, phase.attempts);
            warn!(phase = name, attempts, "handshake step out of attempts");
            self.finish(DisconnectReason::HandshakeTimeout {
                phase: name,
                attempts,
            });
            return;
        }
        phase.retry(now);
        debug!(phase = phase.name, attempt = phase.attempts, "retrying handshake step");
        self.stats.handshake_retries += 1;
        self.send_current_request(now);
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!(from = ?from, to = ?to, "session state");
        self.state = to;
        self.events.push_back(SessionEvent::StateChanged { from, to });
    }

    /// Terminal transition. Only a local disconnect sends anything.
    fn finish(&mut self, reason: DisconnectReason) {
        self.phase = None;
        self.probe = None;
        self.timers = None;
        match reason {
            DisconnectReason::Local => {
                self.set_state(SessionState::Disconnecting);
                if self.remote_tag != 0 {
                    let message =
                        TakionMessage::Disconnect(DisconnectPayload::new(CLIENT_DISCONNECT_REASON));
                    self.send_message(CONTROL_CHANNEL, &message);
                }
            }
            DisconnectReason::Remote { .. } => self.set_state(SessionState::Disconnecting),
            _ => {}
        }
        self.crypto = None;
        self.big = None;
        self.set_state(SessionState::Disconnected);
        if reason.is_error() {
            warn!(code = reason.code(), %reason, "session ended");
        } else {
            info!(code = reason.code(), %reason, "session ended");
        }
        self.events.push_back(SessionEvent::Disconnected(reason));
    }
}

fn state_context(state: SessionState) -> &'static str {
    match state {
        SessionState::Disconnected => "disconnected",
        SessionState::Init => "opening the association",
        SessionState::AwaitBang => "waiting for BANG",
        SessionState::Negotiating => "negotiating",
        SessionState::BandwidthTest => "probing bandwidth",
        SessionState::Streaming => "streaming",
        SessionState::Disconnecting => "disconnecting",
    }
}
