//! # Integration tests: Session ↔ console peer through the wire format
//!
//! These tests drive the whole client stack against a scripted console:
//! handshake → key agreement → negotiation → Senkusha → streaming → teardown.
//!
//! The console is a small in-test peer built from the crate's own codec and
//! crypto. Most tests pass `Bytes` straight between the two; the last one
//! runs the threaded runtime over loopback UDP.

use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use quanta::Instant;
use takion_transport::codec::{FecEncoder, FecError};
use takion_transport::config::{HandshakeConfig, SessionConfig};
use takion_transport::crypto::{derive_session, CryptoContext, EcdhKeypair, Role};
use takion_transport::message::*;
use takion_transport::packet::{
    AvHeader, AvPacket, Chunk, CongestionPacket, ControlPacket, Datagram, InitParams, StreamKind,
};
use takion_transport::reassembly::{Frame, ReassemblyBuffer, RetireReason, RetiredGroup};
use takion_transport::runtime::{StreamConsumer, TakionRuntime};
use takion_transport::session::{
    DisconnectReason, Session, SessionEvent, SessionState, CLIENT_DISCONNECT_REASON,
    CONTROL_CHANNEL, STREAM_INFO_ACK_CHANNEL,
};

const SHARD: usize = 256;
const CONSOLE_MTU_SENT: u32 = 1400;
const CONSOLE_BANDWIDTH: u32 = 12_000;

// ─── Console peer ───────────────────────────────────────────────────────────

/// Scripted console: answers every handshake step and protects its datagrams
/// once the session key exists.
struct Console {
    keys: EcdhKeypair,
    crypto: Option<CryptoContext>,
    tag: u32,
    client_tag: u32,
    tsn: u32,
    packet_index: u16,
    /// Answer BIG with an accepting BANG.
    accept_big: bool,
    /// Answer Senkusha probes.
    answer_probes: bool,
    big: Option<BigPayload>,
    /// Every message the client sent, with its channel.
    messages: Vec<(u16, TakionMessage)>,
    congestion: Vec<CongestionPacket>,
    datagrams: usize,
    unreadable: usize,
    /// Datagram count at the moment BANG went out.
    bang_sent_at: Option<usize>,
    negotiated: bool,
    streaming: bool,
}

impl Console {
    fn new(handshake_key: [u8; 16]) -> Self {
        Console {
            keys: EcdhKeypair::with_handshake_key(handshake_key),
            crypto: None,
            tag: 0x0C0F_FEE0,
            client_tag: 0,
            tsn: 5000,
            packet_index: 0,
            accept_big: true,
            answer_probes: true,
            big: None,
            messages: Vec::new(),
            congestion: Vec::new(),
            datagrams: 0,
            unreadable: 0,
            bang_sent_at: None,
            negotiated: false,
            streaming: false,
        }
    }

    /// Handle one client datagram and return the replies.
    fn respond(&mut self, datagram: &Bytes) -> Vec<Bytes> {
        self.datagrams += 1;
        let plain = match self.crypto.as_mut() {
            Some(crypto) => match crypto.open(datagram, None) {
                Ok(plain) => plain,
                Err(_) => {
                    // A handshake retry sent before the client saw BANG.
                    self.unreadable += 1;
                    return Vec::new();
                }
            },
            None => datagram.clone(),
        };
        match Datagram::decode(plain).unwrap() {
            Datagram::Congestion(packet) => {
                self.congestion.push(packet);
                Vec::new()
            }
            Datagram::Control(packet) => self.on_chunk(packet.chunk),
            Datagram::Av(_) => panic!("client never sends AV"),
        }
    }

    fn on_chunk(&mut self, chunk: Chunk) -> Vec<Bytes> {
        match chunk {
            Chunk::Init(params) => {
                self.client_tag = params.tag;
                vec![self.control(Chunk::InitAck {
                    params: InitParams::new(self.tag, self.tsn),
                    cookie: Bytes::from_static(b"takion-cookie"),
                })]
            }
            Chunk::Cookie(cookie) => {
                assert_eq!(&cookie[..], b"takion-cookie");
                vec![self.control(Chunk::CookieAck(Bytes::new()))]
            }
            Chunk::Data { channel, data, .. } => {
                let message = TakionMessage::decode(data).unwrap();
                self.messages.push((channel, message.clone()));
                self.on_message(message)
            }
            _ => Vec::new(),
        }
    }

    fn on_message(&mut self, message: TakionMessage) -> Vec<Bytes> {
        match message {
            TakionMessage::Big(big) if self.crypto.is_none() && self.bang_sent_at.is_none() => {
                self.bang_sent_at = Some(self.datagrams);
                if !self.accept_big {
                    let bang = BangPayload {
                        server_version: 9,
                        version_accepted: false,
                        encrypted_key_accepted: true,
                        ..Default::default()
                    };
                    return vec![self.message(TakionMessage::Bang(bang))];
                }
                let key = derive_session(
                    &self.keys,
                    big.ecdh_pub_key.as_deref().unwrap(),
                    big.ecdh_sig.as_deref().unwrap(),
                )
                .unwrap();
                let bang = BangPayload {
                    server_version: 9,
                    token: 0,
                    encrypted_key_accepted: true,
                    version_accepted: true,
                    session_key: big.session_key.clone(),
                    ecdh_pub_key: Some(Bytes::copy_from_slice(&self.keys.public_key())),
                    ecdh_sig: Some(Bytes::copy_from_slice(&self.keys.public_sig().unwrap())),
                };
                self.big = Some(big);
                // BANG itself travels in the clear.
                let reply = self.message(TakionMessage::Bang(bang));
                self.crypto = Some(CryptoContext::new(&key, Role::Console, 4096).unwrap());
                vec![reply]
            }
            TakionMessage::Info(_) if !self.negotiated => {
                self.negotiated = true;
                vec![
                    self.message(TakionMessage::StreamInfo(stream_info())),
                    self.message(TakionMessage::Info(console_info())),
                ]
            }
            TakionMessage::Senkusha(request) if self.answer_probes => {
                let reply = match request {
                    SenkushaPayload::Echo(echo) => SenkushaPayload::Echo(echo),
                    SenkushaPayload::Mtu(mtu) => SenkushaPayload::Mtu(SenkushaMtu {
                        mtu_sent: Some(CONSOLE_MTU_SENT),
                        ..mtu
                    }),
                    SenkushaPayload::Bandwidth(bw) => SenkushaPayload::Bandwidth(SenkushaBandwidth {
                        time: Some(100),
                        bandwidth: Some(CONSOLE_BANDWIDTH),
                        ..bw
                    }),
                    SenkushaPayload::ClientMtu(client_mtu) => {
                        self.streaming = true;
                        SenkushaPayload::ClientMtu(client_mtu)
                    }
                };
                vec![self.message(TakionMessage::Senkusha(reply))]
            }
            _ => Vec::new(),
        }
    }

    fn control(&mut self, chunk: Chunk) -> Bytes {
        let flags = u8::from(matches!(chunk, Chunk::Data { .. }));
        let mut buf = ControlPacket::new(self.client_tag, flags, chunk).encode();
        if let Some(crypto) = self.crypto.as_mut() {
            crypto.seal(&mut buf, None).unwrap();
        }
        buf.freeze()
    }

    fn message(&mut self, message: TakionMessage) -> Bytes {
        let tsn = self.tsn;
        self.tsn = self.tsn.wrapping_add(1);
        self.control(Chunk::Data {
            tsn,
            channel: CONTROL_CHANNEL,
            data: message.encode(),
        })
    }

    /// Encode and seal a block group of `SHARD`-byte units. Every unit takes
    /// a packet index, dropped ones included.
    fn group(
        &mut self,
        frame_index: u16,
        k: u16,
        m: u16,
        seed: u8,
        drop: &[u16],
    ) -> (Vec<u8>, Vec<Bytes>) {
        let data: Vec<u8> = (0..k as usize * SHARD)
            .map(|i| (i as u8).wrapping_mul(29).wrapping_add(seed))
            .collect();
        let parity = FecEncoder::new()
            .encode(k as usize, m as usize, SHARD, &data)
            .unwrap();
        let units: Vec<&[u8]> = data.chunks(SHARD).chain(parity.chunks(SHARD)).collect();

        let mut datagrams = Vec::new();
        for (unit, payload) in units.into_iter().enumerate() {
            let unit = unit as u16;
            let header = AvHeader {
                stream: StreamKind::Video,
                packet_index: self.packet_index,
                frame_index,
                unit_index: unit,
                units_total: k + m,
                units_fec: m,
                units_src: k,
                audio_unit_size: 0,
                codec: 6,
                gmac: 0,
                key_pos: 0,
                block_group: 0,
                adaptive_stream_index: 0,
                unit_prefix: None,
            };
            self.packet_index = self.packet_index.wrapping_add(1);
            if drop.contains(&unit) {
                continue;
            }
            let mut buf = AvPacket {
                header,
                payload: Bytes::copy_from_slice(payload),
            }
            .encode();
            let crypto = self.crypto.as_mut().unwrap();
            crypto.seal(&mut buf, Some(header.payload_offset())).unwrap();
            datagrams.push(buf.freeze());
        }
        (data, datagrams)
    }

    /// One sealed audio datagram. `units` is `(src, fec)`.
    fn audio(
        &mut self,
        frame_index: u16,
        unit: u16,
        units: (u16, u16),
        size: u8,
        payload: &[u8],
    ) -> Bytes {
        let header = AvHeader {
            stream: StreamKind::Audio,
            packet_index: self.packet_index,
            frame_index,
            unit_index: unit,
            units_total: units.0 + units.1,
            units_fec: units.1,
            units_src: units.0,
            audio_unit_size: size,
            codec: 5,
            gmac: 0,
            key_pos: 0,
            block_group: 0,
            adaptive_stream_index: 0,
            unit_prefix: None,
        };
        self.packet_index = self.packet_index.wrapping_add(1);
        let mut buf = AvPacket {
            header,
            payload: Bytes::copy_from_slice(payload),
        }
        .encode();
        let crypto = self.crypto.as_mut().unwrap();
        crypto.seal(&mut buf, Some(header.payload_offset())).unwrap();
        buf.freeze()
    }

    fn received(&self) -> impl Iterator<Item = &TakionMessage> {
        self.messages.iter().map(|(_, m)| m)
    }
}

fn stream_info() -> StreamInfoPayload {
    StreamInfoPayload {
        resolution: vec![ResolutionDescriptor {
            width: 1280,
            height: 720,
            video_header: Bytes::from_static(&[0, 0, 0, 1, 0x67]),
        }],
        audio_header: Bytes::from_static(&[2, 0, 0, 0, 0x80, 0xBB, 0, 0]),
        start_timeout: Some(100),
        ..Default::default()
    }
}

fn console_info() -> InfoPayload {
    InfoPayload {
        effective_bw: 15_000,
        bitrate: 10_000,
        min_bitrate: 2_000,
        mtu: 1454,
        fps: 60,
        ..Default::default()
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn test_config() -> SessionConfig {
    SessionConfig {
        handshake: HandshakeConfig {
            timeout: Duration::from_millis(200),
            attempts: 3,
            senkusha_timeout: Duration::from_millis(50),
            senkusha_attempts: 2,
        },
        ..SessionConfig::default()
    }
}

fn new_pair() -> (Session, Console) {
    let keys = EcdhKeypair::generate();
    let console = Console::new(*keys.handshake_key());
    (Session::new(test_config(), keys, "session-42"), console)
}

/// Shuttle datagrams until both sides go quiet. Returns every non-transmit
/// event the session raised.
fn pump(session: &mut Session, console: &mut Console, now: Instant) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let batch: Vec<SessionEvent> = session.drain_events().collect();
        if batch.is_empty() {
            return events;
        }
        let mut replies = Vec::new();
        for event in batch {
            match event {
                SessionEvent::Transmit(datagram) => replies.extend(console.respond(&datagram)),
                other => events.push(other),
            }
        }
        for reply in replies {
            session.handle_datagram(now, reply);
        }
    }
}

/// Run the full handshake and return a streaming pair.
fn streaming_pair(now: Instant) -> (Session, Console) {
    let (mut session, mut console) = new_pair();
    session.connect(now).unwrap();
    pump(&mut session, &mut console, now);
    assert_eq!(session.state(), SessionState::Streaming);
    (session, console)
}

fn feed(
    session: &mut Session,
    buffer: &mut ReassemblyBuffer,
    now: Instant,
    datagrams: Vec<Bytes>,
) -> (Vec<Frame>, Vec<RetiredGroup>) {
    for datagram in datagrams {
        session.handle_datagram(now, datagram);
    }
    let mut frames = Vec::new();
    let mut retired = Vec::new();
    for event in session.drain_events() {
        if let SessionEvent::Shard(shard) = event {
            let frame = buffer.accept(shard);
            retired.extend(buffer.drain_retired());
            frames.extend(frame);
        }
    }
    (frames, retired)
}

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn disconnect_reason(events: &[SessionEvent]) -> Option<&DisconnectReason> {
    match events.last() {
        Some(SessionEvent::Disconnected(reason)) => Some(reason),
        _ => None,
    }
}

fn transmits(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Transmit(_)))
        .count()
}

// ─── Handshake ──────────────────────────────────────────────────────────────

#[test]
fn full_handshake_reaches_streaming() {
    let now = Instant::now();
    let (mut session, mut console) = new_pair();
    session.connect(now).unwrap();
    let events = pump(&mut session, &mut console, now);

    assert_eq!(
        states(&events),
        vec![
            SessionState::Init,
            SessionState::AwaitBang,
            SessionState::Negotiating,
            SessionState::BandwidthTest,
            SessionState::Streaming,
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Control(TakionMessage::StreamInfo(info)) if *info == stream_info()
    )));

    // MTU settles on what the console measured, bandwidth on its probe.
    assert_eq!(session.mtu(), CONSOLE_MTU_SENT);
    assert_eq!(session.congestion().effective_bandwidth(), CONSOLE_BANDWIDTH);
    assert_eq!(session.congestion().min_bitrate(), 2_000);
    assert_eq!(session.congestion().max_bitrate(), 10_000);
    assert!(session.congestion().rtt().sample_count() >= 4);
    assert_eq!(session.stats().handshake_retries, 0);
    assert_eq!(console.unreadable, 0);
}

#[test]
fn handshake_messages_arrive_in_protocol_order() {
    let (_, console) = streaming_pair(Instant::now());

    let kinds: Vec<MessageType> = console.received().map(|m| m.message_type()).collect();
    assert_eq!(
        kinds,
        vec![
            MessageType::Big,
            MessageType::Info,
            MessageType::StreamInfoAck,
            MessageType::Senkusha,
            MessageType::Senkusha,
            MessageType::Senkusha,
            MessageType::Senkusha,
        ]
    );

    let probes: Vec<SenkushaCommand> = console
        .received()
        .filter_map(|m| match m {
            TakionMessage::Senkusha(p) => Some(p.command()),
            _ => None,
        })
        .collect();
    assert_eq!(
        probes,
        vec![
            SenkushaCommand::Echo,
            SenkushaCommand::Mtu,
            SenkushaCommand::Bandwidth,
            SenkushaCommand::ClientMtu,
        ]
    );

    let ack_channel = console
        .messages
        .iter()
        .find(|(_, m)| *m == TakionMessage::StreamInfoAck)
        .map(|(channel, _)| *channel);
    assert_eq!(ack_channel, Some(STREAM_INFO_ACK_CHANNEL));
}

#[test]
fn big_carries_launch_spec_with_handshake_key() {
    let keys = EcdhKeypair::generate();
    let handshake_key = *keys.handshake_key();
    let public_key = keys.public_key();
    let mut console = Console::new(handshake_key);
    let mut session = Session::new(test_config(), keys, "session-42");
    session.connect(Instant::now()).unwrap();
    pump(&mut session, &mut console, Instant::now());

    let big = console.big.expect("console saw BIG");
    assert_eq!(big.session_key, "session-42");
    assert_eq!(big.ecdh_pub_key.as_deref(), Some(&public_key[..]));

    let mut doc = STANDARD.decode(&big.launch_spec).unwrap();
    assert_eq!(doc.pop(), Some(0), "launch spec is NUL-terminated");
    let json: serde_json::Value = serde_json::from_slice(&doc).unwrap();
    let embedded = STANDARD
        .decode(json["handshakeKey"].as_str().unwrap())
        .unwrap();
    assert_eq!(embedded, handshake_key);
}

#[test]
fn rejected_bang_ends_session_without_sending() {
    let now = Instant::now();
    let (mut session, mut console) = new_pair();
    console.accept_big = false;
    session.connect(now).unwrap();
    let events = pump(&mut session, &mut console, now);

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(
        disconnect_reason(&events),
        Some(DisconnectReason::HandshakeRejected(_))
    ));
    // Nothing after BANG: no DATA_ACK, no DISCONNECT.
    assert_eq!(console.bang_sent_at, Some(console.datagrams));
}

#[test]
fn unanswered_probe_exhausts_its_attempts() {
    let start = Instant::now();
    let (mut session, mut console) = new_pair();
    console.answer_probes = false;
    session.connect(start).unwrap();
    pump(&mut session, &mut console, start);
    assert_eq!(session.state(), SessionState::BandwidthTest);

    session.poll_timers(start + Duration::from_millis(60));
    pump(&mut session, &mut console, start);
    assert_eq!(session.state(), SessionState::BandwidthTest);
    assert_eq!(session.stats().handshake_retries, 1);

    session.poll_timers(start + Duration::from_millis(120));
    let events = pump(&mut session, &mut console, start);
    assert_eq!(
        disconnect_reason(&events),
        Some(&DisconnectReason::HandshakeTimeout {
            phase: "SENKUSHA ECHO",
            attempts: 2,
        })
    );
    let echoes = console
        .received()
        .filter(|m| matches!(m, TakionMessage::Senkusha(SenkushaPayload::Echo(_))))
        .count();
    assert_eq!(echoes, 2);
}

// ─── Streaming AV ───────────────────────────────────────────────────────────

#[test]
fn single_lost_shard_is_recovered() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);
    let mut buffer = ReassemblyBuffer::default();

    let (data, datagrams) = console.group(0, 10, 2, 0x11, &[3]);
    assert_eq!(datagrams.len(), 11);
    let (frames, retired) = feed(&mut session, &mut buffer, now, datagrams);

    assert!(retired.is_empty());
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame.is_complete());
    assert!(frame.recovered);
    assert_eq!(frame.recovered_shards, vec![3]);
    assert_eq!(&frame.data[..], &data[..]);
    assert_eq!(buffer.stats().frames_recovered, 1);
}

#[test]
fn three_lost_shards_give_a_lossy_frame_and_corrupt_report() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);
    let mut buffer = ReassemblyBuffer::default();

    let (_, broken) = console.group(0, 10, 2, 0x22, &[1, 4, 8]);
    let (next_data, next) = console.group(1, 10, 2, 0x33, &[]);
    let mut datagrams = broken;
    datagrams.extend(next);
    let (frames, retired) = feed(&mut session, &mut buffer, now, datagrams);

    assert_eq!(retired.len(), 1);
    let group = &retired[0];
    assert_eq!(group.frame_index, 0);
    assert_eq!(group.reason, RetireReason::Superseded);
    assert_eq!(group.error, Some(FecError::Unrecoverable { missing: 3, parity: 2 }));
    let lossy = group.frame.as_ref().expect("lossy delivery is on by default");
    assert!(lossy.lossy);
    assert_eq!(lossy.data.len(), 7 * SHARD);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].frame_index, 1);
    assert_eq!(&frames[0].data[..], &next_data[..]);

    session.report_retired(&retired);
    pump(&mut session, &mut console, now);
    let corrupt: Vec<&CorruptFramePayload> = console
        .received()
        .filter_map(|m| match m {
            TakionMessage::CorruptFrame(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(corrupt, vec![&CorruptFramePayload { start: 0, end: 0 }]);
}

#[test]
fn audio_units_are_delivered_per_packet_at_unit_size() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);
    let mut buffer = ReassemblyBuffer::default();

    let payloads: Vec<Vec<u8>> = (0..3u8).map(|n| vec![0xA0 + n; 300]).collect();
    let mut delivered = Vec::new();
    for (unit, payload) in payloads.iter().enumerate() {
        let datagram = console.audio(4, unit as u16, (2, 1), 120, payload);
        let (frames, retired) = feed(&mut session, &mut buffer, now, vec![datagram]);
        assert!(retired.is_empty());
        // Data units resolve on arrival; the parity unit yields nothing.
        assert_eq!(frames.len(), usize::from(unit < 2));
        delivered.extend(frames);
    }

    assert_eq!(delivered.len(), 2);
    for (unit, frame) in delivered.iter().enumerate() {
        assert_eq!(frame.stream, StreamKind::Audio);
        assert_eq!(frame.frame_index, 4);
        assert!(frame.is_complete());
        assert_eq!(&frame.data[..], &payloads[unit][..120]);
    }
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn congestion_timer_reports_packet_loss() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);
    let mut buffer = ReassemblyBuffer::default();

    let (_, first) = console.group(0, 10, 2, 1, &[1, 4, 8]);
    let (_, second) = console.group(1, 10, 2, 2, &[]);
    let mut datagrams = first;
    datagrams.extend(second);
    feed(&mut session, &mut buffer, now, datagrams);

    let later = now + session.config().timers.congestion;
    session.poll_timers(later);
    pump(&mut session, &mut console, later);

    let loss: Vec<&PacketLossPayload> = console
        .received()
        .filter_map(|m| match m {
            TakionMessage::PacketLoss(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(
        loss,
        vec![&PacketLossPayload {
            start: 0,
            end: 23,
            packets_received: 21,
        }]
    );
    assert_eq!(console.congestion.len(), 1);
    assert_eq!(console.congestion[0].received, 21);
    assert_eq!(console.congestion[0].lost, 3);
    assert!(session.congestion().loss_ratio() > 0.0);
}

#[test]
fn tampered_av_datagram_ends_session() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);

    let (_, datagrams) = console.group(0, 4, 1, 9, &[]);
    let mut tampered = datagrams[0].to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    session.handle_datagram(now, Bytes::from(tampered));

    let events: Vec<SessionEvent> = session.drain_events().collect();
    assert!(matches!(
        disconnect_reason(&events),
        Some(DisconnectReason::AuthenticationFailed { .. })
    ));
    assert_eq!(transmits(&events), 0);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.stats().auth_failures, 1);
}

#[test]
fn replayed_datagram_is_dropped() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);

    let (_, datagrams) = console.group(0, 4, 1, 9, &[]);
    session.handle_datagram(now, datagrams[0].clone());
    session.handle_datagram(now, datagrams[0].clone());

    let shards = session
        .drain_events()
        .filter(|e| matches!(e, SessionEvent::Shard(_)))
        .count();
    assert_eq!(shards, 1);
    assert_eq!(session.stats().replays_dropped, 1);
    assert_eq!(session.state(), SessionState::Streaming);
}

// ─── Control while streaming ────────────────────────────────────────────────

#[test]
fn heartbeat_is_answered() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);
    let before = console.messages.len();

    let heartbeat = console.message(TakionMessage::Heartbeat);
    session.handle_datagram(now, heartbeat);
    pump(&mut session, &mut console, now);

    assert_eq!(
        console.messages[before..],
        [(CONTROL_CHANNEL, TakionMessage::Heartbeat)]
    );
}

#[test]
fn pass_through_messages_reach_the_consumer() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);

    let fps = TakionMessage::FpsChange(FpsChangePayload { fps: 30 });
    let datagram = console.message(fps.clone());
    session.handle_datagram(now, datagram);
    let events = pump(&mut session, &mut console, now);
    assert_eq!(events, vec![SessionEvent::Control(fps)]);

    session.send_control(TakionMessage::IdrRequest).unwrap();
    pump(&mut session, &mut console, now);
    assert!(console.received().any(|m| *m == TakionMessage::IdrRequest));
}

#[test]
fn periodic_reports_go_out_while_streaming() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);

    let later = now + Duration::from_secs(2);
    session.poll_timers(later);
    let events = pump(&mut session, &mut console, later);

    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ConnectionQuality(_))));
    let kinds: Vec<MessageType> = console.received().map(|m| m.message_type()).collect();
    assert!(kinds.contains(&MessageType::Heartbeat));
    assert!(kinds.contains(&MessageType::PeriodicTimestamp));
    assert!(kinds.contains(&MessageType::ConnectionQuality));
    let timestamp = console.received().find_map(|m| match m {
        TakionMessage::PeriodicTimestamp(p) => Some(p.timestamp),
        _ => None,
    });
    assert_eq!(timestamp, Some(2000));
}

#[test]
fn silent_console_times_out() {
    let now = Instant::now();
    let (mut session, _console) = streaming_pair(now);

    let inactivity = session.config().timers.inactivity;
    session.poll_timers(now + inactivity);
    let events: Vec<SessionEvent> = session.drain_events().collect();
    assert_eq!(
        disconnect_reason(&events),
        Some(&DisconnectReason::PeerTimeout(inactivity))
    );
}

// ─── Teardown ───────────────────────────────────────────────────────────────

#[test]
fn remote_disconnect_is_reported() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);

    let bye = console.message(TakionMessage::Disconnect(DisconnectPayload::new(
        "Server shutting down",
    )));
    session.handle_datagram(now, bye);
    let events: Vec<SessionEvent> = session.drain_events().collect();

    assert_eq!(transmits(&events), 0);
    assert_eq!(
        states(&events),
        vec![SessionState::Disconnecting, SessionState::Disconnected]
    );
    assert_eq!(
        disconnect_reason(&events),
        Some(&DisconnectReason::Remote {
            reason: "Server shutting down".into(),
            code: None,
        })
    );
}

#[test]
fn local_disconnect_sends_disconnect() {
    let now = Instant::now();
    let (mut session, mut console) = streaming_pair(now);

    session.disconnect();
    let events = pump(&mut session, &mut console, now);

    assert_eq!(disconnect_reason(&events), Some(&DisconnectReason::Local));
    assert_eq!(
        console.received().last(),
        Some(&TakionMessage::Disconnect(DisconnectPayload::new(
            CLIENT_DISCONNECT_REASON
        )))
    );
    assert_eq!(session.state(), SessionState::Disconnected);

    // Datagrams after the end are ignored.
    let late = console.message(TakionMessage::Heartbeat);
    session.handle_datagram(now, late);
    assert!(session.poll_event().is_none());
}

// ─── Runtime over loopback UDP ──────────────────────────────────────────────

enum Observed {
    Frame(Frame),
    Control(TakionMessage),
    Disconnect(DisconnectReason),
}

struct Recorder {
    tx: crossbeam_channel::Sender<Observed>,
}

impl StreamConsumer for Recorder {
    fn on_frame(&mut self, frame: &Frame) {
        let _ = self.tx.send(Observed::Frame(frame.clone()));
    }

    fn on_control(&mut self, message: &TakionMessage) {
        let _ = self.tx.send(Observed::Control(message.clone()));
    }

    fn on_disconnect(&mut self, reason: &DisconnectReason) {
        let _ = self.tx.send(Observed::Disconnect(reason.clone()));
    }
}

#[test]
fn runtime_streams_over_loopback() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("takion_transport=debug")
        .with_test_writer()
        .try_init();

    let console_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let console_addr = console_socket.local_addr().unwrap();
    let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    client_socket.connect(console_addr).unwrap();

    let keys = EcdhKeypair::generate();
    let handshake_key = *keys.handshake_key();
    // Real sockets and threads: keep the default, more forgiving timeouts.
    let session = Session::new(SessionConfig::default(), keys, "loopback");
    let (tx, rx) = crossbeam_channel::unbounded();
    let runtime = TakionRuntime::start(client_socket, session, Recorder { tx }).unwrap();

    let console_thread = thread::spawn(move || {
        console_socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut console = Console::new(handshake_key);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut buf = vec![0u8; 65_536];
        let mut client = None;
        while !console.streaming {
            assert!(std::time::Instant::now() < deadline, "handshake stalled");
            let Ok((n, from)) = console_socket.recv_from(&mut buf) else {
                continue;
            };
            client = Some(from);
            for reply in console.respond(&Bytes::copy_from_slice(&buf[..n])) {
                console_socket.send_to(&reply, from).unwrap();
            }
        }
        let client = client.unwrap();

        let (data, datagrams) = console.group(0, 10, 2, 0x5A, &[3]);
        for datagram in datagrams {
            console_socket.send_to(&datagram, client).unwrap();
        }
        thread::sleep(Duration::from_millis(50));
        let bye = console.message(TakionMessage::Disconnect(DisconnectPayload::new(
            "Server shutting down",
        )));
        console_socket.send_to(&bye, client).unwrap();
        data
    });

    let mut frames = Vec::new();
    let mut saw_stream_info = false;
    let reason = loop {
        match rx.recv_timeout(Duration::from_secs(10)).expect("runtime went quiet") {
            Observed::Frame(frame) => frames.push(frame),
            Observed::Control(TakionMessage::StreamInfo(_)) => saw_stream_info = true,
            Observed::Control(_) => {}
            Observed::Disconnect(reason) => break reason,
        }
    };
    let data = console_thread.join().unwrap();

    assert!(saw_stream_info);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].recovered);
    assert_eq!(&frames[0].data[..], &data[..]);
    assert!(matches!(reason, DisconnectReason::Remote { .. }));

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !runtime.is_finished() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(runtime.is_finished());
    drop(runtime);
    assert!(rx.try_recv().is_err(), "on_disconnect is called once");
}
