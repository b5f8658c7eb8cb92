//! # Takion Messages
//!
//! The tagged control message exchanged on the Takion DATA channel.
//!
//! On the wire a message is a field set (see [`crate::wire`]) holding a
//! `type` discriminant in field 1 and at most one payload field. The payload
//! for discriminant `d` lives in field `d + 2`. In memory the pair is a single
//! enum, [`TakionMessage`], so a message with the wrong payload cannot be
//! constructed at all.
//!
//! ```text
//!   field 1   type (varint)            e.g. 1 = BANG
//!   field 3   bang_payload (length)    present iff type == BANG
//! ```
//!
//! Decoding enforces the same invariant: a missing payload, a payload for a
//! different kind, or a payload on a kind that has none is
//! [`CodecError::MalformedMessage`]; a payload lacking one of its required
//! fields is [`CodecError::MissingField`].

use bytes::{Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::wire::{
    put_bool, put_bytes, put_f32, put_f64, put_message, put_str, put_u32, put_u64, FieldReader,
    WireError,
};

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Message-level protocol error. Never fatal on its own; the session drops the
/// datagram, or counts a failed attempt while handshaking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("{message} payload is missing required field `{field}`")]
    MissingField {
        message: &'static str,
        field: &'static str,
    },
    #[error("unexpected {actual} message while {context}")]
    UnexpectedType {
        actual: MessageType,
        context: &'static str,
    },
}

impl From<WireError> for CodecError {
    fn from(err: WireError) -> Self {
        CodecError::MalformedMessage(err.to_string())
    }
}

fn required<T>(
    value: Option<T>,
    message: &'static str,
    field: &'static str,
) -> Result<T, CodecError> {
    value.ok_or(CodecError::MissingField { message, field })
}

// ─── Message Type ───────────────────────────────────────────────────────────

/// The 33 message discriminants, numbered as the console firmware numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Big = 0,
    Bang = 1,
    Info = 2,
    Disconnect = 3,
    DeepLink = 4,
    Heartbeat = 5,
    CorruptFrame = 6,
    StreamInfo = 7,
    PacketLoss = 8,
    Senkusha = 9,
    StreamInfoAck = 10,
    ControllerConnection = 11,
    ControllerConnectionAck = 12,
    ClientInfo = 13,
    TakionProtocolRequest = 14,
    TakionProtocolRequestAck = 15,
    ServerSettings = 16,
    PeriodicTimestamp = 17,
    PlayTimeLeft = 18,
    IdrRequest = 19,
    FpsChange = 20,
    ConnectionQuality = 21,
    XmbCommand = 22,
    VideoCapture = 23,
    AudioCapture = 24,
    MicConnection = 25,
    MicConnectionAck = 26,
    KeyboardEnableToggle = 27,
    KeyboardOpen = 28,
    KeyboardTextChangeReq = 29,
    KeyboardTextChangeRes = 30,
    KeyboardCloseReq = 31,
    KeyboardCloseRes = 32,
}

impl MessageType {
    pub const ALL: [MessageType; 33] = [
        MessageType::Big,
        MessageType::Bang,
        MessageType::Info,
        MessageType::Disconnect,
        MessageType::DeepLink,
        MessageType::Heartbeat,
        MessageType::CorruptFrame,
        MessageType::StreamInfo,
        MessageType::PacketLoss,
        MessageType::Senkusha,
        MessageType::StreamInfoAck,
        MessageType::ControllerConnection,
        MessageType::ControllerConnectionAck,
        MessageType::ClientInfo,
        MessageType::TakionProtocolRequest,
        MessageType::TakionProtocolRequestAck,
        MessageType::ServerSettings,
        MessageType::PeriodicTimestamp,
        MessageType::PlayTimeLeft,
        MessageType::IdrRequest,
        MessageType::FpsChange,
        MessageType::ConnectionQuality,
        MessageType::XmbCommand,
        MessageType::VideoCapture,
        MessageType::AudioCapture,
        MessageType::MicConnection,
        MessageType::MicConnectionAck,
        MessageType::KeyboardEnableToggle,
        MessageType::KeyboardOpen,
        MessageType::KeyboardTextChangeReq,
        MessageType::KeyboardTextChangeRes,
        MessageType::KeyboardCloseReq,
        MessageType::KeyboardCloseRes,
    ];

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Field number carrying this kind's payload, `None` for bare kinds.
    pub fn payload_field(self) -> Option<u32> {
        match self {
            MessageType::Heartbeat | MessageType::StreamInfoAck | MessageType::IdrRequest => None,
            other => Some(other as u32 + 2),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Big => "BIG",
            MessageType::Bang => "BANG",
            MessageType::Info => "INFO",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::DeepLink => "DEEPLINK",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::CorruptFrame => "CORRUPTFRAME",
            MessageType::StreamInfo => "STREAMINFO",
            MessageType::PacketLoss => "PACKETLOSS",
            MessageType::Senkusha => "SENKUSHA",
            MessageType::StreamInfoAck => "STREAMINFOACK",
            MessageType::ControllerConnection => "CONTROLLERCONNECTION",
            MessageType::ControllerConnectionAck => "CONTROLLERCONNECTIONACK",
            MessageType::ClientInfo => "CLIENTINFO",
            MessageType::TakionProtocolRequest => "TAKIONPROTOCOLREQUEST",
            MessageType::TakionProtocolRequestAck => "TAKIONPROTOCOLREQUESTACK",
            MessageType::ServerSettings => "SERVERSETTINGS",
            MessageType::PeriodicTimestamp => "PERIODICTIMESTAMP",
            MessageType::PlayTimeLeft => "PLAYTIMELEFT",
            MessageType::IdrRequest => "IDRREQUEST",
            MessageType::FpsChange => "FPSCHANGE",
            MessageType::ConnectionQuality => "CONNECTIONQUALITY",
            MessageType::XmbCommand => "XMBCOMMAND",
            MessageType::VideoCapture => "VIDEOCAPTURE",
            MessageType::AudioCapture => "AUDIOCAPTURE",
            MessageType::MicConnection => "MICCONNECTION",
            MessageType::MicConnectionAck => "MICCONNECTIONACK",
            MessageType::KeyboardEnableToggle => "KEYBOARDENABLETOGGLE",
            MessageType::KeyboardOpen => "KEYBOARDOPEN",
            MessageType::KeyboardTextChangeReq => "KEYBOARDTEXTCHANGEREQ",
            MessageType::KeyboardTextChangeRes => "KEYBOARDTEXTCHANGERES",
            MessageType::KeyboardCloseReq => "KEYBOARDCLOSEREQ",
            MessageType::KeyboardCloseRes => "KEYBOARDCLOSERES",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Payload Trait ──────────────────────────────────────────────────────────

/// A payload structure: a field set with its own required/optional rules.
pub trait Payload: Sized {
    /// Name used in `MissingField` errors.
    const NAME: &'static str;

    fn encode_fields(&self, buf: &mut BytesMut);

    fn decode_fields(body: Bytes) -> Result<Self, CodecError>;
}

// ─── Handshake Payloads ─────────────────────────────────────────────────────

/// Client hello. Carries the launch spec and the client's ECDH half.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BigPayload {
    pub client_version: u32,
    pub session_key: String,
    pub launch_spec: String,
    pub encrypted_key: Bytes,
    pub ecdh_pub_key: Option<Bytes>,
    pub ecdh_sig: Option<Bytes>,
}

impl Payload for BigPayload {
    const NAME: &'static str = "BIG";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.client_version);
        put_str(buf, 2, &self.session_key);
        put_str(buf, 3, &self.launch_spec);
        put_bytes(buf, 4, &self.encrypted_key);
        if let Some(key) = &self.ecdh_pub_key {
            put_bytes(buf, 5, key);
        }
        if let Some(sig) = &self.ecdh_sig {
            put_bytes(buf, 6, sig);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut client_version, mut session_key, mut launch_spec, mut encrypted_key) =
            (None, None, None, None);
        let (mut ecdh_pub_key, mut ecdh_sig) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => client_version = Some(value.as_u32(field)?),
                2 => session_key = Some(value.into_string(field)?),
                3 => launch_spec = Some(value.into_string(field)?),
                4 => encrypted_key = Some(value.into_bytes(field)?),
                5 => ecdh_pub_key = Some(value.into_bytes(field)?),
                6 => ecdh_sig = Some(value.into_bytes(field)?),
                _ => {}
            }
        }
        Ok(BigPayload {
            client_version: required(client_version, Self::NAME, "client_version")?,
            session_key: required(session_key, Self::NAME, "session_key")?,
            launch_spec: required(launch_spec, Self::NAME, "launch_spec")?,
            encrypted_key: required(encrypted_key, Self::NAME, "encrypted_key")?,
            ecdh_pub_key,
            ecdh_sig,
        })
    }
}

/// Console reply to BIG.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BangPayload {
    pub server_version: u32,
    pub token: u32,
    pub encrypted_key_accepted: bool,
    pub version_accepted: bool,
    pub session_key: String,
    pub ecdh_pub_key: Option<Bytes>,
    pub ecdh_sig: Option<Bytes>,
}

impl Payload for BangPayload {
    const NAME: &'static str = "BANG";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.server_version);
        put_u32(buf, 2, self.token);
        put_bool(buf, 3, self.encrypted_key_accepted);
        put_bool(buf, 4, self.version_accepted);
        put_str(buf, 5, &self.session_key);
        if let Some(key) = &self.ecdh_pub_key {
            put_bytes(buf, 6, key);
        }
        if let Some(sig) = &self.ecdh_sig {
            put_bytes(buf, 7, sig);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut server_version, mut token, mut key_accepted, mut version_accepted) =
            (None, None, None, None);
        let (mut session_key, mut ecdh_pub_key, mut ecdh_sig) = (None, None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => server_version = Some(value.as_u32(field)?),
                2 => token = Some(value.as_u32(field)?),
                3 => key_accepted = Some(value.as_bool(field)?),
                4 => version_accepted = Some(value.as_bool(field)?),
                5 => session_key = Some(value.into_string(field)?),
                6 => ecdh_pub_key = Some(value.into_bytes(field)?),
                7 => ecdh_sig = Some(value.into_bytes(field)?),
                _ => {}
            }
        }
        Ok(BangPayload {
            server_version: required(server_version, Self::NAME, "server_version")?,
            token: required(token, Self::NAME, "token")?,
            encrypted_key_accepted: required(key_accepted, Self::NAME, "encrypted_key_accepted")?,
            version_accepted: required(version_accepted, Self::NAME, "version_accepted")?,
            session_key: required(session_key, Self::NAME, "session_key")?,
            ecdh_pub_key,
            ecdh_sig,
        })
    }
}

/// Stream parameters. Both sides send one during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoPayload {
    pub effective_bw: u32,
    pub bitrate: u32,
    pub min_bitrate: u32,
    pub target_bitrate: u32,
    pub corrupt_frame_freq: u32,
    pub mtu: u32,
    pub fps: u32,
    pub monitor_interval: u32,
    pub ext_overhead: u32,
    pub int_overhead: u32,
    pub timeout_interval: u32,
    pub min_resume_quality: u32,
    pub min_fps: u32,
}

impl InfoPayload {
    const FIELDS: [&'static str; 13] = [
        "effective_bw",
        "bitrate",
        "min_bitrate",
        "target_bitrate",
        "corrupt_frame_freq",
        "mtu",
        "fps",
        "monitor_interval",
        "ext_overhead",
        "int_overhead",
        "timeout_interval",
        "min_resume_quality",
        "min_fps",
    ];

    fn as_array(&self) -> [u32; 13] {
        [
            self.effective_bw,
            self.bitrate,
            self.min_bitrate,
            self.target_bitrate,
            self.corrupt_frame_freq,
            self.mtu,
            self.fps,
            self.monitor_interval,
            self.ext_overhead,
            self.int_overhead,
            self.timeout_interval,
            self.min_resume_quality,
            self.min_fps,
        ]
    }
}

impl Payload for InfoPayload {
    const NAME: &'static str = "INFO";

    fn encode_fields(&self, buf: &mut BytesMut) {
        for (i, value) in self.as_array().iter().enumerate() {
            put_u32(buf, i as u32 + 1, *value);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut values: [Option<u32>; 13] = [None; 13];
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if (1..=13).contains(&field) {
                values[field as usize - 1] = Some(value.as_u32(field)?);
            }
        }
        let mut v = [0u32; 13];
        for (i, slot) in values.iter().enumerate() {
            v[i] = required(*slot, Self::NAME, Self::FIELDS[i])?;
        }
        Ok(InfoPayload {
            effective_bw: v[0],
            bitrate: v[1],
            min_bitrate: v[2],
            target_bitrate: v[3],
            corrupt_frame_freq: v[4],
            mtu: v[5],
            fps: v[6],
            monitor_interval: v[7],
            ext_overhead: v[8],
            int_overhead: v[9],
            timeout_interval: v[10],
            min_resume_quality: v[11],
            min_fps: v[12],
        })
    }
}

/// Structured disconnect cause.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventCode {
    pub code: u32,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl Payload for EventCode {
    const NAME: &'static str = "DISCONNECT.event_code";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.code);
        if let Some(name) = &self.name {
            put_str(buf, 2, name);
        }
        if let Some(description) = &self.description {
            put_str(buf, 3, description);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut code, mut name, mut description) = (None, None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => code = Some(value.as_u32(field)?),
                2 => name = Some(value.into_string(field)?),
                3 => description = Some(value.into_string(field)?),
                _ => {}
            }
        }
        Ok(EventCode {
            code: required(code, Self::NAME, "code")?,
            name,
            description,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisconnectPayload {
    pub reason: String,
    pub event_code: Option<EventCode>,
}

impl DisconnectPayload {
    pub fn new(reason: impl Into<String>) -> Self {
        DisconnectPayload {
            reason: reason.into(),
            event_code: None,
        }
    }
}

impl Payload for DisconnectPayload {
    const NAME: &'static str = "DISCONNECT";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.reason);
        if let Some(code) = &self.event_code {
            put_message(buf, 2, |b| code.encode_fields(b));
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut reason, mut event_code) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => reason = Some(value.into_string(field)?),
                2 => event_code = Some(EventCode::decode_fields(value.into_bytes(field)?)?),
                _ => {}
            }
        }
        Ok(DisconnectPayload {
            reason: required(reason, Self::NAME, "reason")?,
            event_code,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeepLinkPayload {
    pub deep_link_type: u32,
    pub deep_link_id: Option<String>,
}

impl Payload for DeepLinkPayload {
    const NAME: &'static str = "DEEPLINK";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.deep_link_type);
        if let Some(id) = &self.deep_link_id {
            put_str(buf, 2, id);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut deep_link_type, mut deep_link_id) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => deep_link_type = Some(value.as_u32(field)?),
                2 => deep_link_id = Some(value.into_string(field)?),
                _ => {}
            }
        }
        Ok(DeepLinkPayload {
            deep_link_type: required(deep_link_type, Self::NAME, "deep_link_type")?,
            deep_link_id,
        })
    }
}

// ─── Stream Payloads ────────────────────────────────────────────────────────

/// Inclusive range of frame indices the client could not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CorruptFramePayload {
    pub start: u32,
    pub end: u32,
}

impl Payload for CorruptFramePayload {
    const NAME: &'static str = "CORRUPTFRAME";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.start);
        put_u32(buf, 2, self.end);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut start, mut end) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => start = Some(value.as_u32(field)?),
                2 => end = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(CorruptFramePayload {
            start: required(start, Self::NAME, "start")?,
            end: required(end, Self::NAME, "end")?,
        })
    }
}

/// One video resolution the console may stream, with its codec header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolutionDescriptor {
    pub width: u32,
    pub height: u32,
    pub video_header: Bytes,
}

impl Payload for ResolutionDescriptor {
    const NAME: &'static str = "STREAMINFO.resolution";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.width);
        put_u32(buf, 2, self.height);
        put_bytes(buf, 3, &self.video_header);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut width, mut height, mut video_header) = (None, None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => width = Some(value.as_u32(field)?),
                2 => height = Some(value.as_u32(field)?),
                3 => video_header = Some(value.into_bytes(field)?),
                _ => {}
            }
        }
        Ok(ResolutionDescriptor {
            width: required(width, Self::NAME, "width")?,
            height: required(height, Self::NAME, "height")?,
            video_header: required(video_header, Self::NAME, "video_header")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioChannel {
    pub channel_id: u32,
    pub channel_type: u32,
}

impl Payload for AudioChannel {
    const NAME: &'static str = "STREAMINFO.audio_channel";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.channel_id);
        put_u32(buf, 2, self.channel_type);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut channel_id, mut channel_type) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => channel_id = Some(value.as_u32(field)?),
                2 => channel_type = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(AudioChannel {
            channel_id: required(channel_id, Self::NAME, "channel_id")?,
            channel_type: required(channel_type, Self::NAME, "channel_type")?,
        })
    }
}

/// Codec headers and stream timeouts announced by the console.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamInfoPayload {
    pub resolution: Vec<ResolutionDescriptor>,
    pub audio_header: Bytes,
    pub start_timeout: Option<u32>,
    pub afk_timeout: Option<u32>,
    pub afk_timeout_disconnect: Option<u32>,
    pub congestion_control_interval: Option<u32>,
    pub audio_channel: Vec<AudioChannel>,
}

impl Payload for StreamInfoPayload {
    const NAME: &'static str = "STREAMINFO";

    fn encode_fields(&self, buf: &mut BytesMut) {
        for res in &self.resolution {
            put_message(buf, 1, |b| res.encode_fields(b));
        }
        put_bytes(buf, 2, &self.audio_header);
        let optionals = [
            (3, self.start_timeout),
            (4, self.afk_timeout),
            (5, self.afk_timeout_disconnect),
            (6, self.congestion_control_interval),
        ];
        for (field, value) in optionals {
            if let Some(v) = value {
                put_u32(buf, field, v);
            }
        }
        for channel in &self.audio_channel {
            put_message(buf, 7, |b| channel.encode_fields(b));
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut out = StreamInfoPayload::default();
        let mut audio_header = None;
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => out
                    .resolution
                    .push(ResolutionDescriptor::decode_fields(value.into_bytes(field)?)?),
                2 => audio_header = Some(value.into_bytes(field)?),
                3 => out.start_timeout = Some(value.as_u32(field)?),
                4 => out.afk_timeout = Some(value.as_u32(field)?),
                5 => out.afk_timeout_disconnect = Some(value.as_u32(field)?),
                6 => out.congestion_control_interval = Some(value.as_u32(field)?),
                7 => out
                    .audio_channel
                    .push(AudioChannel::decode_fields(value.into_bytes(field)?)?),
                _ => {}
            }
        }
        out.audio_header = required(audio_header, Self::NAME, "audio_header")?;
        Ok(out)
    }
}

/// Contiguous range of AV packet indices with its received count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketLossPayload {
    pub start: u32,
    pub end: u32,
    pub packets_received: u32,
}

impl Payload for PacketLossPayload {
    const NAME: &'static str = "PACKETLOSS";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.start);
        put_u32(buf, 2, self.end);
        put_u32(buf, 3, self.packets_received);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut start, mut end, mut packets_received) = (None, None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => start = Some(value.as_u32(field)?),
                2 => end = Some(value.as_u32(field)?),
                3 => packets_received = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(PacketLossPayload {
            start: required(start, Self::NAME, "start")?,
            end: required(end, Self::NAME, "end")?,
            packets_received: required(packets_received, Self::NAME, "packets_received")?,
        })
    }
}

// ─── Senkusha (network test) ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SenkushaCommand {
    Echo = 1,
    Mtu = 2,
    Bandwidth = 3,
    ClientMtu = 4,
}

impl SenkushaCommand {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(SenkushaCommand::Echo),
            2 => Some(SenkushaCommand::Mtu),
            3 => Some(SenkushaCommand::Bandwidth),
            4 => Some(SenkushaCommand::ClientMtu),
            _ => None,
        }
    }

    fn sub_field(self) -> u32 {
        self as u32 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenkushaEcho {
    pub state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenkushaMtu {
    pub id: u32,
    pub mtu_req: u32,
    pub mtu_sent: Option<u32>,
    pub num: u32,
    pub mtu_delay: Option<u32>,
    pub mtu_delta: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenkushaBandwidth {
    pub id: u32,
    pub time: Option<u32>,
    pub bandwidth: Option<u32>,
    pub fps: Option<u32>,
    pub mtu: Option<u32>,
    pub loss: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenkushaClientMtu {
    pub id: u32,
    pub mtu_req: u32,
    pub state: bool,
    pub mtu_down: Option<u32>,
}

/// Network test step. The command and its sub-payload are one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenkushaPayload {
    Echo(SenkushaEcho),
    Mtu(SenkushaMtu),
    Bandwidth(SenkushaBandwidth),
    ClientMtu(SenkushaClientMtu),
}

impl SenkushaPayload {
    pub fn command(&self) -> SenkushaCommand {
        match self {
            SenkushaPayload::Echo(_) => SenkushaCommand::Echo,
            SenkushaPayload::Mtu(_) => SenkushaCommand::Mtu,
            SenkushaPayload::Bandwidth(_) => SenkushaCommand::Bandwidth,
            SenkushaPayload::ClientMtu(_) => SenkushaCommand::ClientMtu,
        }
    }

    /// Probe id, absent for ECHO.
    pub fn id(&self) -> Option<u32> {
        match self {
            SenkushaPayload::Echo(_) => None,
            SenkushaPayload::Mtu(m) => Some(m.id),
            SenkushaPayload::Bandwidth(b) => Some(b.id),
            SenkushaPayload::ClientMtu(c) => Some(c.id),
        }
    }
}

fn put_opt_u32(buf: &mut BytesMut, field: u32, value: Option<u32>) {
    if let Some(v) = value {
        put_u32(buf, field, v);
    }
}

impl Payload for SenkushaPayload {
    const NAME: &'static str = "SENKUSHA";

    fn encode_fields(&self, buf: &mut BytesMut) {
        let command = self.command();
        put_u32(buf, 1, command as u32);
        let field = command.sub_field();
        match self {
            SenkushaPayload::Echo(e) => put_message(buf, field, |b| put_bool(b, 1, e.state)),
            SenkushaPayload::Mtu(m) => put_message(buf, field, |b| {
                put_u32(b, 1, m.id);
                put_u32(b, 2, m.mtu_req);
                put_opt_u32(b, 3, m.mtu_sent);
                put_u32(b, 4, m.num);
                put_opt_u32(b, 5, m.mtu_delay);
                put_opt_u32(b, 6, m.mtu_delta);
            }),
            SenkushaPayload::Bandwidth(bw) => put_message(buf, field, |b| {
                put_u32(b, 1, bw.id);
                put_opt_u32(b, 2, bw.time);
                put_opt_u32(b, 3, bw.bandwidth);
                put_opt_u32(b, 4, bw.fps);
                put_opt_u32(b, 5, bw.mtu);
                put_opt_u32(b, 6, bw.loss);
            }),
            SenkushaPayload::ClientMtu(c) => put_message(buf, field, |b| {
                put_u32(b, 1, c.id);
                put_u32(b, 2, c.mtu_req);
                put_bool(b, 3, c.state);
                put_opt_u32(b, 4, c.mtu_down);
            }),
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut command = None;
        let mut sub: Option<(u32, Bytes)> = None;
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => command = Some(value.as_u32(field)?),
                2..=5 => {
                    if sub.is_some() {
                        return Err(CodecError::MalformedMessage(
                            "SENKUSHA carries more than one command payload".into(),
                        ));
                    }
                    sub = Some((field, value.into_bytes(field)?));
                }
                _ => {}
            }
        }
        let raw = required(command, Self::NAME, "command")?;
        let command = SenkushaCommand::from_u32(raw).ok_or_else(|| {
            CodecError::MalformedMessage(format!("unknown SENKUSHA command {raw}"))
        })?;
        let body = match sub {
            Some((field, body)) if field == command.sub_field() => body,
            _ => {
                return Err(CodecError::MalformedMessage(format!(
                    "SENKUSHA command {command:?} without its payload"
                )))
            }
        };
        decode_senkusha_command(command, body)
    }
}

fn decode_senkusha_command(
    command: SenkushaCommand,
    body: Bytes,
) -> Result<SenkushaPayload, CodecError> {
    const NAME: &str = "SENKUSHA";
    let mut f: [Option<u32>; 6] = [None; 6];
    let mut reader = FieldReader::new(body);
    while let Some((field, value)) = reader.next_field()? {
        if (1..=6).contains(&field) {
            f[field as usize - 1] = Some(value.as_u32(field)?);
        }
    }
    Ok(match command {
        SenkushaCommand::Echo => SenkushaPayload::Echo(SenkushaEcho {
            state: required(f[0], NAME, "echo.state")? != 0,
        }),
        SenkushaCommand::Mtu => SenkushaPayload::Mtu(SenkushaMtu {
            id: required(f[0], NAME, "mtu.id")?,
            mtu_req: required(f[1], NAME, "mtu.mtu_req")?,
            mtu_sent: f[2],
            num: required(f[3], NAME, "mtu.num")?,
            mtu_delay: f[4],
            mtu_delta: f[5],
        }),
        SenkushaCommand::Bandwidth => SenkushaPayload::Bandwidth(SenkushaBandwidth {
            id: required(f[0], NAME, "bandwidth.id")?,
            time: f[1],
            bandwidth: f[2],
            fps: f[3],
            mtu: f[4],
            loss: f[5],
        }),
        SenkushaCommand::ClientMtu => SenkushaPayload::ClientMtu(SenkushaClientMtu {
            id: required(f[0], NAME, "client_mtu.id")?,
            mtu_req: required(f[1], NAME, "client_mtu.mtu_req")?,
            state: required(f[2], NAME, "client_mtu.state")? != 0,
            mtu_down: f[3],
        }),
    })
}

// ─── Peripheral and Session Payloads ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerConnectionPayload {
    pub connected: bool,
    pub controller_id: Option<u32>,
    pub controller_type: Option<u32>,
}

impl Payload for ControllerConnectionPayload {
    const NAME: &'static str = "CONTROLLERCONNECTION";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_bool(buf, 1, self.connected);
        put_opt_u32(buf, 2, self.controller_id);
        put_opt_u32(buf, 3, self.controller_type);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut connected, mut controller_id, mut controller_type) = (None, None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => connected = Some(value.as_bool(field)?),
                2 => controller_id = Some(value.as_u32(field)?),
                3 => controller_type = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(ControllerConnectionPayload {
            connected: required(connected, Self::NAME, "connected")?,
            controller_id,
            controller_type,
        })
    }
}

/// Payload holding one required uint32. Shared by the acks and the small
/// single-value notifications.
macro_rules! single_u32_payload {
    ($(#[$doc:meta])* $name:ident, $wire_name:literal, $field:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name {
            pub $field: u32,
        }

        impl Payload for $name {
            const NAME: &'static str = $wire_name;

            fn encode_fields(&self, buf: &mut BytesMut) {
                put_u32(buf, 1, self.$field);
            }

            fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
                let mut value = None;
                let mut reader = FieldReader::new(body);
                while let Some((field, v)) = reader.next_field()? {
                    if field == 1 {
                        value = Some(v.as_u32(field)?);
                    }
                }
                Ok($name {
                    $field: required(value, Self::NAME, stringify!($field))?,
                })
            }
        }
    };
}

single_u32_payload!(ControllerConnectionAckPayload, "CONTROLLERCONNECTIONACK", result);
single_u32_payload!(TakionProtocolRequestAckPayload, "TAKIONPROTOCOLREQUESTACK", version);
single_u32_payload!(PlayTimeLeftPayload, "PLAYTIMELEFT", minutes);
single_u32_payload!(
    /// Console asks for a new encoder frame rate.
    FpsChangePayload,
    "FPSCHANGE",
    fps
);
single_u32_payload!(XmbCommandPayload, "XMBCOMMAND", command);
single_u32_payload!(MicConnectionAckPayload, "MICCONNECTIONACK", result);
single_u32_payload!(KeyboardCloseReqPayload, "KEYBOARDCLOSEREQ", reason);
single_u32_payload!(KeyboardCloseResPayload, "KEYBOARDCLOSERES", status);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientInfoPayload {
    pub client_type: String,
    pub os_version: Option<String>,
}

impl Payload for ClientInfoPayload {
    const NAME: &'static str = "CLIENTINFO";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.client_type);
        if let Some(os) = &self.os_version {
            put_str(buf, 2, os);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut client_type, mut os_version) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => client_type = Some(value.into_string(field)?),
                2 => os_version = Some(value.into_string(field)?),
                _ => {}
            }
        }
        Ok(ClientInfoPayload {
            client_type: required(client_type, Self::NAME, "client_type")?,
            os_version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TakionProtocolRequestPayload {
    pub supported_versions: Vec<u32>,
}

impl Payload for TakionProtocolRequestPayload {
    const NAME: &'static str = "TAKIONPROTOCOLREQUEST";

    fn encode_fields(&self, buf: &mut BytesMut) {
        for v in &self.supported_versions {
            put_u32(buf, 1, *v);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut supported_versions = Vec::new();
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if field == 1 {
                value.extend_u32(field, &mut supported_versions)?;
            }
        }
        Ok(TakionProtocolRequestPayload { supported_versions })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerSettingsPayload {
    pub use_microphone: Option<bool>,
    pub stream_quality: Option<u32>,
    pub hdr: Option<bool>,
}

impl Payload for ServerSettingsPayload {
    const NAME: &'static str = "SERVERSETTINGS";

    fn encode_fields(&self, buf: &mut BytesMut) {
        if let Some(mic) = self.use_microphone {
            put_bool(buf, 1, mic);
        }
        put_opt_u32(buf, 2, self.stream_quality);
        if let Some(hdr) = self.hdr {
            put_bool(buf, 3, hdr);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut out = ServerSettingsPayload::default();
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => out.use_microphone = Some(value.as_bool(field)?),
                2 => out.stream_quality = Some(value.as_u32(field)?),
                3 => out.hdr = Some(value.as_bool(field)?),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Milliseconds since streaming began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodicTimestampPayload {
    pub timestamp: u64,
}

impl Payload for PeriodicTimestampPayload {
    const NAME: &'static str = "PERIODICTIMESTAMP";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u64(buf, 1, self.timestamp);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut timestamp = None;
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if field == 1 {
                timestamp = Some(value.as_u64(field)?);
            }
        }
        Ok(PeriodicTimestampPayload {
            timestamp: required(timestamp, Self::NAME, "timestamp")?,
        })
    }
}

/// Client-measured link quality, reported to the console and to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConnectionQualityPayload {
    pub target_bitrate: Option<u32>,
    pub upstream_bitrate: Option<u32>,
    pub upstream_loss: Option<f32>,
    pub disable_upstream_audio: Option<bool>,
    pub rtt: Option<f64>,
    pub loss: Option<u64>,
}

impl Payload for ConnectionQualityPayload {
    const NAME: &'static str = "CONNECTIONQUALITY";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_opt_u32(buf, 1, self.target_bitrate);
        put_opt_u32(buf, 2, self.upstream_bitrate);
        if let Some(v) = self.upstream_loss {
            put_f32(buf, 3, v);
        }
        if let Some(v) = self.disable_upstream_audio {
            put_bool(buf, 4, v);
        }
        if let Some(v) = self.rtt {
            put_f64(buf, 5, v);
        }
        if let Some(v) = self.loss {
            put_u64(buf, 6, v);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut out = ConnectionQualityPayload::default();
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => out.target_bitrate = Some(value.as_u32(field)?),
                2 => out.upstream_bitrate = Some(value.as_u32(field)?),
                3 => out.upstream_loss = Some(value.as_f32(field)?),
                4 => out.disable_upstream_audio = Some(value.as_bool(field)?),
                5 => out.rtt = Some(value.as_f64(field)?),
                6 => out.loss = Some(value.as_u64(field)?),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoCapturePayload {
    pub capture_enabled: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Payload for VideoCapturePayload {
    const NAME: &'static str = "VIDEOCAPTURE";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_bool(buf, 1, self.capture_enabled);
        put_opt_u32(buf, 2, self.width);
        put_opt_u32(buf, 3, self.height);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut enabled, mut width, mut height) = (None, None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => enabled = Some(value.as_bool(field)?),
                2 => width = Some(value.as_u32(field)?),
                3 => height = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(VideoCapturePayload {
            capture_enabled: required(enabled, Self::NAME, "capture_enabled")?,
            width,
            height,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioCapturePayload {
    pub capture_enabled: bool,
    pub channels: Option<u32>,
}

impl Payload for AudioCapturePayload {
    const NAME: &'static str = "AUDIOCAPTURE";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_bool(buf, 1, self.capture_enabled);
        put_opt_u32(buf, 2, self.channels);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut enabled, mut channels) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => enabled = Some(value.as_bool(field)?),
                2 => channels = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(AudioCapturePayload {
            capture_enabled: required(enabled, Self::NAME, "capture_enabled")?,
            channels,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MicConnectionPayload {
    pub connected: bool,
    pub mic_id: Option<u32>,
}

impl Payload for MicConnectionPayload {
    const NAME: &'static str = "MICCONNECTION";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_bool(buf, 1, self.connected);
        put_opt_u32(buf, 2, self.mic_id);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut connected, mut mic_id) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => connected = Some(value.as_bool(field)?),
                2 => mic_id = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(MicConnectionPayload {
            connected: required(connected, Self::NAME, "connected")?,
            mic_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyboardEnableTogglePayload {
    pub enabled: bool,
}

impl Payload for KeyboardEnableTogglePayload {
    const NAME: &'static str = "KEYBOARDENABLETOGGLE";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_bool(buf, 1, self.enabled);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut enabled = None;
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if field == 1 {
                enabled = Some(value.as_bool(field)?);
            }
        }
        Ok(KeyboardEnableTogglePayload {
            enabled: required(enabled, Self::NAME, "enabled")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyboardOpenPayload {
    pub keyboard_type: u32,
    pub text: Option<String>,
    pub max_length: Option<u32>,
}

impl Payload for KeyboardOpenPayload {
    const NAME: &'static str = "KEYBOARDOPEN";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.keyboard_type);
        if let Some(text) = &self.text {
            put_str(buf, 2, text);
        }
        put_opt_u32(buf, 3, self.max_length);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut keyboard_type, mut text, mut max_length) = (None, None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => keyboard_type = Some(value.as_u32(field)?),
                2 => text = Some(value.into_string(field)?),
                3 => max_length = Some(value.as_u32(field)?),
                _ => {}
            }
        }
        Ok(KeyboardOpenPayload {
            keyboard_type: required(keyboard_type, Self::NAME, "keyboard_type")?,
            text,
            max_length,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyboardTextChangeReqPayload {
    pub text: String,
}

impl Payload for KeyboardTextChangeReqPayload {
    const NAME: &'static str = "KEYBOARDTEXTCHANGEREQ";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.text);
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let mut text = None;
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if field == 1 {
                text = Some(value.into_string(field)?);
            }
        }
        Ok(KeyboardTextChangeReqPayload {
            text: required(text, Self::NAME, "text")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyboardTextChangeResPayload {
    pub status: u32,
    pub text: Option<String>,
}

impl Payload for KeyboardTextChangeResPayload {
    const NAME: &'static str = "KEYBOARDTEXTCHANGERES";

    fn encode_fields(&self, buf: &mut BytesMut) {
        put_u32(buf, 1, self.status);
        if let Some(text) = &self.text {
            put_str(buf, 2, text);
        }
    }

    fn decode_fields(body: Bytes) -> Result<Self, CodecError> {
        let (mut status, mut text) = (None, None);
        let mut reader = FieldReader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => status = Some(value.as_u32(field)?),
                2 => text = Some(value.into_string(field)?),
                _ => {}
            }
        }
        Ok(KeyboardTextChangeResPayload {
            status: required(status, Self::NAME, "status")?,
            text,
        })
    }
}

// ─── Takion Message ─────────────────────────────────────────────────────────

/// A control message: the discriminant and its payload in one value.
#[derive(Debug, Clone, PartialEq)]
pub enum TakionMessage {
    Big(BigPayload),
    Bang(BangPayload),
    Info(InfoPayload),
    Disconnect(DisconnectPayload),
    DeepLink(DeepLinkPayload),
    Heartbeat,
    CorruptFrame(CorruptFramePayload),
    StreamInfo(StreamInfoPayload),
    PacketLoss(PacketLossPayload),
    Senkusha(SenkushaPayload),
    StreamInfoAck,
    ControllerConnection(ControllerConnectionPayload),
    ControllerConnectionAck(ControllerConnectionAckPayload),
    ClientInfo(ClientInfoPayload),
    TakionProtocolRequest(TakionProtocolRequestPayload),
    TakionProtocolRequestAck(TakionProtocolRequestAckPayload),
    ServerSettings(ServerSettingsPayload),
    PeriodicTimestamp(PeriodicTimestampPayload),
    PlayTimeLeft(PlayTimeLeftPayload),
    IdrRequest,
    FpsChange(FpsChangePayload),
    ConnectionQuality(ConnectionQualityPayload),
    XmbCommand(XmbCommandPayload),
    VideoCapture(VideoCapturePayload),
    AudioCapture(AudioCapturePayload),
    MicConnection(MicConnectionPayload),
    MicConnectionAck(MicConnectionAckPayload),
    KeyboardEnableToggle(KeyboardEnableTogglePayload),
    KeyboardOpen(KeyboardOpenPayload),
    KeyboardTextChangeReq(KeyboardTextChangeReqPayload),
    KeyboardTextChangeRes(KeyboardTextChangeResPayload),
    KeyboardCloseReq(KeyboardCloseReqPayload),
    KeyboardCloseRes(KeyboardCloseResPayload),
}

impl TakionMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            TakionMessage::Big(_) => MessageType::Big,
            TakionMessage::Bang(_) => MessageType::Bang,
            TakionMessage::Info(_) => MessageType::Info,
            TakionMessage::Disconnect(_) => MessageType::Disconnect,
            TakionMessage::DeepLink(_) => MessageType::DeepLink,
            TakionMessage::Heartbeat => MessageType::Heartbeat,
            TakionMessage::CorruptFrame(_) => MessageType::CorruptFrame,
            TakionMessage::StreamInfo(_) => MessageType::StreamInfo,
            TakionMessage::PacketLoss(_) => MessageType::PacketLoss,
            TakionMessage::Senkusha(_) => MessageType::Senkusha,
            TakionMessage::StreamInfoAck => MessageType::StreamInfoAck,
            TakionMessage::ControllerConnection(_) => MessageType::ControllerConnection,
            TakionMessage::ControllerConnectionAck(_) => MessageType::ControllerConnectionAck,
            TakionMessage::ClientInfo(_) => MessageType::ClientInfo,
            TakionMessage::TakionProtocolRequest(_) => MessageType::TakionProtocolRequest,
            TakionMessage::TakionProtocolRequestAck(_) => MessageType::TakionProtocolRequestAck,
            TakionMessage::ServerSettings(_) => MessageType::ServerSettings,
            TakionMessage::PeriodicTimestamp(_) => MessageType::PeriodicTimestamp,
            TakionMessage::PlayTimeLeft(_) => MessageType::PlayTimeLeft,
            TakionMessage::IdrRequest => MessageType::IdrRequest,
            TakionMessage::FpsChange(_) => MessageType::FpsChange,
            TakionMessage::ConnectionQuality(_) => MessageType::ConnectionQuality,
            TakionMessage::XmbCommand(_) => MessageType::XmbCommand,
            TakionMessage::VideoCapture(_) => MessageType::VideoCapture,
            TakionMessage::AudioCapture(_) => MessageType::AudioCapture,
            TakionMessage::MicConnection(_) => MessageType::MicConnection,
            TakionMessage::MicConnectionAck(_) => MessageType::MicConnectionAck,
            TakionMessage::KeyboardEnableToggle(_) => MessageType::KeyboardEnableToggle,
            TakionMessage::KeyboardOpen(_) => MessageType::KeyboardOpen,
            TakionMessage::KeyboardTextChangeReq(_) => MessageType::KeyboardTextChangeReq,
            TakionMessage::KeyboardTextChangeRes(_) => MessageType::KeyboardTextChangeRes,
            TakionMessage::KeyboardCloseReq(_) => MessageType::KeyboardCloseReq,
            TakionMessage::KeyboardCloseRes(_) => MessageType::KeyboardCloseRes,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            TakionMessage::Heartbeat
            | TakionMessage::StreamInfoAck
            | TakionMessage::IdrRequest => {}
            TakionMessage::Big(p) => p.encode_fields(buf),
            TakionMessage::Bang(p) => p.encode_fields(buf),
            TakionMessage::Info(p) => p.encode_fields(buf),
            TakionMessage::Disconnect(p) => p.encode_fields(buf),
            TakionMessage::DeepLink(p) => p.encode_fields(buf),
            TakionMessage::CorruptFrame(p) => p.encode_fields(buf),
            TakionMessage::StreamInfo(p) => p.encode_fields(buf),
            TakionMessage::PacketLoss(p) => p.encode_fields(buf),
            TakionMessage::Senkusha(p) => p.encode_fields(buf),
            TakionMessage::ControllerConnection(p) => p.encode_fields(buf),
            TakionMessage::ControllerConnectionAck(p) => p.encode_fields(buf),
            TakionMessage::ClientInfo(p) => p.encode_fields(buf),
            TakionMessage::TakionProtocolRequest(p) => p.encode_fields(buf),
            TakionMessage::TakionProtocolRequestAck(p) => p.encode_fields(buf),
            TakionMessage::ServerSettings(p) => p.encode_fields(buf),
            TakionMessage::PeriodicTimestamp(p) => p.encode_fields(buf),
            TakionMessage::PlayTimeLeft(p) => p.encode_fields(buf),
            TakionMessage::FpsChange(p) => p.encode_fields(buf),
            TakionMessage::ConnectionQuality(p) => p.encode_fields(buf),
            TakionMessage::XmbCommand(p) => p.encode_fields(buf),
            TakionMessage::VideoCapture(p) => p.encode_fields(buf),
            TakionMessage::AudioCapture(p) => p.encode_fields(buf),
            TakionMessage::MicConnection(p) => p.encode_fields(buf),
            TakionMessage::MicConnectionAck(p) => p.encode_fields(buf),
            TakionMessage::KeyboardEnableToggle(p) => p.encode_fields(buf),
            TakionMessage::KeyboardOpen(p) => p.encode_fields(buf),
            TakionMessage::KeyboardTextChangeReq(p) => p.encode_fields(buf),
            TakionMessage::KeyboardTextChangeRes(p) => p.encode_fields(buf),
            TakionMessage::KeyboardCloseReq(p) => p.encode_fields(buf),
            TakionMessage::KeyboardCloseRes(p) => p.encode_fields(buf),
        }
    }

    /// Serialize to the wire field set.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        let kind = self.message_type();
        put_u32(&mut buf, 1, kind as u32);
        if let Some(field) = kind.payload_field() {
            put_message(&mut buf, field, |b| self.encode_payload(b));
        }
        buf.freeze()
    }

    /// Parse a wire field set, enforcing the type/payload invariant.
    pub fn decode(data: Bytes) -> Result<TakionMessage, CodecError> {
        let mut kind_raw = None;
        let mut payload: Option<(u32, Bytes)> = None;
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => kind_raw = Some(value.as_u32(field)?),
                2..=34 => {
                    if payload.is_some() {
                        return Err(CodecError::MalformedMessage(
                            "more than one payload present".into(),
                        ));
                    }
                    payload = Some((field, value.into_bytes(field)?));
                }
                _ => {}
            }
        }

        let raw = kind_raw
            .ok_or_else(|| CodecError::MalformedMessage("missing type discriminant".into()))?;
        let kind = MessageType::from_u32(raw)
            .ok_or_else(|| CodecError::MalformedMessage(format!("unknown message type {raw}")))?;

        let body = match (kind.payload_field(), payload) {
            (None, None) => Bytes::new(),
            (None, Some((field, _))) => {
                return Err(CodecError::MalformedMessage(format!(
                    "{kind} carries unexpected payload field {field}"
                )))
            }
            (Some(_), None) => {
                return Err(CodecError::MalformedMessage(format!("{kind} without its payload")))
            }
            (Some(expected), Some((field, body))) if field == expected => body,
            (Some(_), Some((field, _))) => {
                return Err(CodecError::MalformedMessage(format!(
                    "{kind} carries payload field {field} of another type"
                )))
            }
        };

        Ok(match kind {
            MessageType::Heartbeat => TakionMessage::Heartbeat,
            MessageType::StreamInfoAck => TakionMessage::StreamInfoAck,
            MessageType::IdrRequest => TakionMessage::IdrRequest,
            MessageType::Big => TakionMessage::Big(BigPayload::decode_fields(body)?),
            MessageType::Bang => TakionMessage::Bang(BangPayload::decode_fields(body)?),
            MessageType::Info => TakionMessage::Info(InfoPayload::decode_fields(body)?),
            MessageType::Disconnect => {
                TakionMessage::Disconnect(DisconnectPayload::decode_fields(body)?)
            }
            MessageType::DeepLink => TakionMessage::DeepLink(DeepLinkPayload::decode_fields(body)?),
            MessageType::CorruptFrame => {
                TakionMessage::CorruptFrame(CorruptFramePayload::decode_fields(body)?)
            }
            MessageType::StreamInfo => {
                TakionMessage::StreamInfo(StreamInfoPayload::decode_fields(body)?)
            }
            MessageType::PacketLoss => {
                TakionMessage::PacketLoss(PacketLossPayload::decode_fields(body)?)
            }
            MessageType::Senkusha => TakionMessage::Senkusha(SenkushaPayload::decode_fields(body)?),
            MessageType::ControllerConnection => {
                TakionMessage::ControllerConnection(
                    ControllerConnectionPayload::decode_fields(body)?,
                )
            }
            MessageType::ControllerConnectionAck => {
                TakionMessage::ControllerConnectionAck(
                    ControllerConnectionAckPayload::decode_fields(body)?,
                )
            }
            MessageType::ClientInfo => {
                TakionMessage::ClientInfo(ClientInfoPayload::decode_fields(body)?)
            }
            MessageType::TakionProtocolRequest => {
                TakionMessage::TakionProtocolRequest(
                    TakionProtocolRequestPayload::decode_fields(body)?,
                )
            }
            MessageType::TakionProtocolRequestAck => {
                TakionMessage::TakionProtocolRequestAck(
                    TakionProtocolRequestAckPayload::decode_fields(body)?,
                )
            }
            MessageType::ServerSettings => {
                TakionMessage::ServerSettings(ServerSettingsPayload::decode_fields(body)?)
            }
            MessageType::PeriodicTimestamp => {
                TakionMessage::PeriodicTimestamp(PeriodicTimestampPayload::decode_fields(body)?)
            }
            MessageType::PlayTimeLeft => {
                TakionMessage::PlayTimeLeft(PlayTimeLeftPayload::decode_fields(body)?)
            }
            MessageType::FpsChange => {
                TakionMessage::FpsChange(FpsChangePayload::decode_fields(body)?)
            }
            MessageType::ConnectionQuality => {
                TakionMessage::ConnectionQuality(ConnectionQualityPayload::decode_fields(body)?)
            }
            MessageType::XmbCommand => {
                TakionMessage::XmbCommand(XmbCommandPayload::decode_fields(body)?)
            }
            MessageType::VideoCapture => {
                TakionMessage::VideoCapture(VideoCapturePayload::decode_fields(body)?)
            }
            MessageType::AudioCapture => {
                TakionMessage::AudioCapture(AudioCapturePayload::decode_fields(body)?)
            }
            MessageType::MicConnection => {
                TakionMessage::MicConnection(MicConnectionPayload::decode_fields(body)?)
            }
            MessageType::MicConnectionAck => {
                TakionMessage::MicConnectionAck(MicConnectionAckPayload::decode_fields(body)?)
            }
            MessageType::KeyboardEnableToggle => {
                TakionMessage::KeyboardEnableToggle(
                    KeyboardEnableTogglePayload::decode_fields(body)?,
                )
            }
            MessageType::KeyboardOpen => {
                TakionMessage::KeyboardOpen(KeyboardOpenPayload::decode_fields(body)?)
            }
            MessageType::KeyboardTextChangeReq => {
                TakionMessage::KeyboardTextChangeReq(
                    KeyboardTextChangeReqPayload::decode_fields(body)?,
                )
            }
            MessageType::KeyboardTextChangeRes => {
                TakionMessage::KeyboardTextChangeRes(
                    KeyboardTextChangeResPayload::decode_fields(body)?,
                )
            }
            MessageType::KeyboardCloseReq => {
                TakionMessage::KeyboardCloseReq(KeyboardCloseReqPayload::decode_fields(body)?)
            }
            MessageType::KeyboardCloseRes => {
                TakionMessage::KeyboardCloseRes(KeyboardCloseResPayload::decode_fields(body)?)
            }
        })
    }
}
