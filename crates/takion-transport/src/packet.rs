//! # Datagram Framing
//!
//! Binary layout of every UDP datagram on the Takion stream port. All
//! multi-byte integers are big endian.
//!
//! ## Control datagram
//!
//! ```text
//!  0        1                 5                 9                 13
//! +--------+-----------------+-----------------+-----------------+
//! | type=0 |   remote tag    |      gmac       |     key_pos     |
//! +--------+--------+--------+-----------------+-----------------+
//! | chunk  | flags  | length |  chunk body (length - 4 bytes) ...
//! +--------+--------+--------+--------------------------------------
//! ```
//!
//! Chunks follow SCTP: INIT / INIT_ACK / COOKIE / COOKIE_ACK set up the
//! association, DATA carries one [`crate::message::TakionMessage`] and is
//! answered with DATA_ACK.
//!
//! ## Congestion datagram (15 bytes)
//!
//! `type=5 | pad(2) | received u16 | lost u16 | gmac u32 | key_pos u32`
//!
//! ## AV datagram
//!
//! ```text
//!  0      1        3        5            9       10      14      18
//! +------+--------+--------+------------+-------+-------+-------+---------+
//! | type | packet | frame  | unit word  | codec | gmac  |key_pos| ext ... |
//! +------+--------+--------+------------+-------+-------+-------+---------+
//! ```
//!
//! The low nibble of `type` is VIDEO (2) or AUDIO (3); bit 4 flags a 3-byte
//! unit prefix after the extension. The payload after that is encrypted at
//! `key_pos`.
//!
//! In every datagram the tag is computed with the gmac and key_pos fields
//! zeroed; [`auth_offset`] locates them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

// ─── Constants ──────────────────────────────────────────────────────────────

pub const CONTROL_HEADER_LEN: usize = 13;
pub const CHUNK_HEADER_LEN: usize = 4;
/// TSN, channel and padding in front of DATA chunk bytes.
pub const DATA_PREFIX_LEN: usize = 9;
pub const CONGESTION_PACKET_LEN: usize = 15;
pub const AV_HEADER_LEN: usize = 18;
pub const UNIT_PREFIX_LEN: usize = 3;

pub const A_RWND: u32 = 0x0001_9000;
pub const OUTBOUND_STREAMS: u16 = 0x64;
pub const INBOUND_STREAMS: u16 = 0x64;

const UNIT_PREFIX_FLAG: u8 = 0x10;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("datagram truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unknown header type {0:#04x}")]
    UnknownHeaderType(u8),
    #[error("unknown chunk type {0:#04x}")]
    UnknownChunkType(u8),
    #[error("chunk length {declared} does not match {actual} bytes present")]
    ChunkLength { declared: usize, actual: usize },
    #[error("inconsistent unit layout: {0}")]
    InvalidUnits(&'static str),
}

fn need(buf: &[u8], needed: usize) -> Result<(), PacketError> {
    if buf.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

// ─── Header Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderType {
    Control = 0x00,
    Video = 0x02,
    Audio = 0x03,
    Congestion = 0x05,
}

impl HeaderType {
    /// Classify by the low nibble of the first byte.
    pub fn from_first_byte(byte: u8) -> Result<Self, PacketError> {
        match byte & 0x0F {
            0x00 => Ok(HeaderType::Control),
            0x02 => Ok(HeaderType::Video),
            0x03 => Ok(HeaderType::Audio),
            0x05 => Ok(HeaderType::Congestion),
            _ => Err(PacketError::UnknownHeaderType(byte)),
        }
    }
}

/// Byte offset of the gmac field; key_pos follows it directly.
pub fn auth_offset(header_type: HeaderType) -> usize {
    match header_type {
        HeaderType::Control => 5,
        HeaderType::Congestion => 7,
        HeaderType::Video | HeaderType::Audio => 10,
    }
}

/// Copy of a datagram with gmac and key_pos zeroed, as fed to the tag.
pub fn auth_view(datagram: &[u8]) -> Result<BytesMut, PacketError> {
    need(datagram, 1)?;
    let off = auth_offset(HeaderType::from_first_byte(datagram[0])?);
    need(datagram, off + 8)?;
    let mut view = BytesMut::from(datagram);
    view[off..off + 8].fill(0);
    Ok(view)
}

/// Write gmac and key_pos into an encoded datagram.
pub fn stamp_auth(datagram: &mut [u8], gmac: u32, key_pos: u32) -> Result<(), PacketError> {
    need(datagram, 1)?;
    let off = auth_offset(HeaderType::from_first_byte(datagram[0])?);
    need(datagram, off + 8)?;
    datagram[off..off + 4].copy_from_slice(&gmac.to_be_bytes());
    datagram[off + 4..off + 8].copy_from_slice(&key_pos.to_be_bytes());
    Ok(())
}

// ─── Chunks ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    Data = 0x00,
    Init = 0x01,
    InitAck = 0x02,
    DataAck = 0x03,
    Cookie = 0x0A,
    CookieAck = 0x0B,
}

impl ChunkType {
    pub fn from_u8(v: u8) -> Result<Self, PacketError> {
        match v {
            0x00 => Ok(ChunkType::Data),
            0x01 => Ok(ChunkType::Init),
            0x02 => Ok(ChunkType::InitAck),
            0x03 => Ok(ChunkType::DataAck),
            0x0A => Ok(ChunkType::Cookie),
            0x0B => Ok(ChunkType::CookieAck),
            other => Err(PacketError::UnknownChunkType(other)),
        }
    }
}

/// Association parameters carried by INIT and INIT_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitParams {
    pub tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
}

impl InitParams {
    pub const LEN: usize = 16;

    pub fn new(tag: u32, initial_tsn: u32) -> Self {
        InitParams {
            tag,
            a_rwnd: A_RWND,
            outbound_streams: OUTBOUND_STREAMS,
            inbound_streams: INBOUND_STREAMS,
            initial_tsn,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.tag);
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.outbound_streams);
        buf.put_u16(self.inbound_streams);
        buf.put_u32(self.initial_tsn);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        need(buf, Self::LEN)?;
        Ok(InitParams {
            tag: buf.get_u32(),
            a_rwnd: buf.get_u32(),
            outbound_streams: buf.get_u16(),
            inbound_streams: buf.get_u16(),
            initial_tsn: buf.get_u32(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data { tsn: u32, channel: u16, data: Bytes },
    Init(InitParams),
    InitAck { params: InitParams, cookie: Bytes },
    DataAck {
        tsn: u32,
        a_rwnd: u32,
        gap_blocks: u16,
        dup_tsns: u16,
    },
    Cookie(Bytes),
    CookieAck(Bytes),
}

impl Chunk {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Data { .. } => ChunkType::Data,
            Chunk::Init(_) => ChunkType::Init,
            Chunk::InitAck { .. } => ChunkType::InitAck,
            Chunk::DataAck { .. } => ChunkType::DataAck,
            Chunk::Cookie(_) => ChunkType::Cookie,
            Chunk::CookieAck(_) => ChunkType::CookieAck,
        }
    }

    /// Acknowledgement for a received DATA TSN.
    pub fn data_ack(tsn: u32) -> Self {
        Chunk::DataAck {
            tsn,
            a_rwnd: A_RWND,
            gap_blocks: 0,
            dup_tsns: 0,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Chunk::Data { data, .. } => DATA_PREFIX_LEN + data.len(),
            Chunk::Init(_) => InitParams::LEN,
            Chunk::InitAck { cookie, .. } => InitParams::LEN + cookie.len(),
            Chunk::DataAck { .. } => 12,
            Chunk::Cookie(c) | Chunk::CookieAck(c) => c.len(),
        }
    }

    fn encode_body(&self, buf: &mut impl BufMut) {
        match self {
            Chunk::Data { tsn, channel, data } => {
                buf.put_u32(*tsn);
                buf.put_u16(*channel);
                buf.put_bytes(0, 3);
                buf.put_slice(data);
            }
            Chunk::Init(params) => params.encode(buf),
            Chunk::InitAck { params, cookie } => {
                params.encode(buf);
                buf.put_slice(cookie);
            }
            Chunk::DataAck {
                tsn,
                a_rwnd,
                gap_blocks,
                dup_tsns,
            } => {
                buf.put_u32(*tsn);
                buf.put_u32(*a_rwnd);
                buf.put_u16(*gap_blocks);
                buf.put_u16(*dup_tsns);
            }
            Chunk::Cookie(c) | Chunk::CookieAck(c) => buf.put_slice(c),
        }
    }

    fn decode_body(chunk_type: ChunkType, mut body: Bytes) -> Result<Self, PacketError> {
        Ok(match chunk_type {
            ChunkType::Data => {
                need(&body, DATA_PREFIX_LEN)?;
                let tsn = body.get_u32();
                let channel = body.get_u16();
                body.advance(3);
                Chunk::Data {
                    tsn,
                    channel,
                    data: body,
                }
            }
            ChunkType::Init => Chunk::Init(InitParams::decode(&mut body)?),
            ChunkType::InitAck => {
                let params = InitParams::decode(&mut body)?;
                Chunk::InitAck {
                    params,
                    cookie: body,
                }
            }
            ChunkType::DataAck => {
                need(&body, 12)?;
                Chunk::DataAck {
                    tsn: body.get_u32(),
                    a_rwnd: body.get_u32(),
                    gap_blocks: body.get_u16(),
                    dup_tsns: body.get_u16(),
                }
            }
            ChunkType::Cookie => Chunk::Cookie(body),
            ChunkType::CookieAck => Chunk::CookieAck(body),
        })
    }
}

// ─── Control Packet ─────────────────────────────────────────────────────────

/// A CONTROL datagram: header plus exactly one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// Tag of the receiving side.
    pub tag: u32,
    pub gmac: u32,
    pub key_pos: u32,
    pub flags: u8,
    pub chunk: Chunk,
}

impl ControlPacket {
    pub fn new(tag: u32, flags: u8, chunk: Chunk) -> Self {
        ControlPacket {
            tag,
            gmac: 0,
            key_pos: 0,
            flags,
            chunk,
        }
    }

    pub fn encoded_len(&self) -> usize {
        CONTROL_HEADER_LEN + CHUNK_HEADER_LEN + self.chunk.body_len()
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(HeaderType::Control as u8);
        buf.put_u32(self.tag);
        buf.put_u32(self.gmac);
        buf.put_u32(self.key_pos);
        buf.put_u8(self.chunk.chunk_type() as u8);
        buf.put_u8(self.flags);
        buf.put_u16((self.chunk.body_len() + CHUNK_HEADER_LEN) as u16);
        self.chunk.encode_body(&mut buf);
        buf
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, PacketError> {
        need(&buf, CONTROL_HEADER_LEN + CHUNK_HEADER_LEN)?;
        let header_type = buf.get_u8();
        if header_type != HeaderType::Control as u8 {
            return Err(PacketError::UnknownHeaderType(header_type));
        }
        let tag = buf.get_u32();
        let gmac = buf.get_u32();
        let key_pos = buf.get_u32();
        let chunk_type = ChunkType::from_u8(buf.get_u8())?;
        let flags = buf.get_u8();
        let declared = buf.get_u16() as usize;
        let body_len = declared
            .checked_sub(CHUNK_HEADER_LEN)
            .ok_or(PacketError::ChunkLength {
                declared,
                actual: buf.len() + CHUNK_HEADER_LEN,
            })?;
        if body_len > buf.len() {
            return Err(PacketError::ChunkLength {
                declared,
                actual: buf.len() + CHUNK_HEADER_LEN,
            });
        }
        let chunk = Chunk::decode_body(chunk_type, buf.split_to(body_len))?;
        Ok(ControlPacket {
            tag,
            gmac,
            key_pos,
            flags,
            chunk,
        })
    }
}

// ─── Congestion Packet ──────────────────────────────────────────────────────

/// Periodic receive/loss counters sent to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CongestionPacket {
    pub received: u16,
    pub lost: u16,
    pub gmac: u32,
    pub key_pos: u32,
}

impl CongestionPacket {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(CONGESTION_PACKET_LEN);
        buf.put_u8(HeaderType::Congestion as u8);
        buf.put_bytes(0, 2);
        buf.put_u16(self.received);
        buf.put_u16(self.lost);
        buf.put_u32(self.gmac);
        buf.put_u32(self.key_pos);
        buf
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, PacketError> {
        need(&buf, CONGESTION_PACKET_LEN)?;
        let header_type = buf.get_u8();
        if header_type != HeaderType::Congestion as u8 {
            return Err(PacketError::UnknownHeaderType(header_type));
        }
        buf.advance(2);
        Ok(CongestionPacket {
            received: buf.get_u16(),
            lost: buf.get_u16(),
            gmac: buf.get_u32(),
            key_pos: buf.get_u32(),
        })
    }
}

// ─── AV Packet ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn header_type(self) -> HeaderType {
        match self {
            StreamKind::Video => HeaderType::Video,
            StreamKind::Audio => HeaderType::Audio,
        }
    }

    fn extension_len(self) -> usize {
        match self {
            StreamKind::Video => 3,
            StreamKind::Audio => 1,
        }
    }
}

/// Decoded AV header. `units_total = units_src + units_fec` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvHeader {
    pub stream: StreamKind,
    /// Per-stream datagram counter, used for loss accounting.
    pub packet_index: u16,
    pub frame_index: u16,
    /// Shard index inside its block group.
    pub unit_index: u16,
    pub units_total: u16,
    pub units_fec: u16,
    pub units_src: u16,
    /// Audio only: encoded audio unit size.
    pub audio_unit_size: u8,
    pub codec: u8,
    pub gmac: u32,
    pub key_pos: u32,
    pub block_group: u16,
    /// Video only: adaptive stream the frame belongs to.
    pub adaptive_stream_index: u8,
    pub unit_prefix: Option<[u8; UNIT_PREFIX_LEN]>,
}

impl AvHeader {
    fn unit_word(&self) -> u32 {
        match self.stream {
            StreamKind::Video => {
                ((self.unit_index as u32 & 0x7FF) << 21)
                    | (((self.units_total as u32).wrapping_sub(1) & 0x7FF) << 10)
                    | (self.units_fec as u32 & 0x3FF)
            }
            StreamKind::Audio => {
                ((self.unit_index as u32 & 0xFF) << 24)
                    | (((self.units_total as u32).wrapping_sub(1) & 0xFF) << 16)
                    | ((self.audio_unit_size as u32) << 8)
                    | ((self.units_fec as u32 & 0x0F) << 4)
                    | (self.units_src as u32 & 0x0F)
            }
        }
    }

    /// Whether the unit at `unit_index` is a data shard.
    pub fn is_data(&self) -> bool {
        self.unit_index < self.units_src
    }

    /// Offset of the payload inside the datagram.
    pub fn payload_offset(&self) -> usize {
        AV_HEADER_LEN
            + self.stream.extension_len()
            + if self.unit_prefix.is_some() {
                UNIT_PREFIX_LEN
            } else {
                0
            }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPacket {
    pub header: AvHeader,
    pub payload: Bytes,
}

impl AvPacket {
    pub fn encode(&self) -> BytesMut {
        let h = &self.header;
        let mut buf = BytesMut::with_capacity(h.payload_offset() + self.payload.len());
        let mut first = h.stream.header_type() as u8;
        if h.unit_prefix.is_some() {
            first |= UNIT_PREFIX_FLAG;
        }
        buf.put_u8(first);
        buf.put_u16(h.packet_index);
        buf.put_u16(h.frame_index);
        buf.put_u32(h.unit_word());
        buf.put_u8(h.codec);
        buf.put_u32(h.gmac);
        buf.put_u32(h.key_pos);
        match h.stream {
            StreamKind::Video => {
                buf.put_u16(h.block_group);
                buf.put_u8(h.adaptive_stream_index << 5);
            }
            StreamKind::Audio => buf.put_u8(h.block_group as u8),
        }
        if let Some(prefix) = h.unit_prefix {
            buf.put_slice(&prefix);
        }
        buf.put_slice(&self.payload);
        buf
    }

    pub fn decode(buf: Bytes) -> Result<Self, PacketError> {
        need(&buf, AV_HEADER_LEN)?;
        let first = buf[0];
        let stream = match HeaderType::from_first_byte(first)? {
            HeaderType::Video => StreamKind::Video,
            HeaderType::Audio => StreamKind::Audio,
            _ => return Err(PacketError::UnknownHeaderType(first)),
        };
        let has_prefix = first & UNIT_PREFIX_FLAG != 0;

        let mut cur = &buf[1..];
        let packet_index = cur.get_u16();
        let frame_index = cur.get_u16();
        let word = cur.get_u32();
        let codec = cur.get_u8();
        let gmac = cur.get_u32();
        let key_pos = cur.get_u32();

        let ext_len = stream.extension_len();
        let prefix_len = if has_prefix { UNIT_PREFIX_LEN } else { 0 };
        need(&buf, AV_HEADER_LEN + ext_len + prefix_len)?;

        let mut ext = &buf[AV_HEADER_LEN..];
        let (block_group, adaptive_stream_index) = match stream {
            StreamKind::Video => (ext.get_u16(), ext.get_u8() >> 5),
            StreamKind::Audio => (ext.get_u8() as u16, 0),
        };
        let unit_prefix = if has_prefix {
            let mut p = [0u8; UNIT_PREFIX_LEN];
            p.copy_from_slice(&ext[..UNIT_PREFIX_LEN]);
            Some(p)
        } else {
            None
        };

        let (unit_index, units_total, units_fec, units_src, audio_unit_size) = match stream {
            StreamKind::Video => {
                let unit = ((word >> 21) & 0x7FF) as u16;
                let total = (((word >> 10) & 0x7FF) + 1) as u16;
                let fec = (word & 0x3FF) as u16;
                if fec >= total {
                    return Err(PacketError::InvalidUnits("parity count covers every unit"));
                }
                (unit, total, fec, total - fec, 0)
            }
            StreamKind::Audio => {
                let unit = ((word >> 24) & 0xFF) as u16;
                let total = (((word >> 16) & 0xFF) + 1) as u16;
                let size = ((word >> 8) & 0xFF) as u8;
                let fec = ((word >> 4) & 0x0F) as u16;
                let src = (word & 0x0F) as u16;
                if src == 0 || src + fec != total {
                    return Err(PacketError::InvalidUnits("audio source + parity != total"));
                }
                (unit, total, fec, src, size)
            }
        };
        if unit_index >= units_total {
            return Err(PacketError::InvalidUnits("unit index beyond total"));
        }

        let header = AvHeader {
            stream,
            packet_index,
            frame_index,
            unit_index,
            units_total,
            units_fec,
            units_src,
            audio_unit_size,
            codec,
            gmac,
            key_pos,
            block_group,
            adaptive_stream_index,
            unit_prefix,
        };
        let payload = buf.slice(header.payload_offset()..);
        Ok(AvPacket { header, payload })
    }
}

// ─── Datagram ───────────────────────────────────────────────────────────────

/// Any datagram received on the stream socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Control(ControlPacket),
    Congestion(CongestionPacket),
    Av(AvPacket),
}

impl Datagram {
    pub fn decode(buf: Bytes) -> Result<Self, PacketError> {
        need(&buf, 1)?;
        match HeaderType::from_first_byte(buf[0])? {
            HeaderType::Control => ControlPacket::decode(buf).map(Datagram::Control),
            HeaderType::Congestion => CongestionPacket::decode(buf).map(Datagram::Congestion),
            HeaderType::Video | HeaderType::Audio => AvPacket::decode(buf).map(Datagram::Av),
        }
    }
}
