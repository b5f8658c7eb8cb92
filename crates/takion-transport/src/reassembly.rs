//! # Reassembly Buffer
//!
//! Pure logic, no I/O. Collects AV shards into block groups, runs FEC when a
//! group has lost data shards, and hands completed frames to the consumer.
//!
//! ## Responsibilities
//!
//! 1. **Grouping**: shards are keyed per stream by `(frame_index, block_group)`
//! 2. **Resolution**: the first time a group holds `k` shards it is assembled,
//!    through the FEC decoder when data shards are missing
//! 3. **Ordering**: frames leave in non-decreasing frame-index order per
//!    stream; a delivery watermark rejects shards for anything at or below it
//! 4. **Retention**: groups that fall too far behind the newest frame, or that
//!    a later frame overtakes, are retired as unrecoverable
//!
//! Retired groups are queued and must be drained with
//! [`ReassemblyBuffer::drain_retired`] *before* delivering the frame returned
//! by the same [`ReassemblyBuffer::accept`] call; they always precede it.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

use crate::codec::{aligned_shard_size, FecDecoder, FecError, FEC_MAX_SHARDS};
use crate::packet::StreamKind;
use crate::stats::ReassemblyStats;

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Frames a group may trail the newest frame before it is retired.
    pub retention_frames: u32,
    /// Open groups per stream before the oldest is retired.
    pub max_open_groups: usize,
    /// Emit unrecoverable groups as lossy frames instead of suppressing them.
    pub deliver_lossy: bool,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            retention_frames: 8,
            max_open_groups: 64,
            deliver_lossy: true,
        }
    }
}

// ─── Shards & Frames ────────────────────────────────────────────────────────

/// One decrypted AV unit belonging to a block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamShard {
    pub stream: StreamKind,
    /// Frame index, unwrapped to 32 bits by the session.
    pub frame_index: u32,
    pub block_group: u16,
    /// Position in the group: `0..k` data, `k..k + m` parity.
    pub shard_index: u16,
    /// Data shards in the group.
    pub k: u16,
    /// Parity shards in the group.
    pub m: u16,
    /// Per-stream datagram counter the shard arrived with.
    pub packet_index: u16,
    pub data: Bytes,
}

impl StreamShard {
    pub fn is_data(&self) -> bool {
        self.shard_index < self.k
    }

    fn key(&self) -> GroupKey {
        (self.frame_index, self.block_group)
    }
}

/// A block group's data shards concatenated in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub frame_index: u32,
    pub block_group: u16,
    pub data: Bytes,
    /// Some data shards are missing from `data`.
    pub lossy: bool,
    /// FEC rebuilt at least one data shard.
    pub recovered: bool,
    /// Indices of the data shards FEC rebuilt.
    pub recovered_shards: Vec<u16>,
}

impl Frame {
    /// Every data shard is present, received or rebuilt.
    pub fn is_complete(&self) -> bool {
        !self.lossy
    }
}

/// Why a block group left the buffer without resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Reached `k` shards but the decoder could not rebuild it.
    DecodeFailed,
    /// Fell behind the newest frame by more than the retention window.
    Expired,
    /// A later group of the same stream was delivered first.
    Superseded,
    /// Evicted to stay under the open-group limit.
    Overflow,
    /// Flushed on shutdown.
    Flushed,
}

/// Report of a block group retired as unrecoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredGroup {
    pub stream: StreamKind,
    pub frame_index: u32,
    pub block_group: u16,
    pub k: u16,
    pub m: u16,
    /// Shards that arrived.
    pub received: usize,
    pub reason: RetireReason,
    pub error: Option<FecError>,
    /// The lossy frame, when lossy delivery is enabled.
    pub frame: Option<Frame>,
}

// ─── Block Group ────────────────────────────────────────────────────────────

type GroupKey = (u32, u16);

#[derive(Debug)]
struct BlockGroup {
    k: u16,
    m: u16,
    shards: Vec<Option<Bytes>>,
    received: usize,
    /// Longest shard seen, parity included. Sets the FEC shard size.
    max_len: usize,
    /// Longest data shard seen; recovered shards are cut to this length.
    max_data_len: usize,
}

impl BlockGroup {
    fn new(k: u16, m: u16) -> Self {
        BlockGroup {
            k,
            m,
            shards: vec![None; (k + m) as usize],
            received: 0,
            max_len: 0,
            max_data_len: 0,
        }
    }

    fn data_missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.k as usize).filter(|&i| self.shards[i].is_none())
    }

    /// Concatenate the data shards that are present.
    fn concat_present(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.k as usize * self.max_len);
        for shard in self.shards[..self.k as usize].iter().flatten() {
            out.extend_from_slice(shard);
        }
        out.freeze()
    }

    /// Rebuild missing data shards. Returns the frame payload and the indices
    /// that were rebuilt.
    fn decode(&self, decoder: &mut FecDecoder) -> Result<(Bytes, Vec<u16>), FecError> {
        let k = self.k as usize;
        let m = self.m as usize;
        let size = aligned_shard_size(self.max_len);
        let cut = if self.max_data_len > 0 {
            self.max_data_len
        } else {
            self.max_len
        };

        let mut buf = vec![0u8; (k + m) * size];
        let mut erasures = Vec::new();
        for (i, shard) in self.shards.iter().enumerate() {
            match shard {
                Some(data) => buf[i * size..i * size + data.len()].copy_from_slice(data),
                None => erasures.push(i),
            }
        }

        let decoded = decoder.decode(k, m, size, &buf, &erasures)?;
        let mut out = BytesMut::with_capacity(k * cut);
        let mut rebuilt = Vec::new();
        for i in 0..k {
            match &self.shards[i] {
                Some(data) => out.extend_from_slice(data),
                None => {
                    out.extend_from_slice(&decoded[i * size..i * size + cut]);
                    rebuilt.push(i as u16);
                }
            }
        }
        Ok((out.freeze(), rebuilt))
    }
}

#[derive(Debug, Default)]
struct StreamState {
    groups: BTreeMap<GroupKey, BlockGroup>,
    /// Highest key delivered or retired.
    watermark: Option<GroupKey>,
    newest_frame: Option<u32>,
}

impl StreamState {
    fn is_behind_watermark(&self, key: GroupKey) -> bool {
        matches!(self.watermark, Some(w) if key <= w)
    }

    fn advance_watermark(&mut self, key: GroupKey) {
        if !self.is_behind_watermark(key) {
            self.watermark = Some(key);
        }
    }
}

// ─── Reassembly Buffer ──────────────────────────────────────────────────────

/// Per-stream block-group table plus the FEC decoder that resolves it.
pub struct ReassemblyBuffer {
    config: ReassemblyConfig,
    decoder: FecDecoder,
    streams: HashMap<StreamKind, StreamState>,
    retired: Vec<RetiredGroup>,
    stats: ReassemblyStats,
}

impl ReassemblyBuffer {
    pub fn new(config: ReassemblyConfig) -> Self {
        ReassemblyBuffer {
            config,
            decoder: FecDecoder::new(),
            streams: HashMap::new(),
            retired: Vec::new(),
            stats: ReassemblyStats::default(),
        }
    }

    /// Record a shard. Returns the frame its group resolved into, if any.
    pub fn accept(&mut self, shard: StreamShard) -> Option<Frame> {
        let total = shard.k as usize + shard.m as usize;
        if shard.k == 0 || total > FEC_MAX_SHARDS || shard.shard_index as usize >= total {
            self.stats.malformed_shards += 1;
            return None;
        }

        let key = shard.key();
        let stream = shard.stream;
        let state = self.streams.entry(stream).or_default();
        if state.is_behind_watermark(key) {
            self.stats.late_shards += 1;
            trace!(?stream, frame_index = key.0, "shard for retired group");
            return None;
        }

        let newest = state.newest_frame.map_or(key.0, |n| n.max(key.0));
        state.newest_frame = Some(newest);
        if newest - key.0 > self.config.retention_frames {
            self.stats.late_shards += 1;
            return None;
        }
        self.expire(stream, newest);

        if !self.ensure_capacity(stream, key) {
            self.stats.late_shards += 1;
            return None;
        }

        let state = self.streams.entry(stream).or_default();
        let group = state
            .groups
            .entry(key)
            .or_insert_with(|| BlockGroup::new(shard.k, shard.m));
        if group.k != shard.k || group.m != shard.m {
            self.stats.malformed_shards += 1;
            return None;
        }
        let slot = &mut group.shards[shard.shard_index as usize];
        if slot.is_some() {
            self.stats.duplicates += 1;
            return None;
        }
        group.max_len = group.max_len.max(shard.data.len());
        if shard.shard_index < shard.k {
            group.max_data_len = group.max_data_len.max(shard.data.len());
        }
        *slot = Some(shard.data);
        group.received += 1;
        self.stats.shards_accepted += 1;

        if group.received < group.k as usize {
            return None;
        }
        self.resolve(stream, key)
    }

    /// Take the groups retired since the last call, oldest first.
    pub fn drain_retired(&mut self) -> Vec<RetiredGroup> {
        std::mem::take(&mut self.retired)
    }

    /// Retire every open group, e.g. on shutdown.
    pub fn flush(&mut self) {
        let streams: Vec<StreamKind> = self.streams.keys().copied().collect();
        for stream in streams {
            let keys: Vec<GroupKey> = self.open_keys(stream, |_| true);
            for key in keys {
                self.retire(stream, key, RetireReason::Flushed, None);
            }
        }
    }

    /// Open groups across all streams.
    pub fn open_groups(&self) -> usize {
        self.streams.values().map(|s| s.groups.len()).sum()
    }

    /// Frame index of the highest group delivered or retired for `stream`.
    pub fn watermark(&self, stream: StreamKind) -> Option<u32> {
        self.streams
            .get(&stream)
            .and_then(|s| s.watermark)
            .map(|(frame, _)| frame)
    }

    pub fn stats(&self) -> ReassemblyStats {
        let mut stats = self.stats.clone();
        stats.open_groups = self.open_groups() as u64;
        stats
    }

    // ─── Internals ──────────────────────────────────────────────────────

    /// Assemble a group that just reached `k` shards.
    fn resolve(&mut self, stream: StreamKind, key: GroupKey) -> Option<Frame> {
        let group = self.streams.get_mut(&stream)?.groups.remove(&key)?;

        let frame = if group.data_missing().next().is_none() {
            self.stats.frames_complete += 1;
            Frame {
                stream,
                frame_index: key.0,
                block_group: key.1,
                data: group.concat_present(),
                lossy: false,
                recovered: false,
                recovered_shards: Vec::new(),
            }
        } else {
            match group.decode(&mut self.decoder) {
                Ok((data, rebuilt)) => {
                    debug!(
                        ?stream,
                        frame_index = key.0,
                        block_group = key.1,
                        rebuilt = rebuilt.len(),
                        "FEC recovered block group"
                    );
                    self.stats.frames_recovered += 1;
                    self.stats.shards_recovered += rebuilt.len() as u64;
                    Frame {
                        stream,
                        frame_index: key.0,
                        block_group: key.1,
                        data,
                        lossy: false,
                        recovered: true,
                        recovered_shards: rebuilt,
                    }
                }
                Err(err) => {
                    self.stats.fec_failures += 1;
                    // Put it back so retirement sees the shards it held.
                    if let Some(state) = self.streams.get_mut(&stream) {
                        state.groups.insert(key, group);
                    }
                    self.retire_older(stream, key);
                    self.retire(stream, key, RetireReason::DecodeFailed, Some(err));
                    return None;
                }
            }
        };

        self.retire_older(stream, key);
        if let Some(state) = self.streams.get_mut(&stream) {
            state.advance_watermark(key);
        }
        Some(frame)
    }

    /// Retire open groups of `stream` ordered before `key`.
    fn retire_older(&mut self, stream: StreamKind, key: GroupKey) {
        for older in self.open_keys(stream, |k| k < key) {
            self.retire(stream, older, RetireReason::Superseded, None);
        }
    }

    /// Retire groups that trail `newest` by more than the retention window.
    fn expire(&mut self, stream: StreamKind, newest: u32) {
        let retention = self.config.retention_frames;
        for key in self.open_keys(stream, |k| newest - k.0 > retention) {
            self.retire(stream, key, RetireReason::Expired, None);
        }
    }

    /// Make room for `key`. Returns false when `key` itself would be the
    /// group evicted.
    fn ensure_capacity(&mut self, stream: StreamKind, key: GroupKey) -> bool {
        let limit = self.config.max_open_groups.max(1);
        loop {
            let Some(state) = self.streams.get(&stream) else {
                return true;
            };
            if state.groups.contains_key(&key) || state.groups.len() < limit {
                return true;
            }
            let Some((&oldest, _)) = state.groups.first_key_value() else {
                return true;
            };
            if key < oldest {
                return false;
            }
            self.retire(stream, oldest, RetireReason::Overflow, None);
        }
    }

    fn open_keys(&self, stream: StreamKind, filter: impl Fn(GroupKey) -> bool) -> Vec<GroupKey> {
        self.streams
            .get(&stream)
            .map(|s| s.groups.keys().copied().filter(|&k| filter(k)).collect())
            .unwrap_or_default()
    }

    fn retire(
        &mut self,
        stream: StreamKind,
        key: GroupKey,
        reason: RetireReason,
        error: Option<FecError>,
    ) {
        let Some(state) = self.streams.get_mut(&stream) else {
            return;
        };
        let Some(group) = state.groups.remove(&key) else {
            return;
        };
        state.advance_watermark(key);

        let missing = group.shards.len() - group.received;
        let error = error.or_else(|| {
            (group.m > 0 && missing > group.m as usize).then_some(FecError::Unrecoverable {
                missing,
                parity: group.m as usize,
            })
        });
        self.stats.groups_retired += 1;
        self.stats.frames_lossy += 1;
        debug!(
            ?stream,
            frame_index = key.0,
            block_group = key.1,
            received = group.received,
            k = group.k,
            m = group.m,
            ?reason,
            "retired unrecoverable block group"
        );

        let frame = self.config.deliver_lossy.then(|| Frame {
            stream,
            frame_index: key.0,
            block_group: key.1,
            data: group.concat_present(),
            lossy: true,
            recovered: false,
            recovered_shards: Vec::new(),
        });
        self.retired.push(RetiredGroup {
            stream,
            frame_index: key.0,
            block_group: key.1,
            k: group.k,
            m: group.m,
            received: group.received,
            reason,
            error,
            frame,
        });
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}
