//! Property-based tests for block-group reassembly.
//!
//! Shards of several frames arrive shuffled and with losses. Whatever the
//! arrival order, frames leave the buffer in increasing order, each group at
//! most once, and every frame reported complete carries the original bytes.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use proptest::prelude::*;
use takion_transport::codec::FecEncoder;
use takion_transport::packet::StreamKind;
use takion_transport::reassembly::{Frame, ReassemblyBuffer, ReassemblyConfig, StreamShard};

const SHARD: usize = 64;

struct Group {
    data: Vec<u8>,
    shards: Vec<StreamShard>,
}

fn make_group(stream: StreamKind, frame_index: u32, k: u16, m: u16) -> Group {
    let data: Vec<u8> = (0..k as usize * SHARD)
        .map(|i| (i as u32).wrapping_mul(7).wrapping_add(frame_index * 31) as u8)
        .collect();
    let parity = FecEncoder::new()
        .encode(k as usize, m as usize, SHARD, &data)
        .unwrap();
    let shards = data
        .chunks(SHARD)
        .chain(parity.chunks(SHARD))
        .enumerate()
        .map(|(i, chunk)| StreamShard {
            stream,
            frame_index,
            block_group: 0,
            shard_index: i as u16,
            k,
            m,
            packet_index: (frame_index as u16).wrapping_mul(32).wrapping_add(i as u16),
            data: Bytes::copy_from_slice(chunk),
        })
        .collect();
    Group { data, shards }
}

/// Drive the buffer the way the FEC worker does: retired groups first, then
/// the frame from the same call.
fn run(buf: &mut ReassemblyBuffer, shards: Vec<StreamShard>) -> Vec<Frame> {
    let mut out = Vec::new();
    for shard in shards {
        let frame = buf.accept(shard);
        out.extend(buf.drain_retired().into_iter().filter_map(|r| r.frame));
        out.extend(frame);
    }
    buf.flush();
    out.extend(buf.drain_retired().into_iter().filter_map(|r| r.frame));
    out
}

fn config() -> ReassemblyConfig {
    ReassemblyConfig {
        retention_frames: 64,
        max_open_groups: 64,
        deliver_lossy: true,
    }
}

/// `(k, m, frames, keep mask, arrival order)`.
fn scenario() -> impl Strategy<Value = (u16, u16, u32, Vec<bool>, Vec<usize>)> {
    (2u16..=8, 1u16..=3, 1u32..=6).prop_flat_map(|(k, m, frames)| {
        let total = (k + m) as usize * frames as usize;
        (
            Just(k),
            Just(m),
            Just(frames),
            proptest::collection::vec(prop::bool::weighted(0.85), total),
            Just((0..total).collect::<Vec<usize>>()).prop_shuffle(),
        )
    })
}

proptest! {
    #[test]
    fn delivery_order_is_monotonic(
        (k, m, frames, keep, order) in scenario(),
    ) {
        let groups: Vec<Group> = (0..frames)
            .map(|f| make_group(StreamKind::Video, f, k, m))
            .collect();
        let all: Vec<StreamShard> = groups.iter().flat_map(|g| g.shards.clone()).collect();
        let arrivals: Vec<StreamShard> = order
            .into_iter()
            .filter(|&i| keep[i])
            .map(|i| all[i].clone())
            .collect();

        let mut buf = ReassemblyBuffer::new(config());
        let delivered = run(&mut buf, arrivals);

        let mut seen = HashSet::new();
        let mut last: Option<(u32, u16)> = None;
        for frame in &delivered {
            let key = (frame.frame_index, frame.block_group);
            prop_assert!(seen.insert(key), "group {:?} delivered twice", key);
            if let Some(prev) = last {
                prop_assert!(key > prev, "{:?} delivered after {:?}", key, prev);
            }
            last = Some(key);

            if frame.is_complete() {
                prop_assert_eq!(&frame.data[..], &groups[frame.frame_index as usize].data[..]);
            }
        }
        prop_assert_eq!(buf.open_groups(), 0);
    }

    /// In-order arrival with at most `m` losses per group never loses a frame.
    #[test]
    fn in_order_arrival_recovers_everything(
        (k, m, frames, _keep, _order) in scenario(),
        drops in proptest::collection::vec(any::<prop::sample::Index>(), 0..=3),
    ) {
        let mut arrivals = Vec::new();
        let mut groups = BTreeMap::new();
        for f in 0..frames {
            let group = make_group(StreamKind::Audio, f, k, m);
            let total = group.shards.len();
            let dropped: HashSet<usize> = drops
                .iter()
                .take(m as usize)
                .map(|ix| ix.index(total))
                .collect();
            arrivals.extend(
                group
                    .shards
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !dropped.contains(i))
                    .map(|(_, s)| s.clone()),
            );
            groups.insert(f, group.data);
        }

        let mut buf = ReassemblyBuffer::new(config());
        let delivered = run(&mut buf, arrivals);
        prop_assert_eq!(delivered.len(), frames as usize);
        for frame in delivered {
            prop_assert!(frame.is_complete());
            prop_assert_eq!(&frame.data[..], &groups[&frame.frame_index][..]);
        }
    }

    /// Streams are independent: interleaving audio and video changes nothing
    /// about either stream's output.
    #[test]
    fn streams_do_not_interfere(
        k in 2u16..=6,
        m in 1u16..=2,
        order in Just((0..32usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let video = make_group(StreamKind::Video, 0, k, m);
        let audio = make_group(StreamKind::Audio, 0, k, m);
        let mut all: Vec<StreamShard> = video.shards.clone();
        all.extend(audio.shards.clone());
        let arrivals: Vec<StreamShard> = order
            .into_iter()
            .filter(|&i| i < all.len())
            .map(|i| all[i].clone())
            .collect();

        let mut buf = ReassemblyBuffer::new(config());
        let delivered = run(&mut buf, arrivals);
        prop_assert_eq!(delivered.len(), 2);
        for frame in delivered {
            let expected = match frame.stream {
                StreamKind::Video => &video.data,
                StreamKind::Audio => &audio.data,
            };
            prop_assert!(frame.is_complete());
            prop_assert_eq!(&frame.data[..], &expected[..]);
        }
    }
}
