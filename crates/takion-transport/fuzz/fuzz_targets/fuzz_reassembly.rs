#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use takion_transport::packet::StreamKind;
use takion_transport::reassembly::{ReassemblyBuffer, ReassemblyConfig, StreamShard};

/// Fuzz the reassembly buffer with arbitrary shard sequences.
///
/// Every 8 input bytes describe one shard. Frames must come out in
/// non-decreasing order per stream whatever the input.
fuzz_target!(|data: &[u8]| {
    let mut buffer = ReassemblyBuffer::new(ReassemblyConfig {
        retention_frames: 4,
        max_open_groups: 8,
        deliver_lossy: true,
    });
    let mut last = [None::<u32>; 2];

    for chunk in data.chunks_exact(8) {
        let stream = if chunk[0] & 1 == 0 {
            StreamKind::Video
        } else {
            StreamKind::Audio
        };
        let shard = StreamShard {
            stream,
            frame_index: (chunk[1] % 32) as u32,
            block_group: (chunk[2] % 2) as u16,
            shard_index: (chunk[3] % 12) as u16,
            k: (chunk[4] % 10) as u16,
            m: (chunk[5] % 4) as u16,
            packet_index: u16::from_le_bytes([chunk[6], chunk[7]]),
            data: Bytes::from(vec![chunk[7]; 1 + chunk[6] as usize % 64]),
        };
        let frame = buffer.accept(shard);
        let retired = buffer.drain_retired();
        let delivered = retired
            .iter()
            .filter_map(|g| g.frame.as_ref())
            .chain(frame.as_ref());
        for f in delivered {
            let slot = &mut last[f.stream as usize];
            if let Some(prev) = *slot {
                assert!(f.frame_index >= prev, "frame {} after {}", f.frame_index, prev);
            }
            *slot = Some(f.frame_index);
        }
    }
    buffer.flush();
    let _ = buffer.drain_retired();
});
