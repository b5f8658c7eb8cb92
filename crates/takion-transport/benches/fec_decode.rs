//! Receive-path benchmarks for takion-transport.
//!
//! Measures the per-datagram and per-group costs on the AV path:
//! - Cauchy FEC decode for typical video block groups and erasure counts
//! - Datagram authentication and payload decryption
//! - Full block-group reassembly with one lost shard
//!
//! Run with: cargo bench --package takion-transport

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use takion_transport::codec::{FecDecoder, FecEncoder};
use takion_transport::crypto::{derive_session, CryptoContext, EcdhKeypair, Role};
use takion_transport::packet::{AvHeader, AvPacket, StreamKind};
use takion_transport::reassembly::{ReassemblyBuffer, StreamShard};

const SHARD: usize = 1_408;

fn block(k: usize, m: usize) -> (Vec<u8>, Vec<u8>) {
    let data: Vec<u8> = (0..k * SHARD).map(|i| (i * 7 + 3) as u8).collect();
    let parity = FecEncoder::new().encode(k, m, SHARD, &data).unwrap();
    let mut shards = data.clone();
    shards.extend_from_slice(&parity);
    (data, shards)
}

// ─── FEC ─────────────────────────────────────────────────────────────────

fn bench_fec_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_decode");

    for &(k, m) in &[(10usize, 2usize), (20, 4), (40, 8)] {
        let (_, shards) = block(k, m);
        group.throughput(Throughput::Bytes((k * SHARD) as u64));

        for lost in [1usize, m] {
            let erasures: Vec<usize> = (0..lost).map(|i| i * (k / lost)).collect();
            let mut decoder = FecDecoder::new();
            group.bench_with_input(
                BenchmarkId::new(format!("k{k}_m{m}"), format!("{lost}_lost")),
                &erasures,
                |b, erasures| {
                    b.iter(|| {
                        let out = decoder
                            .decode(k, m, SHARD, black_box(&shards), erasures)
                            .unwrap();
                        black_box(out);
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_fec_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_encode");
    let (data, _) = block(10, 2);
    group.throughput(Throughput::Bytes(data.len() as u64));
    let mut encoder = FecEncoder::new();
    group.bench_function("k10_m2", |b| {
        b.iter(|| black_box(encoder.encode(10, 2, SHARD, black_box(&data)).unwrap()));
    });
    group.finish();
}

// ─── Crypto ──────────────────────────────────────────────────────────────

fn contexts() -> (CryptoContext, CryptoContext) {
    let client = EcdhKeypair::generate();
    let console = EcdhKeypair::with_handshake_key(*client.handshake_key());
    let client_key =
        derive_session(&client, &console.public_key(), &console.public_sig().unwrap()).unwrap();
    let console_key =
        derive_session(&console, &client.public_key(), &client.public_sig().unwrap()).unwrap();
    let window = CryptoContext::DEFAULT_REPLAY_WINDOW;
    (
        CryptoContext::new(&client_key, Role::Client, window).unwrap(),
        CryptoContext::new(&console_key, Role::Console, window).unwrap(),
    )
}

fn av_datagram(index: u16, payload: &[u8]) -> (BytesMut, usize) {
    let header = AvHeader {
        stream: StreamKind::Video,
        packet_index: index,
        frame_index: 0,
        unit_index: 0,
        units_total: 12,
        units_fec: 2,
        units_src: 10,
        audio_unit_size: 0,
        codec: 6,
        gmac: 0,
        key_pos: 0,
        block_group: 0,
        adaptive_stream_index: 0,
        unit_prefix: None,
    };
    let packet = AvPacket {
        header,
        payload: Bytes::copy_from_slice(payload),
    };
    (packet.encode(), header.payload_offset())
}

fn bench_datagram_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("datagram_open");
    let payload = vec![0x5Au8; SHARD];
    group.throughput(Throughput::Bytes(SHARD as u64));

    group.bench_function("av_1408", |b| {
        let (mut client, mut console) = contexts();
        let mut index = 0u16;
        b.iter_batched(
            || {
                let (mut buf, offset) = av_datagram(index, &payload);
                index = index.wrapping_add(1);
                console.seal(&mut buf, Some(offset)).unwrap();
                (buf.freeze(), offset)
            },
            |(datagram, offset)| black_box(client.open(&datagram, Some(offset)).unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

// ─── Reassembly ──────────────────────────────────────────────────────────

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let (k, m) = (10u16, 2u16);
    let (data, shards) = block(k as usize, m as usize);
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("k10_m2_one_lost", |b| {
        let mut buffer = ReassemblyBuffer::default();
        let mut frame_index = 0u32;
        b.iter(|| {
            for (i, chunk) in shards.chunks(SHARD).enumerate() {
                if i == 3 {
                    continue;
                }
                let frame = buffer.accept(StreamShard {
                    stream: StreamKind::Video,
                    frame_index,
                    block_group: 0,
                    shard_index: i as u16,
                    k,
                    m,
                    packet_index: i as u16,
                    data: Bytes::copy_from_slice(chunk),
                });
                black_box(frame);
            }
            buffer.drain_retired();
            frame_index += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fec_decode,
    bench_fec_encode,
    bench_datagram_open,
    bench_reassembly,
);
criterion_main!(benches);
