// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Ring publish/read latency benchmarks.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use tensorpool::ring::{PoolRegion, RingConsumer, RingProducer};
use tensorpool::shm::{
    AccessMode, AllowedRoots, DType, MajorOrder, ProgressUnit, RegionType, ShmRegion, ShmUri,
    Superblock, TensorHeader, HEADER_SLOT_BYTES, LAYOUT_VERSION, SUPERBLOCK_BYTES,
};

const NSLOTS: u32 = 256;
const STRIDE: u32 = 4096;

fn write_region(dir: &std::path::Path, name: &str, region_type: RegionType, pool_id: u16) {
    let body = match region_type {
        RegionType::HeaderRing => NSLOTS as usize * HEADER_SLOT_BYTES,
        RegionType::PayloadPool => NSLOTS as usize * STRIDE as usize,
    };
    let mut buf = vec![0u8; SUPERBLOCK_BYTES + body];
    Superblock {
        layout_version: LAYOUT_VERSION,
        region_type,
        stream_id: 1,
        pool_id,
        epoch: 1,
        nslots: NSLOTS,
        slot_bytes: HEADER_SLOT_BYTES as u32,
        stride_bytes: if region_type == RegionType::PayloadPool {
            STRIDE
        } else {
            0
        },
        producer_pid: std::process::id() as u64,
        start_timestamp_ns: 0,
        last_activity_ns: 0,
    }
    .encode(&mut buf)
    .expect("encode failed");
    std::fs::write(dir.join(name), &buf).expect("write failed");
}

fn open(dir: &std::path::Path, mode: AccessMode) -> (ShmRegion, PoolRegion) {
    let roots = AllowedRoots::new(vec![dir.to_path_buf()]);
    let header = ShmRegion::open(
        &ShmUri {
            path: dir.join("header.ring"),
            require_hugepages: false,
        },
        &roots,
        mode,
    )
    .expect("header open failed");
    let pool = ShmRegion::open(
        &ShmUri {
            path: dir.join("1.pool"),
            require_hugepages: false,
        },
        &roots,
        mode,
    )
    .expect("pool open failed");
    (
        header,
        PoolRegion {
            pool_id: 1,
            stride_bytes: STRIDE,
            nslots: NSLOTS,
            region: pool,
        },
    )
}

fn tensor() -> TensorHeader {
    let mut t = TensorHeader {
        dtype: DType::Float32,
        major_order: MajorOrder::RowMajor,
        ndims: 1,
        progress_unit: ProgressUnit::Bytes,
        ..TensorHeader::default()
    };
    t.dims[0] = 16;
    t
}

fn bench_ring(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir failed");
    write_region(dir.path(), "header.ring", RegionType::HeaderRing, 0);
    write_region(dir.path(), "1.pool", RegionType::PayloadPool, 1);

    let (header, pool) = open(dir.path(), AccessMode::ReadWrite);
    let mut producer = RingProducer::new(header, vec![pool], NSLOTS).expect("producer failed");
    let (rh, rp) = open(dir.path(), AccessMode::ReadOnly);
    let consumer = RingConsumer::new(rh, vec![rp], NSLOTS).expect("consumer failed");

    let tensor = tensor();
    let payload = vec![0u8; 64];

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("publish_64b", |b| {
        b.iter(|| {
            producer
                .publish(&tensor, 0, 0, 1, &payload)
                .expect("publish failed")
        });
    });

    let last = producer.next_seq() - 1;
    let mut out = Vec::with_capacity(payload.len());
    group.bench_function("read_64b", |b| {
        b.iter(|| consumer.read_frame(last, &mut out).expect("read failed"));
    });

    group.finish();
}

criterion_group!(benches, bench_ring);
criterion_main!(benches);
