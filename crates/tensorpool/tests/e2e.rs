// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! End-to-end publish/consume over a real driver, loopback bus, and
//! tempdir-backed ring files.

use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use tensorpool::agent::{AgentRunner, IdleStrategy};
use tensorpool::client::{
    Client, Consumer, ConsumerContext, FrameMetadata, Producer, ProducerContext, ProgressPoller,
};
use tensorpool::clock::MonotonicClock;
use tensorpool::codec::{FrameProgress, ProgressState};
use tensorpool::config::{ClientConfig, DriverConfig, PoolProfile, StreamProfile};
use tensorpool::driver::Driver;
use tensorpool::shm::{DType, MajorOrder, ProgressUnit, TensorHeader};
use tensorpool::transport::{LoopbackBus, MessageTransport};
use tensorpool::TpError;

const ATTACH_TIMEOUT_NS: u64 = 5_000_000_000;

struct Fabric {
    bus: LoopbackBus,
    client: Arc<Client>,
    driver: Arc<Mutex<Driver>>,
    _driver_agent: AgentRunner,
    _dir: TempDir,
}

fn fabric(tweak: impl FnOnce(&mut DriverConfig)) -> Fabric {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let bus = LoopbackBus::new();
    let clock: Arc<dyn tensorpool::clock::Clock> = Arc::new(MonotonicClock);

    let mut driver_config = DriverConfig {
        shm_base_dir: dir.path().to_path_buf(),
        profiles: vec![StreamProfile {
            name: "tiny".to_string(),
            header_nslots: 4,
            pools: vec![PoolProfile {
                pool_id: 1,
                stride_bytes: 64,
            }],
        }],
        default_profile: "tiny".to_string(),
        ..DriverConfig::default()
    };
    tweak(&mut driver_config);

    let driver = Arc::new(Mutex::new(
        Driver::new(driver_config, &bus, Arc::clone(&clock)).expect("driver failed"),
    ));
    let agent_driver = Arc::clone(&driver);
    let driver_agent = AgentRunner::start("e2e-driver", IdleStrategy::Yielding, move || {
        agent_driver.lock().do_work()
    })
    .expect("agent failed");

    let client_config = ClientConfig {
        allowed_roots: vec![dir.path().to_path_buf()],
        ..ClientConfig::default()
    };
    let client = Client::new(client_config, Arc::new(bus.clone()), clock);

    Fabric {
        bus,
        client,
        driver,
        _driver_agent: driver_agent,
        _dir: dir,
    }
}

fn f32_frame() -> (TensorHeader, Vec<u8>) {
    let mut tensor = TensorHeader {
        dtype: DType::Float32,
        major_order: MajorOrder::RowMajor,
        ndims: 2,
        progress_unit: ProgressUnit::Bytes,
        ..TensorHeader::default()
    };
    tensor.dims[0] = 2;
    tensor.dims[1] = 2;
    let payload: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
        .iter()
        .flat_map(|f| f.to_le_bytes())
        .collect();
    (tensor, payload)
}

#[test]
fn test_publish_consume_one_frame() {
    let f = fabric(|_| {});

    let mut producer = Producer::new(
        Arc::clone(&f.client),
        ProducerContext::new(0, 100),
    )
    .expect("producer failed");
    let info = producer.attach(ATTACH_TIMEOUT_NS).expect("attach failed");
    let stream_id = info.stream_id;

    let mut consumer = Consumer::new(
        Arc::clone(&f.client),
        ConsumerContext::new(stream_id, 200, 1),
    )
    .expect("consumer failed");
    consumer.attach(ATTACH_TIMEOUT_NS).expect("attach failed");

    let (tensor, payload) = f32_frame();
    let seq = producer
        .offer_frame(&tensor, &payload, &FrameMetadata::default())
        .expect("offer failed");
    assert_eq!(seq, 1);

    let mut seen = Vec::new();
    consumer.poll_descriptors(&mut |d| seen.push(d.clone()), 10);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].seq, 1);
    assert_eq!(seen[0].stream_id, stream_id);
    assert_eq!(seen[0].values_len_bytes, 16);

    let mut out = Vec::new();
    let header = consumer.read_frame(seen[0].seq, &mut out).expect("read failed");
    assert_eq!(out, payload, "payload must be bit-exact");
    assert_eq!(header.tensor.dtype, DType::Float32);
    assert_eq!(header.tensor.major_order, MajorOrder::RowMajor);
    assert_eq!(header.tensor.ndims, 2);
    assert_eq!(header.tensor.dims[0], 2);
    assert_eq!(header.tensor.dims[1], 2);
    assert_eq!(consumer.frames_read(), 1);
}

#[test]
fn test_ring_rollover_late_read() {
    let f = fabric(|_| {});

    let mut producer = Producer::new(
        Arc::clone(&f.client),
        ProducerContext::new(0, 110),
    )
    .expect("producer failed");
    let stream_id = producer.attach(ATTACH_TIMEOUT_NS).expect("attach failed").stream_id;

    let mut consumer = Consumer::new(
        Arc::clone(&f.client),
        ConsumerContext::new(stream_id, 210, 2),
    )
    .expect("consumer failed");
    consumer.attach(ATTACH_TIMEOUT_NS).expect("attach failed");

    let (tensor, payload) = f32_frame();
    for _ in 0..32 {
        producer
            .offer_frame(&tensor, &payload, &FrameMetadata::default())
            .expect("offer failed");
    }

    // Every descriptor is delivered, in order.
    let mut seqs = Vec::new();
    while seqs.len() < 32 {
        let polled = consumer.poll_descriptors(&mut |d| seqs.push(d.seq), 64);
        if polled == 0 {
            break;
        }
    }
    assert_eq!(seqs, (1u64..=32).collect::<Vec<_>>());
    assert_eq!(consumer.drops_gap(), 0);

    // Reading the first sequence after the ring lapped it reports LATE.
    let mut out = Vec::new();
    match consumer.read_frame(1, &mut out) {
        Err(TpError::Late { want: 1, stored }) => assert!(stored > 1),
        other => panic!("expected late, got {other:?}"),
    }
    assert_eq!(consumer.drops_late(), 1);

    // The newest frame is still readable.
    consumer.read_frame(32, &mut out).expect("read failed");
    assert_eq!(out, payload);
}

#[test]
fn test_progress_flow_monotonic() {
    let f = fabric(|_| {});

    let mut producer = Producer::new(
        Arc::clone(&f.client),
        ProducerContext::new(0, 120),
    )
    .expect("producer failed");
    let info = producer.attach(ATTACH_TIMEOUT_NS).expect("attach failed");
    let stream_id = info.stream_id;
    let nslots = info.header_nslots;

    // Progress rides the descriptor channel; attach a validating poller.
    let channels = f.client.config().channels.clone();
    let progress_sub = f
        .client
        .add_subscription(
            &channels.descriptor.channel,
            channels.descriptor.stream_id,
            ATTACH_TIMEOUT_NS,
        )
        .expect("sub failed");
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let mut poller = ProgressPoller::new(
        progress_sub,
        stream_id,
        nslots,
        Box::new(move |p: &FrameProgress| seen_in.lock().push(p.payload_bytes_filled)),
    )
    .expect("poller failed");

    producer
        .send_progress(1, 0, ProgressState::Started)
        .expect("progress failed");
    producer
        .send_progress(1, 32, ProgressState::Progress)
        .expect("progress failed");
    producer
        .send_progress(1, 64, ProgressState::Complete)
        .expect("progress failed");
    poller.poll(32);

    assert_eq!(*seen.lock(), vec![0, 32, 64]);
    assert_eq!(poller.rejected(), 0);
}

#[test]
fn test_epochs_in_announces_strictly_increase() {
    let f = fabric(|c| c.announce_period_ms = 0);

    // Observe the announce channel directly.
    let channels = f.client.config().channels.clone();
    let announce_sub = f
        .bus
        .add_subscription(&channels.announce.channel, channels.announce.stream_id)
        .expect("add failed")
        .poll()
        .expect("poll failed")
        .expect("not immediate");

    let mut stream_id = 0u32;
    for i in 0..3 {
        let mut producer = Producer::new(
            Arc::clone(&f.client),
            ProducerContext::new(stream_id, 300 + i),
        )
        .expect("producer failed");
        stream_id = producer.attach(ATTACH_TIMEOUT_NS).expect("attach failed").stream_id;
        producer.close(ATTACH_TIMEOUT_NS).expect("close failed");
    }

    let mut assembler = tensorpool::transport::FragmentAssembler::new();
    let mut epochs = Vec::new();
    announce_sub.poll(
        &mut |flags, data| {
            assembler.on_fragment(flags, data, &mut |msg| {
                if let Ok(tensorpool::codec::Decoded::Message(
                    tensorpool::codec::Message::ShmPoolAnnounce(a),
                )) = tensorpool::codec::decode_message(msg)
                {
                    if a.stream_id == stream_id {
                        epochs.push(a.epoch);
                    }
                }
            });
        },
        1024,
    );

    assert!(epochs.len() >= 3, "expected several announces, got {epochs:?}");
    for pair in epochs.windows(2) {
        assert!(pair[0] < pair[1], "epochs must strictly increase: {epochs:?}");
    }

    // Keep the driver alive to the end of the scenario.
    drop(f.driver);
}
