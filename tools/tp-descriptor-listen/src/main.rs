// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Descriptor-channel listener.
//!
//! Hosts a loopback fabric with a demo producer publishing small f32
//! frames, taps the descriptor channel, and prints every descriptor and
//! progress report as one JSON line.
//!
//! Usage: `tp-descriptor-listen [--count N]`

use std::sync::Arc;

use tensorpool::agent::{AgentRunner, IdleStrategy};
use tensorpool::client::{Client, FrameMetadata, Producer, ProducerContext};
use tensorpool::clock::MonotonicClock;
use tensorpool::codec::{decode_message, Decoded, Message, ProgressState};
use tensorpool::config::{ClientConfig, DriverConfig};
use tensorpool::driver::Driver;
use tensorpool::shm::{DType, MajorOrder, ProgressUnit, TensorHeader};
use tensorpool::transport::{FragmentAssembler, LoopbackBus, MessageTransport};

fn main() -> tensorpool::Result<()> {
    let mut count = 32usize;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--count" {
            count = args.next().and_then(|v| v.parse().ok()).unwrap_or(count);
        }
    }

    let work_dir = std::env::temp_dir().join(format!("tp-desc-listen-{}", std::process::id()));
    std::fs::create_dir_all(&work_dir)?;

    let driver_config = DriverConfig {
        shm_base_dir: work_dir.clone(),
        ..DriverConfig::default()
    };
    let channels = driver_config.channels.clone();

    let bus = LoopbackBus::new();
    let clock: Arc<dyn tensorpool::clock::Clock> = Arc::new(MonotonicClock);
    let mut driver = Driver::new(driver_config, &bus, Arc::clone(&clock))?;
    let mut driver_agent = AgentRunner::start(
        "tp-driver",
        IdleStrategy::Sleeping { sleep_ns: 1_000_000 },
        move || driver.do_work(),
    )?;

    let mut pending = bus.add_subscription(&channels.descriptor.channel, channels.descriptor.stream_id)?;
    let subscription = loop {
        if let Some(s) = pending.poll()? {
            break s;
        }
    };

    let client = Client::new(
        ClientConfig {
            channels,
            allowed_roots: vec![work_dir.clone()],
            ..ClientConfig::default()
        },
        Arc::new(bus),
        clock,
    );

    let mut producer = Producer::new(Arc::clone(&client), ProducerContext::new(0, 1))?;
    producer.attach(5_000_000_000)?;

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

    let mut assembler = FragmentAssembler::new();
    let mut printed = 0usize;
    while printed < count {
        let seq = producer.offer_frame(&tensor, &payload, &FrameMetadata::default())?;
        producer.send_progress(seq, payload.len() as u64, ProgressState::Complete)?;
        producer.do_work()?;

        subscription.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |buffer| {
                    let line = match decode_message(buffer) {
                        Ok(Decoded::Message(Message::FrameDescriptor(d))) => {
                            Some(serde_json::json!({
                                "type": "FrameDescriptor", "streamId": d.stream_id,
                                "epoch": d.epoch, "seq": d.seq, "poolId": d.pool_id,
                                "valuesLenBytes": d.values_len_bytes,
                                "timestampNs": d.timestamp_ns,
                            }))
                        }
                        Ok(Decoded::Message(Message::FrameProgress(p))) => {
                            Some(serde_json::json!({
                                "type": "FrameProgress", "streamId": p.stream_id,
                                "epoch": p.epoch, "seq": p.seq,
                                "payloadBytesFilled": p.payload_bytes_filled,
                                "state": format!("{:?}", p.state),
                            }))
                        }
                        _ => None,
                    };
                    if let Some(line) = line {
                        println!("{line}");
                        printed += 1;
                    }
                });
            },
            64,
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    driver_agent.stop();
    let _ = std::fs::remove_dir_all(&work_dir);
    Ok(())
}
