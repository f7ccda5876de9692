// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Control-plane listener.
//!
//! Hosts a loopback fabric (driver + demo producer/consumer), taps the
//! control channels, and prints every decoded message as one JSON line.
//!
//! Usage: `tp-control-listen [driver-config.yaml] [--count N]`

use std::sync::Arc;

use tensorpool::client::{Client, Consumer, ConsumerContext, Producer, ProducerContext};
use tensorpool::clock::MonotonicClock;
use tensorpool::codec::{decode_message, Decoded, Message};
use tensorpool::config::{ClientConfig, DriverConfig};
use tensorpool::driver::Driver;
use tensorpool::transport::{FragmentAssembler, LoopbackBus, MessageTransport, Subscription};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("{} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn message_json(message: &Message) -> serde_json::Value {
    use serde_json::json;
    match message {
        Message::AttachRequest(m) => json!({
            "type": "AttachRequest", "correlationId": m.correlation_id,
            "streamId": m.stream_id, "clientId": m.client_id, "role": format!("{:?}", m.role),
        }),
        Message::AttachResponse(m) => json!({
            "type": "AttachResponse", "correlationId": m.correlation_id,
            "code": format!("{:?}", m.code), "leaseId": m.lease_id, "epoch": m.epoch,
            "streamId": m.stream_id, "nodeId": m.node_id, "headerUri": m.header_uri,
        }),
        Message::DetachRequest(m) => json!({
            "type": "DetachRequest", "leaseId": m.lease_id, "streamId": m.stream_id,
        }),
        Message::DetachResponse(m) => json!({
            "type": "DetachResponse", "correlationId": m.correlation_id,
            "code": format!("{:?}", m.code),
        }),
        Message::LeaseKeepalive(m) => json!({
            "type": "LeaseKeepalive", "leaseId": m.lease_id, "streamId": m.stream_id,
        }),
        Message::LeaseRevoked(m) => json!({
            "type": "LeaseRevoked", "leaseId": m.lease_id, "streamId": m.stream_id,
            "reason": format!("{:?}", m.reason), "message": m.message,
        }),
        Message::DriverShutdown(m) => json!({
            "type": "DriverShutdown", "reason": format!("{:?}", m.reason),
        }),
        Message::ShmPoolAnnounce(m) => json!({
            "type": "ShmPoolAnnounce", "streamId": m.stream_id, "epoch": m.epoch,
            "headerNslots": m.header_nslots, "headerUri": m.header_uri,
            "pools": m.pools.iter().map(|p| json!({
                "poolId": p.pool_id, "strideBytes": p.stride_bytes, "uri": p.uri,
            })).collect::<Vec<_>>(),
        }),
        Message::ConsumerHello(m) => json!({
            "type": "ConsumerHello", "streamId": m.stream_id, "consumerId": m.consumer_id,
        }),
        Message::ConsumerConfig(m) => json!({
            "type": "ConsumerConfig", "consumerId": m.consumer_id,
            "descriptorStreamId": m.descriptor_stream_id,
        }),
        other => serde_json::json!({
            "type": "Other", "templateId": other.template_id(),
        }),
    }
}

fn tap(subscription: &Arc<dyn Subscription>, assembler: &mut FragmentAssembler, printed: &mut usize) {
    subscription.poll(
        &mut |flags, data| {
            assembler.on_fragment(flags, data, &mut |buffer| {
                if let Ok(Decoded::Message(message)) = decode_message(buffer) {
                    println!("{}", message_json(&message));
                    *printed += 1;
                }
            });
        },
        64,
    );
}

fn main() -> tensorpool::Result<()> {
    log::set_logger(&LOGGER).ok();
    log::set_max_level(log::LevelFilter::Info);

    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut count = 32usize;
    while let Some(arg) = args.next() {
        if arg == "--count" {
            count = args
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(count);
        } else {
            config_path = Some(arg);
        }
    }

    let work_dir = std::env::temp_dir().join(format!("tp-listen-{}", std::process::id()));
    std::fs::create_dir_all(&work_dir)?;

    let driver_config = match config_path {
        Some(path) => DriverConfig::from_yaml_file(std::path::Path::new(&path))?,
        None => DriverConfig {
            shm_base_dir: work_dir.clone(),
            ..DriverConfig::default()
        },
    };
    let channels = driver_config.channels.clone();

    let bus = LoopbackBus::new();
    let clock: Arc<dyn tensorpool::clock::Clock> = Arc::new(MonotonicClock);
    let mut driver = Driver::new(driver_config, &bus, Arc::clone(&clock))?;
    let mut driver_agent = tensorpool::agent::AgentRunner::start(
        "tp-driver",
        tensorpool::agent::IdleStrategy::Sleeping { sleep_ns: 1_000_000 },
        move || driver.do_work(),
    )?;

    // Taps on both control directions plus the announce channel.
    let mut taps = Vec::new();
    for endpoint in [&channels.control, &channels.control_response, &channels.announce] {
        let mut pending = bus.add_subscription(&endpoint.channel, endpoint.stream_id)?;
        let subscription = loop {
            if let Some(s) = pending.poll()? {
                break s;
            }
        };
        taps.push((subscription, FragmentAssembler::new()));
    }

    let client = Client::new(
        ClientConfig {
            channels,
            allowed_roots: vec![work_dir.clone()],
            ..ClientConfig::default()
        },
        Arc::new(bus),
        clock,
    );

    // Demo traffic: one producer and one consumer attach and keep alive.
    let mut producer = Producer::new(Arc::clone(&client), ProducerContext::new(0, 1))?;
    let mut printed = 0usize;
    let mut attach_driven = false;
    let mut consumer: Option<Consumer> = None;

    while printed < count {
        client.do_work()?;
        if !attach_driven {
            let stream_id = producer.attach(5_000_000_000)?.stream_id;
            let mut c = Consumer::new(
                Arc::clone(&client),
                ConsumerContext::new(stream_id, 2, 1),
            )?;
            c.attach(5_000_000_000)?;
            consumer = Some(c);
            attach_driven = true;
        }
        producer.do_work()?;
        if let Some(c) = consumer.as_mut() {
            c.do_work()?;
        }
        for (subscription, assembler) in &mut taps {
            tap(subscription, assembler, &mut printed);
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    driver_agent.stop();
    let _ = std::fs::remove_dir_all(&work_dir);
    Ok(())
}
