// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Lease lifecycle under a live driver: expiry, revoke handling, driver
//! shutdown, and consumer re-attach.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use tensorpool::agent::{AgentRunner, IdleStrategy};
use tensorpool::client::{Client, Consumer, ConsumerContext, ConsumerState, Producer, ProducerContext};
use tensorpool::clock::MonotonicClock;
use tensorpool::config::{ClientConfig, DriverConfig};
use tensorpool::driver::Driver;
use tensorpool::transport::LoopbackBus;
use tensorpool::ErrorKind;

const ATTACH_TIMEOUT_NS: u64 = 5_000_000_000;

struct Fabric {
    client: Arc<Client>,
    driver: Arc<Mutex<Driver>>,
    driver_agent: AgentRunner,
    _dir: TempDir,
}

fn fabric(tweak: impl FnOnce(&mut DriverConfig)) -> Fabric {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let bus = LoopbackBus::new();
    let clock: Arc<dyn tensorpool::clock::Clock> = Arc::new(MonotonicClock);

    let mut driver_config = DriverConfig {
        shm_base_dir: dir.path().to_path_buf(),
        ..DriverConfig::default()
    };
    tweak(&mut driver_config);

    let driver = Arc::new(Mutex::new(
        Driver::new(driver_config, &bus, Arc::clone(&clock)).expect("driver failed"),
    ));
    let agent_driver = Arc::clone(&driver);
    let driver_agent = AgentRunner::start("lifecycle-driver", IdleStrategy::Yielding, move || {
        agent_driver.lock().do_work()
    })
    .expect("agent failed");

    let client_config = ClientConfig {
        allowed_roots: vec![dir.path().to_path_buf()],
        lease_keepalive_interval_ms: 50,
        ..ClientConfig::default()
    };
    let client = Client::new(client_config, Arc::new(bus), clock);

    Fabric {
        client,
        driver,
        driver_agent,
        _dir: dir,
    }
}

/// A lease with no keepalives is revoked within one sweep, and the
/// consumer transitions to unmapped with a re-attach scheduled.
#[test]
fn test_expiry_revokes_consumer_within_deadline() {
    let f = fabric(|c| {
        c.lease_keepalive_interval_ms = 50;
        c.lease_expiry_grace_intervals = 2;
    });

    let mut consumer = Consumer::new(
        Arc::clone(&f.client),
        ConsumerContext {
            hello_interval_ms: 0,
            qos_interval_ms: 0,
            ..ConsumerContext::new(0, 400, 4)
        },
    )
    .expect("consumer failed");
    consumer.attach(ATTACH_TIMEOUT_NS).expect("attach failed");
    assert_eq!(consumer.state(), ConsumerState::Active);
    assert!(consumer.shm_mapped());

    let revoked: Arc<Mutex<Vec<ErrorKind>>> = Arc::new(Mutex::new(Vec::new()));
    let revoked_in = Arc::clone(&revoked);
    consumer.set_error_handler(Box::new(move |kind, _msg| {
        revoked_in.lock().push(kind);
    }));

    // Never send a keepalive: the 100 ms lease lapses. The consumer must
    // observe the revoke well within two seconds.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        consumer.poll_lifecycle();
        if consumer.state() == ConsumerState::Unmapped {
            break;
        }
        assert!(Instant::now() < deadline, "revoke not observed in time");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(!consumer.shm_mapped());
    assert!(consumer.reattach_requested());
    assert_eq!(*revoked.lock(), vec![ErrorKind::LeaseRevoked]);
}

/// After a revoke, the consumer re-attaches on its backoff schedule.
#[test]
fn test_consumer_reattaches_after_revoke() {
    let f = fabric(|c| {
        c.lease_keepalive_interval_ms = 50;
        c.lease_expiry_grace_intervals = 2;
    });

    let mut consumer = Consumer::new(
        Arc::clone(&f.client),
        ConsumerContext {
            hello_interval_ms: 0,
            qos_interval_ms: 0,
            ..ConsumerContext::new(0, 410, 5)
        },
    )
    .expect("consumer failed");
    let first_lease = consumer.attach(ATTACH_TIMEOUT_NS).expect("attach failed").lease_id;

    // Let the lease lapse without keepalives.
    std::thread::sleep(Duration::from_millis(300));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        consumer.do_work().expect("do_work failed");
        if consumer.state() == ConsumerState::Active {
            break;
        }
        assert!(Instant::now() < deadline, "consumer never re-attached");
        std::thread::sleep(Duration::from_millis(20));
    }

    let second_lease = consumer.attach_info().expect("attach info missing").lease_id;
    assert_ne!(second_lease, first_lease);
}

/// Keepalives keep a lease alive indefinitely.
#[test]
fn test_keepalives_sustain_lease() {
    let f = fabric(|c| {
        c.lease_keepalive_interval_ms = 50;
        c.lease_expiry_grace_intervals = 2;
    });

    let mut producer = Producer::new(
        Arc::clone(&f.client),
        ProducerContext {
            qos_interval_ms: 0,
            ..ProducerContext::new(0, 420)
        },
    )
    .expect("producer failed");
    producer.attach(ATTACH_TIMEOUT_NS).expect("attach failed");

    // Pump keepalives for several lease lifetimes.
    let end = Instant::now() + Duration::from_millis(600);
    while Instant::now() < end {
        producer.do_work().expect("do_work failed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!producer.reattach_requested());
    assert_eq!(f.driver.lock().lease_count(), 1);
}

/// Driver shutdown reaches attached clients and requests re-attach.
#[test]
fn test_driver_shutdown_observed() {
    let mut f = fabric(|_| {});

    let mut consumer = Consumer::new(
        Arc::clone(&f.client),
        ConsumerContext {
            hello_interval_ms: 0,
            qos_interval_ms: 0,
            ..ConsumerContext::new(0, 430, 6)
        },
    )
    .expect("consumer failed");
    consumer.attach(ATTACH_TIMEOUT_NS).expect("attach failed");

    let kinds: Arc<Mutex<Vec<ErrorKind>>> = Arc::new(Mutex::new(Vec::new()));
    let kinds_in = Arc::clone(&kinds);
    consumer.set_error_handler(Box::new(move |kind, _| kinds_in.lock().push(kind)));

    f.driver_agent.stop();
    f.driver.lock().close();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        consumer.poll_lifecycle();
        if consumer.state() == ConsumerState::Unmapped {
            break;
        }
        assert!(Instant::now() < deadline, "shutdown not observed in time");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(consumer.reattach_requested());
    assert_eq!(*kinds.lock(), vec![ErrorKind::DriverShutdown]);
}
