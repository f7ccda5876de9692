// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Attach/detach state machine against the driver.
//!
//! Requests are correlated; without a response the request is re-sent
//! every 200 ms until the caller's deadline. A rejection for a colliding
//! client id transparently retries with a fresh correlation id and the
//! next client id. An OK payload is validated field by field; any
//! violation downgrades the attach to an invalid-parameters failure.

use std::sync::Arc;

use crate::client::Client;
use crate::codec::{
    decode_message, AttachRequest, AttachResponse, Decoded, DetachRequest, HugepagesPolicy,
    LeaseKeepalive, Message, PublishMode, ResponseCode, Role, NULL_U32,
};
use crate::error::{Result, TpError};
use crate::shm::HEADER_SLOT_BYTES;
use crate::transport::{FragmentAssembler, Publication, Subscription};

/// Re-send cadence while a response is outstanding.
pub const ATTACH_RETRY_INTERVAL_NS: u64 = 200_000_000;

const RESPONSE_FRAGMENT_LIMIT: usize = 20;

/// Attach parameters.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
    pub expected_layout_version: u32,
    pub publish_mode: PublishMode,
    pub hugepages_policy: HugepagesPolicy,
    pub desired_node_id: u32,
}

impl AttachOptions {
    #[must_use]
    pub fn new(stream_id: u32, client_id: u32, role: Role) -> Self {
        Self {
            stream_id,
            client_id,
            role,
            expected_layout_version: 0,
            publish_mode: PublishMode::ExistingOrCreate,
            hugepages_policy: HugepagesPolicy::Unspecified,
            desired_node_id: NULL_U32,
        }
    }
}

/// Validated payload of a granted attach.
#[derive(Debug, Clone)]
pub struct AttachInfo {
    pub lease_id: u64,
    pub epoch: u64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
    pub node_id: u32,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub header_slot_bytes: u32,
    pub keepalive_interval_ns: u64,
    pub header_uri: String,
    pub pools: Vec<crate::codec::PoolDescriptor>,
}

struct ActiveLease {
    lease_id: u64,
    stream_id: u32,
    client_id: u32,
    role: Role,
    keepalive_interval_ns: u64,
    last_keepalive_ns: u64,
}

/// One client's control-plane session with the driver.
pub struct DriverClient {
    client: Arc<Client>,
    publication: Arc<dyn Publication>,
    subscription: Arc<dyn Subscription>,
    assembler: FragmentAssembler,
    correlation_counter: i64,
    lease: Option<ActiveLease>,
}

impl DriverClient {
    /// Connect the control publication and response subscription, waiting
    /// until both see the driver.
    pub fn new(client: Arc<Client>) -> Result<Self> {
        let channels = client.config().channels.clone();
        let timeout = client.config().driver_timeout_ns;
        let publication =
            client.add_publication(&channels.control.channel, channels.control.stream_id, timeout)?;
        let subscription = client.add_subscription(
            &channels.control_response.channel,
            channels.control_response.stream_id,
            timeout,
        )?;

        let deadline = client.clock().now_ns() + timeout;
        while !publication.is_connected() || !subscription.is_connected() {
            client.do_work()?;
            if client.clock().now_ns() > deadline {
                return Err(TpError::Timeout("waiting for driver connection".to_string()));
            }
            std::thread::yield_now();
        }

        // Correlation ids only need to be unique per client session; the
        // clock salt keeps two sessions in one process apart.
        let correlation_counter =
            ((std::process::id() as i64) << 32) | (client.clock().now_ns() as i64 & 0xFFFF_FFFF);
        Ok(Self {
            client,
            publication,
            subscription,
            assembler: FragmentAssembler::new(),
            correlation_counter,
            lease: None,
        })
    }

    #[must_use]
    pub fn attached(&self) -> bool {
        self.lease.is_some()
    }

    #[must_use]
    pub fn lease_id(&self) -> Option<u64> {
        self.lease.as_ref().map(|l| l.lease_id)
    }

    fn next_correlation_id(&mut self) -> i64 {
        self.correlation_counter += 1;
        self.correlation_counter
    }

    fn drain_responses(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        let assembler = &mut self.assembler;
        self.subscription.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |buffer| {
                    match decode_message(buffer) {
                        Ok(Decoded::Message(message)) => out.push(message),
                        Ok(_) => {}
                        Err(e) => log::warn!("[driver-client] dropping bad response: {e}"),
                    }
                });
            },
            RESPONSE_FRAGMENT_LIMIT,
        );
        out
    }

    fn validate_grant(response: &AttachResponse) -> Result<()> {
        if response.lease_id == 0 {
            return Err(TpError::invalid("attach response lease_id is null"));
        }
        if response.epoch == 0 {
            return Err(TpError::invalid("attach response epoch is null"));
        }
        if response.stream_id == 0 {
            return Err(TpError::invalid("attach response stream_id is null"));
        }
        if response.header_slot_bytes != HEADER_SLOT_BYTES as u32 {
            return Err(TpError::invalid("attach response header_slot_bytes mismatch"));
        }
        if response.header_nslots == 0 {
            return Err(TpError::invalid("attach response header_nslots is zero"));
        }
        for pool in &response.pools {
            if pool.uri.is_empty() {
                return Err(TpError::invalid("attach response pool uri empty"));
            }
            if pool.nslots != response.header_nslots {
                return Err(TpError::invalid("attach response pool nslots mismatch"));
            }
        }
        Ok(())
    }

    /// Attach, driving the conductor until granted or `timeout_ns`.
    pub fn attach(&mut self, options: &AttachOptions, timeout_ns: u64) -> Result<AttachInfo> {
        if self.lease.is_some() {
            return Err(TpError::invalid("already holds a lease"));
        }

        let clock = Arc::clone(self.client.clock());
        let deadline = clock.now_ns() + timeout_ns;
        let mut client_id = options.client_id;

        'session: loop {
            let correlation_id = self.next_correlation_id();
            let request = Message::AttachRequest(AttachRequest {
                correlation_id,
                stream_id: options.stream_id,
                client_id,
                expected_layout_version: options.expected_layout_version,
                desired_node_id: options.desired_node_id,
                role: options.role,
                publish_mode: options.publish_mode,
                hugepages_policy: options.hugepages_policy,
            });
            let bytes = request.encode()?;
            self.publication.offer(&bytes)?;
            let mut next_resend = clock.now_ns() + ATTACH_RETRY_INTERVAL_NS;

            loop {
                self.client.do_work()?;
                for message in self.drain_responses() {
                    let Message::AttachResponse(response) = message else {
                        continue;
                    };
                    if response.correlation_id != correlation_id {
                        continue;
                    }

                    if response.code == ResponseCode::Ok {
                        Self::validate_grant(&response)?;
                        let now = clock.now_ns();
                        // The driver names the cadence; fall back to the
                        // configured one if it left the field null.
                        let keepalive_interval_ns = if response.keepalive_interval_ns == 0 {
                            self.client.config().lease_keepalive_interval_ms * 1_000_000
                        } else {
                            response.keepalive_interval_ns
                        };
                        self.lease = Some(ActiveLease {
                            lease_id: response.lease_id,
                            stream_id: response.stream_id,
                            client_id,
                            role: options.role,
                            keepalive_interval_ns,
                            last_keepalive_ns: now,
                        });
                        return Ok(AttachInfo {
                            lease_id: response.lease_id,
                            epoch: response.epoch,
                            stream_id: response.stream_id,
                            client_id,
                            role: options.role,
                            node_id: response.node_id,
                            layout_version: response.layout_version,
                            header_nslots: response.header_nslots,
                            header_slot_bytes: response.header_slot_bytes,
                            keepalive_interval_ns: response.keepalive_interval_ns,
                            header_uri: response.header_uri,
                            pools: response.pools,
                        });
                    }

                    // A colliding client id is retried with the next id
                    // under a fresh correlation id.
                    if response.code == ResponseCode::Rejected
                        && response.error_message.contains("client_id")
                    {
                        log::debug!(
                            "[driver-client] client_id {client_id} taken, retrying with {}",
                            client_id + 1
                        );
                        client_id += 1;
                        continue 'session;
                    }
                    return Err(TpError::Rejected(response.error_message));
                }

                let now = clock.now_ns();
                if now > deadline {
                    return Err(TpError::Timeout("attach".to_string()));
                }
                if now >= next_resend {
                    self.publication.offer(&bytes)?;
                    next_resend = now + ATTACH_RETRY_INTERVAL_NS;
                }
                std::thread::yield_now();
            }
        }
    }

    /// Detach the held lease; the response assembler is reset once the
    /// matching response arrives.
    pub fn detach(&mut self, timeout_ns: u64) -> Result<()> {
        let Some(lease) = self.lease.as_ref() else {
            return Err(TpError::invalid("no lease to detach"));
        };
        let (lease_id, stream_id, client_id, role) =
            (lease.lease_id, lease.stream_id, lease.client_id, lease.role);

        let clock = Arc::clone(self.client.clock());
        let deadline = clock.now_ns() + timeout_ns;
        let correlation_id = self.next_correlation_id();
        let request = Message::DetachRequest(DetachRequest {
            correlation_id,
            lease_id,
            stream_id,
            client_id,
            role,
        });
        let bytes = request.encode()?;
        self.publication.offer(&bytes)?;
        let mut next_resend = clock.now_ns() + ATTACH_RETRY_INTERVAL_NS;

        loop {
            self.client.do_work()?;
            for message in self.drain_responses() {
                let Message::DetachResponse(response) = message else {
                    continue;
                };
                if response.correlation_id != correlation_id {
                    continue;
                }
                self.lease = None;
                self.assembler.reset();
                if response.code == ResponseCode::Ok {
                    return Ok(());
                }
                return Err(TpError::Rejected(response.error_message));
            }

            let now = clock.now_ns();
            if now > deadline {
                return Err(TpError::Timeout("detach".to_string()));
            }
            if now >= next_resend {
                self.publication.offer(&bytes)?;
                next_resend = now + ATTACH_RETRY_INTERVAL_NS;
            }
            std::thread::yield_now();
        }
    }

    /// Send any control-plane message on the control publication.
    pub fn offer_control(&self, message: &Message) -> Result<()> {
        self.publication.offer(&message.encode()?)
    }

    /// Drop lease state without telling the driver (revoke/shutdown path).
    pub fn forget_lease(&mut self) {
        self.lease = None;
        self.assembler.reset();
    }

    /// Send a keepalive when the interval elapsed. Returns whether one
    /// was sent.
    pub fn keepalive(&mut self, now_ns: u64) -> Result<bool> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(false);
        };
        if now_ns < lease.last_keepalive_ns + lease.keepalive_interval_ns {
            return Ok(false);
        }
        let message = Message::LeaseKeepalive(LeaseKeepalive {
            lease_id: lease.lease_id,
            stream_id: lease.stream_id,
            client_id: lease.client_id,
            role: lease.role,
        });
        self.publication.offer(&message.encode()?)?;
        lease.last_keepalive_ns = now_ns;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRunner, IdleStrategy};
    use crate::clock::MonotonicClock;
    use crate::config::{ClientConfig, DriverConfig};
    use crate::driver::Driver;
    use crate::transport::{LoopbackBus, MessageTransport};

    struct Fixture {
        client: Arc<Client>,
        _driver_agent: AgentRunner,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let bus = LoopbackBus::new();
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(MonotonicClock);

        let driver_config = DriverConfig {
            shm_base_dir: dir.path().to_path_buf(),
            ..DriverConfig::default()
        };
        let mut driver =
            Driver::new(driver_config, &bus, Arc::clone(&clock)).expect("driver failed");
        let driver_agent = AgentRunner::start(
            "test-driver",
            IdleStrategy::Yielding,
            move || driver.do_work(),
        )
        .expect("agent failed");

        let client_config = ClientConfig {
            allowed_roots: vec![dir.path().to_path_buf()],
            ..ClientConfig::default()
        };
        let client = Client::new(client_config, Arc::new(bus), clock);
        Fixture {
            client,
            _driver_agent: driver_agent,
            _dir: dir,
        }
    }

    #[test]
    fn test_attach_and_detach() {
        let f = fixture();
        let mut driver_client = DriverClient::new(Arc::clone(&f.client)).expect("new failed");

        let info = driver_client
            .attach(&AttachOptions::new(0, 500, Role::Producer), 2_000_000_000)
            .expect("attach failed");
        assert_ne!(info.lease_id, 0);
        assert_ne!(info.epoch, 0);
        assert!(driver_client.attached());
        assert_eq!(info.header_slot_bytes, HEADER_SLOT_BYTES as u32);

        driver_client.detach(2_000_000_000).expect("detach failed");
        assert!(!driver_client.attached());
    }

    #[test]
    fn test_attach_retries_past_client_id_collision() {
        let f = fixture();
        let mut first = DriverClient::new(Arc::clone(&f.client)).expect("new failed");
        let held = first
            .attach(&AttachOptions::new(0, 700, Role::Consumer), 2_000_000_000)
            .expect("attach failed");

        // Same client id; the machine should land on 701 transparently.
        let mut second = DriverClient::new(Arc::clone(&f.client)).expect("new failed");
        let info = second
            .attach(&AttachOptions::new(0, 700, Role::Consumer), 2_000_000_000)
            .expect("attach failed");
        assert_eq!(info.client_id, 701);
        assert_ne!(info.lease_id, held.lease_id);
        assert_ne!(info.lease_id, 0);
    }

    #[test]
    fn test_keepalive_cadence() {
        let f = fixture();
        let mut driver_client = DriverClient::new(Arc::clone(&f.client)).expect("new failed");
        driver_client
            .attach(&AttachOptions::new(0, 800, Role::Consumer), 2_000_000_000)
            .expect("attach failed");

        let now = f.client.clock().now_ns();
        // Immediately after attach the interval has not elapsed.
        assert!(!driver_client.keepalive(now).expect("keepalive failed"));
        // Far in the future it has.
        assert!(driver_client
            .keepalive(now + 10_000_000_000)
            .expect("keepalive failed"));
    }

    #[test]
    fn test_attach_times_out_without_driver() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let bus = LoopbackBus::new();
        // A subscriber so the control publication reports connected, but
        // nobody answers.
        let _silent = bus
            .add_subscription("loopback:control", 1001)
            .expect("add failed");
        let _responder = bus
            .add_publication("loopback:control", 1002)
            .expect("add failed");

        let client_config = ClientConfig {
            driver_timeout_ns: 200_000_000,
            allowed_roots: vec![dir.path().to_path_buf()],
            ..ClientConfig::default()
        };
        let client = Client::new(client_config, Arc::new(bus), Arc::new(MonotonicClock));
        let mut driver_client = DriverClient::new(client).expect("new failed");
        match driver_client.attach(&AttachOptions::new(0, 1, Role::Consumer), 300_000_000) {
            Err(TpError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
