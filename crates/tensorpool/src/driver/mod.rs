// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! The driver: arbiter of shared-memory access.
//!
//! One driver instance owns the lease table, per-stream state, node-id
//! cooldowns, and the ring files on disk. It subscribes to the control
//! channel, answers attach/detach/keepalive, emits `ShmPoolAnnounce` on
//! every epoch change and on a periodic cadence, revokes expired leases,
//! and broadcasts `DriverShutdown` when closed.
//!
//! Everything runs on one `do_work` loop; no state is shared with other
//! threads.

mod provision;
mod supervisor;

pub use provision::{create_epoch, gc_stream, is_hugepages_dir, stream_dir, ProvisionedEpoch};
pub use supervisor::Supervisor;

use std::sync::Arc;

use crate::clock::Clock;
use crate::codec::{
    decode_message, AttachRequest, AttachResponse, Decoded, DetachRequest, DetachResponse,
    DriverShutdown, LeaseKeepalive, LeaseRevoked, LeaseRevokeReason, Message, PublishMode,
    ResponseCode, Role, ShmPoolAnnounce, ShutdownReason, HugepagesPolicy, NULL_U32,
};
use crate::config::{DriverConfig, StreamProfile};
use crate::error::{Result, TpError};
use crate::shm::{HEADER_SLOT_BYTES, LAYOUT_VERSION};
use crate::transport::{
    FragmentAssembler, MessageTransport, PendingPublication, PendingSubscription, Publication,
    Subscription,
};

const CONTROL_FRAGMENT_LIMIT: usize = 10;
const NODE_ID_ATTEMPTS: usize = 1024;

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: u64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
    pub node_id: u32,
    pub issued_ns: u64,
    pub expiry_ns: u64,
}

#[derive(Debug, Clone, Copy)]
struct NodeIdCooldown {
    node_id: u32,
    expires_ns: u64,
}

struct StreamState {
    stream_id: u32,
    profile: StreamProfile,
    epoch: u64,
    epoch_created_ns: u64,
    producer_lease_id: u64,
    producer_client_id: u32,
    require_hugepages: bool,
    provisioned: Option<ProvisionedEpoch>,
}

/// Counters surfaced for observability and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverStats {
    pub attaches_granted: u64,
    pub attaches_rejected: u64,
    pub leases_expired: u64,
    /// Keepalives for unknown lease ids (dropped, but visible).
    pub unknown_keepalives: u64,
}

/// The driver event loop state.
pub struct Driver {
    config: DriverConfig,
    clock: Arc<dyn Clock>,
    control_sub: Arc<dyn Subscription>,
    response_pub: Arc<dyn Publication>,
    announce_pub: Arc<dyn Publication>,
    assembler: FragmentAssembler,
    streams: Vec<StreamState>,
    leases: Vec<Lease>,
    cooldowns: Vec<NodeIdCooldown>,
    supervisor: Option<Supervisor>,
    lease_counter: u64,
    rng_state: u64,
    next_announce_ns: u64,
    stats: DriverStats,
    shutdown_sent: bool,
}

fn complete_subscription(
    mut pending: Box<dyn PendingSubscription>,
    what: &str,
) -> Result<Arc<dyn Subscription>> {
    for _ in 0..10_000 {
        if let Some(sub) = pending.poll()? {
            return Ok(sub);
        }
        std::thread::yield_now();
    }
    Err(TpError::Timeout(format!("adding {what} subscription")))
}

fn complete_publication(
    mut pending: Box<dyn PendingPublication>,
    what: &str,
) -> Result<Arc<dyn Publication>> {
    for _ in 0..10_000 {
        if let Some(publication) = pending.poll()? {
            return Ok(publication);
        }
        std::thread::yield_now();
    }
    Err(TpError::Timeout(format!("adding {what} publication")))
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        transport: &dyn MessageTransport,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        provision::validate_namespace(&config.shm_namespace)?;
        if config.profiles.is_empty() {
            return Err(TpError::invalid("driver needs at least one profile"));
        }
        for profile in &config.profiles {
            if !profile.header_nslots.is_power_of_two() {
                return Err(TpError::invalid(format!(
                    "profile {} header_nslots {} not a power of two",
                    profile.name, profile.header_nslots
                )));
            }
        }

        let control_sub = complete_subscription(
            transport.add_subscription(
                &config.channels.control.channel,
                config.channels.control.stream_id,
            )?,
            "control",
        )?;
        let response_pub = complete_publication(
            transport.add_publication(
                &config.channels.control_response.channel,
                config.channels.control_response.stream_id,
            )?,
            "control response",
        )?;
        let announce_pub = complete_publication(
            transport.add_publication(
                &config.channels.announce.channel,
                config.channels.announce.stream_id,
            )?,
            "announce",
        )?;

        let supervisor = config
            .supervisor
            .per_consumer_enabled
            .then(|| Supervisor::new(config.supervisor.clone()));

        let now = clock.now_ns();
        let mut driver = Self {
            rng_state: now ^ (std::process::id() as u64) << 32 ^ 0x9E37_79B9_7F4A_7C15,
            config,
            clock,
            control_sub,
            response_pub,
            announce_pub,
            assembler: FragmentAssembler::new(),
            streams: Vec::new(),
            leases: Vec::new(),
            cooldowns: Vec::new(),
            supervisor,
            lease_counter: 0,
            next_announce_ns: 0,
            stats: DriverStats::default(),
            shutdown_sent: false,
        };

        if driver.config.epoch_gc.enabled && driver.config.epoch_gc.on_startup {
            driver.gc_all_streams();
        }

        log::info!(
            "[driver] up; namespace={} base={}",
            driver.config.shm_namespace,
            driver.config.shm_base_dir.display()
        );
        Ok(driver)
    }

    // ------------------------------------------------------------------
    // Accessors (used by tools and tests)
    // ------------------------------------------------------------------

    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    #[must_use]
    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    #[must_use]
    pub fn stream_epoch(&self, stream_id: u32) -> Option<u64> {
        self.streams
            .iter()
            .find(|s| s.stream_id == stream_id)
            .map(|s| s.epoch)
    }

    #[must_use]
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    #[must_use]
    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    // ------------------------------------------------------------------
    // Work loop
    // ------------------------------------------------------------------

    /// One bounded pass: drain control fragments, sweep leases, announce.
    pub fn do_work(&mut self) -> Result<usize> {
        let mut messages: Vec<Vec<u8>> = Vec::new();
        {
            let assembler = &mut self.assembler;
            self.control_sub.poll(
                &mut |flags, data| {
                    assembler.on_fragment(flags, data, &mut |msg| messages.push(msg.to_vec()));
                },
                CONTROL_FRAGMENT_LIMIT,
            );
        }

        let mut work = messages.len();
        for message in messages {
            self.on_control_message(&message);
        }

        work += self.handle_expired_leases();

        if let Some(supervisor) = &mut self.supervisor {
            work += supervisor.do_work(self.clock.now_ns());
        }

        let period_ns = self.config.announce_period_ms * 1_000_000;
        let now = self.clock.now_ns();
        if period_ns > 0 && now >= self.next_announce_ns {
            for i in 0..self.streams.len() {
                if self.streams[i].epoch != 0 {
                    self.send_announce(i);
                }
            }
            self.next_announce_ns = now + period_ns;
        }

        Ok(work)
    }

    /// Broadcast shutdown and stop serving. Idempotent.
    pub fn close(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        let message = Message::DriverShutdown(DriverShutdown {
            reason: ShutdownReason::Normal,
            message: String::new(),
        });
        self.offer_response(&message);
        log::info!("[driver] shutdown announced");
    }

    // ------------------------------------------------------------------
    // Control demux
    // ------------------------------------------------------------------

    fn on_control_message(&mut self, buffer: &[u8]) {
        match decode_message(buffer) {
            Ok(Decoded::Message(Message::AttachRequest(request))) => {
                self.handle_attach(&request);
            }
            Ok(Decoded::Message(Message::DetachRequest(request))) => {
                self.handle_detach(&request);
            }
            Ok(Decoded::Message(Message::LeaseKeepalive(keepalive))) => {
                self.handle_keepalive(&keepalive);
            }
            Ok(Decoded::Message(Message::ConsumerHello(hello))) => {
                let now = self.clock.now_ns();
                if let Some(config) = self
                    .supervisor
                    .as_mut()
                    .and_then(|s| s.on_consumer_hello(&hello, now))
                {
                    self.offer_response(&Message::ConsumerConfig(config));
                }
            }
            Ok(Decoded::Message(other)) => {
                log::debug!(
                    "[driver] ignoring control template {}",
                    other.template_id()
                );
            }
            Ok(Decoded::NotOurs) => {}
            Ok(Decoded::UnknownTemplate(template_id)) => {
                log::warn!("[driver] unknown control template {template_id}, dropping");
            }
            Err(e) => {
                log::warn!("[driver] dropping invalid control message: {e}");
            }
        }
    }

    fn offer_response(&self, message: &Message) {
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = self.response_pub.offer(&bytes) {
                    log::warn!("[driver] response offer failed: {e}");
                }
            }
            Err(e) => log::warn!("[driver] response encode failed: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // Attach
    // ------------------------------------------------------------------

    fn reject_attach(&mut self, correlation_id: i64, code: ResponseCode, message: &str) {
        self.stats.attaches_rejected += 1;
        log::debug!("[driver] attach rejected: {message}");
        self.offer_response(&Message::AttachResponse(AttachResponse::error(
            correlation_id,
            code,
            message,
        )));
    }

    fn handle_attach(&mut self, request: &AttachRequest) {
        let correlation_id = request.correlation_id;

        if request.client_id == 0 {
            return self.reject_attach(
                correlation_id,
                ResponseCode::InvalidParams,
                "client_id must be non-zero",
            );
        }
        if self.client_id_in_use(request.client_id) {
            return self.reject_attach(
                correlation_id,
                ResponseCode::Rejected,
                "client_id already attached",
            );
        }
        if request.expected_layout_version != 0
            && request.expected_layout_version != LAYOUT_VERSION
        {
            return self.reject_attach(
                correlation_id,
                ResponseCode::Rejected,
                "layout version mismatch",
            );
        }

        let create_allowed = request.publish_mode == PublishMode::ExistingOrCreate;
        let mut stream_id = request.stream_id;

        let stream_index = match self.find_stream(stream_id) {
            Some(index) => index,
            None => {
                if !create_allowed || !self.config.allow_dynamic_streams {
                    return self.reject_attach(
                        correlation_id,
                        ResponseCode::Rejected,
                        "stream not provisioned",
                    );
                }
                if stream_id == 0 {
                    match self.allocate_stream_id() {
                        Some(id) => stream_id = id,
                        None => {
                            return self.reject_attach(
                                correlation_id,
                                ResponseCode::InvalidParams,
                                "no stream ids available",
                            )
                        }
                    }
                }
                let Some(profile) = self.config.profile(&self.config.default_profile).cloned()
                else {
                    return self.reject_attach(
                        correlation_id,
                        ResponseCode::InvalidParams,
                        "default profile missing",
                    );
                };
                self.streams.push(StreamState {
                    stream_id,
                    profile,
                    epoch: 0,
                    epoch_created_ns: 0,
                    producer_lease_id: 0,
                    producer_client_id: 0,
                    require_hugepages: false,
                    provisioned: None,
                });
                self.streams.len() - 1
            }
        };

        if self.streams[stream_index].profile.pools.is_empty() {
            return self.reject_attach(
                correlation_id,
                ResponseCode::InvalidParams,
                "invalid profile",
            );
        }
        if request.role == Role::Producer && self.streams[stream_index].producer_lease_id != 0 {
            return self.reject_attach(
                correlation_id,
                ResponseCode::Rejected,
                "producer already attached",
            );
        }

        let mut require_hugepages = match request.hugepages_policy {
            HugepagesPolicy::Hugepages => true,
            HugepagesPolicy::Standard => false,
            HugepagesPolicy::Unspecified => self.config.require_hugepages,
        };
        let base_is_huge = is_hugepages_dir(&self.config.shm_base_dir).unwrap_or(false);
        if require_hugepages && !base_is_huge {
            return self.reject_attach(
                correlation_id,
                ResponseCode::Rejected,
                "hugepages not available",
            );
        }
        if request.hugepages_policy == HugepagesPolicy::Standard && base_is_huge {
            return self.reject_attach(
                correlation_id,
                ResponseCode::Rejected,
                "standard pages requested",
            );
        }

        let now = self.clock.now_ns();
        if request.desired_node_id != NULL_U32
            && (self.node_id_in_use(request.desired_node_id)
                || self.node_id_in_cooldown(request.desired_node_id, now))
        {
            return self.reject_attach(
                correlation_id,
                ResponseCode::Rejected,
                "desired node_id unavailable",
            );
        }

        // An existing epoch pins the page-size decision for the stream.
        if self.streams[stream_index].epoch != 0 {
            require_hugepages = self.streams[stream_index].require_hugepages;
        }

        if request.role == Role::Producer || self.streams[stream_index].epoch == 0 {
            self.streams[stream_index].require_hugepages = require_hugepages;
            if let Err(e) = self.bump_and_provision(stream_index) {
                let (code, text) = match &e {
                    TpError::Rejected(msg) => (ResponseCode::Rejected, msg.clone()),
                    other => (ResponseCode::InternalError, format!("shm creation failed: {other}")),
                };
                return self.reject_attach(correlation_id, code, &text);
            }
        }

        let node_id = if request.desired_node_id != NULL_U32 {
            request.desired_node_id
        } else {
            match self.next_node_id(now) {
                Some(id) => id,
                None => {
                    return self.reject_attach(
                        correlation_id,
                        ResponseCode::InternalError,
                        "node_id allocation failed",
                    )
                }
            }
        };

        let grant = {
            let stream = &self.streams[stream_index];
            stream.provisioned.as_ref().map(|provisioned| {
                (
                    stream.stream_id,
                    stream.epoch,
                    provisioned.header_nslots,
                    provisioned.header_uri.clone(),
                    provisioned.pools.clone(),
                )
            })
        };
        let Some((granted_stream_id, epoch, header_nslots, header_uri, pools)) = grant else {
            return self.reject_attach(
                correlation_id,
                ResponseCode::InternalError,
                "stream has no provisioned epoch",
            );
        };

        self.lease_counter += 1;
        let lease = Lease {
            lease_id: self.lease_counter,
            stream_id: granted_stream_id,
            client_id: request.client_id,
            role: request.role,
            node_id,
            issued_ns: now,
            expiry_ns: now + self.config.lease_duration_ns(),
        };
        self.leases.push(lease);
        if request.role == Role::Producer {
            self.streams[stream_index].producer_lease_id = lease.lease_id;
            self.streams[stream_index].producer_client_id = request.client_id;
        }
        self.stats.attaches_granted += 1;

        self.send_announce(stream_index);

        self.offer_response(&Message::AttachResponse(AttachResponse {
            correlation_id,
            code: ResponseCode::Ok,
            lease_id: lease.lease_id,
            epoch,
            keepalive_interval_ns: self.config.keepalive_interval_ns(),
            stream_id: granted_stream_id,
            layout_version: LAYOUT_VERSION,
            header_nslots,
            header_slot_bytes: HEADER_SLOT_BYTES as u32,
            node_id,
            error_message: String::new(),
            header_uri,
            pools,
        }));
        log::info!(
            "[driver] lease {} granted: stream={} client={} role={:?} node={:#010x}",
            lease.lease_id,
            lease.stream_id,
            lease.client_id,
            lease.role,
            node_id
        );
    }

    // ------------------------------------------------------------------
    // Detach / keepalive
    // ------------------------------------------------------------------

    fn handle_detach(&mut self, request: &DetachRequest) {
        let found = self.leases.iter().position(|l| {
            l.lease_id == request.lease_id
                && l.stream_id == request.stream_id
                && l.client_id == request.client_id
                && l.role == request.role
        });
        let Some(index) = found else {
            self.offer_response(&Message::DetachResponse(DetachResponse {
                correlation_id: request.correlation_id,
                code: ResponseCode::Rejected,
                error_message: "lease not found".to_string(),
            }));
            return;
        };

        let lease = self.leases[index];
        self.end_lease(index, LeaseRevokeReason::Detached, "lease detached");

        if lease.role == Role::Producer {
            if let Some(stream_index) = self.find_stream(lease.stream_id) {
                if let Err(e) = self.bump_and_provision(stream_index) {
                    log::warn!("[driver] re-provision after detach failed: {e}");
                } else {
                    self.send_announce(stream_index);
                }
            }
        }

        self.offer_response(&Message::DetachResponse(DetachResponse {
            correlation_id: request.correlation_id,
            code: ResponseCode::Ok,
            error_message: String::new(),
        }));
    }

    fn handle_keepalive(&mut self, keepalive: &LeaseKeepalive) {
        let now = self.clock.now_ns();
        let duration = self.config.lease_duration_ns();
        let Some(lease) = self.leases.iter_mut().find(|l| {
            l.lease_id == keepalive.lease_id
                && l.stream_id == keepalive.stream_id
                && l.client_id == keepalive.client_id
                && l.role == keepalive.role
        }) else {
            // Dropped without a response, but counted.
            self.stats.unknown_keepalives += 1;
            return;
        };
        // Extend only; a keepalive never shortens a lease.
        lease.expiry_ns = lease.expiry_ns.max(now + duration);
    }

    fn handle_expired_leases(&mut self) -> usize {
        let now = self.clock.now_ns();
        let mut expired = 0;
        let mut index = 0;
        while index < self.leases.len() {
            if self.leases[index].expiry_ns != 0 && now > self.leases[index].expiry_ns {
                let lease = self.leases[index];
                self.stats.leases_expired += 1;
                expired += 1;
                self.end_lease(index, LeaseRevokeReason::Expired, "lease expired");

                if lease.role == Role::Producer {
                    if let Some(stream_index) = self.find_stream(lease.stream_id) {
                        if let Err(e) = self.bump_and_provision(stream_index) {
                            log::warn!("[driver] re-provision after expiry failed: {e}");
                        } else {
                            self.send_announce(stream_index);
                        }
                    }
                }
                continue;
            }
            index += 1;
        }
        expired
    }

    /// Revoke, cooldown the node id, release producer slot, remove.
    fn end_lease(&mut self, index: usize, reason: LeaseRevokeReason, text: &str) {
        let lease = self.leases.remove(index);
        self.offer_response(&Message::LeaseRevoked(LeaseRevoked {
            lease_id: lease.lease_id,
            stream_id: lease.stream_id,
            client_id: lease.client_id,
            role: lease.role,
            reason,
            message: text.to_string(),
        }));
        self.record_node_id_cooldown(lease.node_id, self.clock.now_ns());
        if let Some(stream) = self
            .streams
            .iter_mut()
            .find(|s| s.producer_lease_id == lease.lease_id)
        {
            stream.producer_lease_id = 0;
            stream.producer_client_id = 0;
        }
        log::info!(
            "[driver] lease {} ended ({:?}): stream={} client={}",
            lease.lease_id,
            reason,
            lease.stream_id,
            lease.client_id
        );
    }

    // ------------------------------------------------------------------
    // Streams & epochs
    // ------------------------------------------------------------------

    fn find_stream(&self, stream_id: u32) -> Option<usize> {
        self.streams.iter().position(|s| s.stream_id == stream_id)
    }

    fn allocate_stream_id(&self) -> Option<u32> {
        for range in &self.config.stream_id_ranges {
            for id in range.first..=range.last {
                if self.find_stream(id).is_none() {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Epoch advances to `max(now, epoch + 1)`, strictly monotonic.
    fn bump_and_provision(&mut self, stream_index: usize) -> Result<()> {
        let now = self.clock.now_realtime_ns();
        let stream = &mut self.streams[stream_index];
        stream.epoch = if now <= stream.epoch {
            stream.epoch + 1
        } else {
            now
        };
        stream.epoch_created_ns = now;

        let provisioned = create_epoch(
            &self.config,
            &stream.profile,
            stream.stream_id,
            stream.epoch,
            stream.require_hugepages,
            now,
        )?;
        stream.provisioned = Some(provisioned);

        let stream_id = self.streams[stream_index].stream_id;
        if let Err(e) = gc_stream(&self.config, stream_id, now) {
            log::warn!("[driver] epoch gc failed for stream {stream_id}: {e}");
        }
        Ok(())
    }

    fn send_announce(&mut self, stream_index: usize) {
        let now = self.clock.now_realtime_ns();
        let stream = &self.streams[stream_index];
        let Some(provisioned) = stream.provisioned.as_ref() else {
            return;
        };
        let announce = Message::ShmPoolAnnounce(ShmPoolAnnounce {
            epoch: stream.epoch,
            timestamp_ns: now,
            stream_id: stream.stream_id,
            layout_version: LAYOUT_VERSION,
            header_nslots: provisioned.header_nslots,
            header_slot_bytes: HEADER_SLOT_BYTES as u32,
            require_hugepages: stream.require_hugepages,
            clock_domain: 0,
            header_uri: provisioned.header_uri.clone(),
            pools: provisioned.pools.clone(),
        });
        match announce.encode() {
            Ok(bytes) => {
                if let Err(e) = self.announce_pub.offer(&bytes) {
                    log::warn!("[driver] announce offer failed: {e}");
                }
            }
            Err(e) => log::warn!("[driver] announce encode failed: {e}"),
        }
    }

    fn gc_all_streams(&mut self) {
        let now = self.clock.now_realtime_ns();
        // SAFETY: geteuid cannot fail and takes no pointers.
        let uid = unsafe { libc::geteuid() };
        let ns_dir = self
            .config
            .shm_base_dir
            .join(format!("tensorpool-{uid}"))
            .join(&self.config.shm_namespace);
        let Ok(entries) = std::fs::read_dir(ns_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let Some(stream_id) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if let Err(e) = gc_stream(&self.config, stream_id, now) {
                log::warn!("[driver] startup gc failed for stream {stream_id}: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Node ids
    // ------------------------------------------------------------------

    fn client_id_in_use(&self, client_id: u32) -> bool {
        self.leases.iter().any(|l| l.client_id == client_id)
    }

    fn node_id_in_use(&self, node_id: u32) -> bool {
        node_id != NULL_U32 && self.leases.iter().any(|l| l.node_id == node_id)
    }

    fn prune_cooldowns(&mut self, now_ns: u64) {
        self.cooldowns.retain(|c| c.expires_ns > now_ns);
    }

    fn node_id_in_cooldown(&self, node_id: u32, now_ns: u64) -> bool {
        self.cooldowns
            .iter()
            .any(|c| c.node_id == node_id && c.expires_ns > now_ns)
    }

    fn record_node_id_cooldown(&mut self, node_id: u32, now_ns: u64) {
        if node_id == 0 || node_id == NULL_U32 || self.config.node_id_reuse_cooldown_ms == 0 {
            return;
        }
        self.prune_cooldowns(now_ns);
        let expires_ns = now_ns + self.config.node_id_reuse_cooldown_ms * 1_000_000;
        if let Some(entry) = self.cooldowns.iter_mut().find(|c| c.node_id == node_id) {
            entry.expires_ns = expires_ns;
        } else {
            self.cooldowns.push(NodeIdCooldown {
                node_id,
                expires_ns,
            });
        }
    }

    fn next_rand(&mut self) -> u64 {
        // xorshift64*; good enough for node-id candidates.
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Fresh 32-bit node id: 64-bit seed folded to 32, rejecting zero,
    /// the null sentinel, in-use ids, and cooling-down ids.
    fn next_node_id(&mut self, now_ns: u64) -> Option<u32> {
        self.prune_cooldowns(now_ns);
        for _ in 0..NODE_ID_ATTEMPTS {
            let seed = self.next_rand();
            let candidate = (seed ^ (seed >> 32)) as u32;
            if candidate != 0
                && candidate != NULL_U32
                && !self.node_id_in_use(candidate)
                && !self.node_id_in_cooldown(candidate, now_ns)
            {
                return Some(candidate);
            }
        }
        None
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}
