// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! The consumer role: attach read-only, follow descriptors, read frames
//! zero-copy, and ride out lease revokes, driver shutdowns, and epoch
//! changes by re-attaching.

use std::sync::Arc;

use crate::client::driver_client::AttachOptions;
use crate::client::{AttachInfo, Client, DriverClient};
use crate::codec::{
    decode_message, ConsumerHello, Decoded, FrameDescriptor, HugepagesPolicy, Message,
    PublishMode, QosConsumer, Role, ShmPoolAnnounce,
};
use crate::error::{ErrorKind, Result, TpError};
use crate::ring::{FrameView, PoolRegion, RingConsumer};
use crate::shm::{AccessMode, FrameSlotHeader, RegionType, ShmRegion, ShmUri, HEADER_SLOT_BYTES};
use crate::transport::{FragmentAssembler, Publication, Subscription};

const LIFECYCLE_FRAGMENT_LIMIT: usize = 10;

/// Base delay before a requested re-attach; grows linearly per failure.
const REATTACH_BACKOFF_NS: u64 = 1_000_000_000;

/// Consumer construction parameters.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    pub stream_id: u32,
    pub client_id: u32,
    pub consumer_id: u32,
    pub hugepages_policy: HugepagesPolicy,
    /// Cadence of `ConsumerHello` beacons; zero disables them.
    pub hello_interval_ms: u64,
    /// Cadence of `QosConsumer` emissions; zero disables them.
    pub qos_interval_ms: u64,
}

impl ConsumerContext {
    #[must_use]
    pub fn new(stream_id: u32, client_id: u32, consumer_id: u32) -> Self {
        Self {
            stream_id,
            client_id,
            consumer_id,
            hugepages_policy: HugepagesPolicy::Unspecified,
            hello_interval_ms: 1_000,
            qos_interval_ms: 1_000,
        }
    }
}

/// Lifecycle of a consumer's mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, never attached.
    Init,
    /// Attached with the ring mapped.
    Active,
    /// Attach granted but the mapping was refused; waiting for the next
    /// epoch.
    Fallback,
    /// Mapping torn down after revoke/shutdown; re-attach pending.
    Unmapped,
}

/// Multi-reader handle for one stream.
pub struct Consumer {
    client: Arc<Client>,
    driver: DriverClient,
    context: ConsumerContext,
    descriptor_sub: Arc<dyn Subscription>,
    descriptor_assembler: FragmentAssembler,
    lifecycle_sub: Arc<dyn Subscription>,
    lifecycle_assembler: FragmentAssembler,
    announce_sub: Arc<dyn Subscription>,
    announce_assembler: FragmentAssembler,
    qos_pub: Arc<dyn Publication>,
    state: ConsumerState,
    attach: Option<AttachInfo>,
    ring: Option<RingConsumer>,
    last_announce: Option<ShmPoolAnnounce>,
    last_seq_seen: u64,
    frames_read: u64,
    drops_gap: u64,
    drops_late: u64,
    reattach_requested: bool,
    next_attach_ns: u64,
    attach_failures: u32,
    last_hello_ns: u64,
    last_qos_ns: u64,
    error_handler: Option<Box<dyn FnMut(ErrorKind, &str) + Send>>,
}

impl Consumer {
    pub fn new(client: Arc<Client>, context: ConsumerContext) -> Result<Self> {
        let channels = client.config().channels.clone();
        let timeout = client.config().driver_timeout_ns;
        let driver = DriverClient::new(Arc::clone(&client))?;
        let descriptor_sub = client.add_subscription(
            &channels.descriptor.channel,
            channels.descriptor.stream_id,
            timeout,
        )?;
        let lifecycle_sub = client.add_subscription(
            &channels.control_response.channel,
            channels.control_response.stream_id,
            timeout,
        )?;
        let announce_sub = client.add_subscription(
            &channels.announce.channel,
            channels.announce.stream_id,
            timeout,
        )?;
        let qos_pub =
            client.add_publication(&channels.qos.channel, channels.qos.stream_id, timeout)?;

        Ok(Self {
            client,
            driver,
            context,
            descriptor_sub,
            descriptor_assembler: FragmentAssembler::new(),
            lifecycle_sub,
            lifecycle_assembler: FragmentAssembler::new(),
            announce_sub,
            announce_assembler: FragmentAssembler::new(),
            qos_pub,
            state: ConsumerState::Init,
            attach: None,
            ring: None,
            last_announce: None,
            last_seq_seen: 0,
            frames_read: 0,
            drops_gap: 0,
            drops_late: 0,
            reattach_requested: false,
            next_attach_ns: 0,
            attach_failures: 0,
            last_hello_ns: 0,
            last_qos_ns: 0,
            error_handler: None,
        })
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn FnMut(ErrorKind, &str) + Send>) {
        self.error_handler = Some(handler);
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    #[must_use]
    pub fn shm_mapped(&self) -> bool {
        self.ring.is_some()
    }

    #[must_use]
    pub fn reattach_requested(&self) -> bool {
        self.reattach_requested
    }

    #[must_use]
    pub fn attach_info(&self) -> Option<&AttachInfo> {
        self.attach.as_ref()
    }

    #[must_use]
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    #[must_use]
    pub fn drops_gap(&self) -> u64 {
        self.drops_gap
    }

    #[must_use]
    pub fn drops_late(&self) -> u64 {
        self.drops_late
    }

    /// Attach read-only. A granted attach whose regions fail validation
    /// leaves the consumer in [`ConsumerState::Fallback`] to catch the
    /// next epoch.
    pub fn attach(&mut self, timeout_ns: u64) -> Result<&AttachInfo> {
        let options = AttachOptions {
            hugepages_policy: self.context.hugepages_policy,
            publish_mode: PublishMode::ExistingOrCreate,
            ..AttachOptions::new(self.context.stream_id, self.context.client_id, Role::Consumer)
        };
        let info = self.driver.attach(&options, timeout_ns)?;

        match self.map_regions(&info) {
            Ok(ring) => {
                self.ring = Some(ring);
                self.state = ConsumerState::Active;
                self.context.stream_id = info.stream_id;
                self.reattach_requested = false;
                self.attach_failures = 0;
                Ok(self.attach.insert(info))
            }
            Err(e) => {
                self.state = ConsumerState::Fallback;
                self.attach = Some(info);
                Err(TpError::invalid(format!("region validation failed: {e}")))
            }
        }
    }

    fn map_regions(&self, info: &AttachInfo) -> Result<RingConsumer> {
        let roots = self.client.allowed_roots();
        let header_uri = ShmUri::parse(&info.header_uri)?;
        let header = ShmRegion::open(&header_uri, roots, AccessMode::ReadOnly)?;
        header.validate_superblock(
            RegionType::HeaderRing,
            info.stream_id,
            info.epoch,
            0,
            HEADER_SLOT_BYTES as u32,
        )?;

        let mut pools = Vec::with_capacity(info.pools.len());
        for pool in &info.pools {
            let uri = ShmUri::parse(&pool.uri)?;
            let region = ShmRegion::open(&uri, roots, AccessMode::ReadOnly)?;
            region.validate_superblock(
                RegionType::PayloadPool,
                info.stream_id,
                info.epoch,
                pool.pool_id,
                HEADER_SLOT_BYTES as u32,
            )?;
            pools.push(PoolRegion {
                pool_id: pool.pool_id,
                stride_bytes: pool.stride_bytes,
                nslots: pool.nslots,
                region,
            });
        }
        RingConsumer::new(header, pools, info.header_nslots)
    }

    /// Drain frame descriptors for this stream; sequence gaps between
    /// consecutive descriptors are counted into `drops_gap`.
    pub fn poll_descriptors(
        &mut self,
        handler: &mut dyn FnMut(&FrameDescriptor),
        fragment_limit: usize,
    ) -> usize {
        let mut descriptors: Vec<FrameDescriptor> = Vec::new();
        let assembler = &mut self.descriptor_assembler;
        let stream_id = self.context.stream_id;
        let consumed = self.descriptor_sub.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |buffer| {
                    match decode_message(buffer) {
                        Ok(Decoded::Message(Message::FrameDescriptor(d)))
                            if d.stream_id == stream_id =>
                        {
                            descriptors.push(d);
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("[consumer] dropping bad descriptor: {e}"),
                    }
                });
            },
            fragment_limit,
        );

        for descriptor in descriptors {
            if self.last_seq_seen != 0 && descriptor.seq > self.last_seq_seen + 1 {
                self.drops_gap += descriptor.seq - self.last_seq_seen - 1;
            }
            if descriptor.seq > self.last_seq_seen {
                self.last_seq_seen = descriptor.seq;
            }
            handler(&descriptor);
        }
        consumed
    }

    /// Copying read of the frame at `seq`.
    pub fn read_frame(&mut self, seq: u64, out: &mut Vec<u8>) -> Result<FrameSlotHeader> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| TpError::invalid("consumer ring unmapped"))?;
        match ring.read_frame(seq, out) {
            Ok(header) => {
                self.frames_read += 1;
                Ok(header)
            }
            Err(e) => {
                if matches!(e, TpError::Late { .. }) {
                    self.drops_late += 1;
                }
                Err(e)
            }
        }
    }

    /// Zero-copy read of the frame at `seq`.
    pub fn with_frame<R>(&mut self, seq: u64, f: impl FnMut(&FrameView<'_>) -> R) -> Result<R> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| TpError::invalid("consumer ring unmapped"))?;
        match ring.with_frame(seq, f) {
            Ok(result) => {
                self.frames_read += 1;
                Ok(result)
            }
            Err(e) => {
                if matches!(e, TpError::Late { .. }) {
                    self.drops_late += 1;
                }
                Err(e)
            }
        }
    }

    /// One consumer pass: lifecycle, announces, keepalive, hello/QoS
    /// beacons, scheduled re-attach.
    pub fn do_work(&mut self) -> Result<usize> {
        let mut work = self.client.do_work()?;
        let now = self.client.clock().now_ns();

        work += self.poll_lifecycle();
        work += self.poll_announces();
        if self.driver.keepalive(now)? {
            work += 1;
        }
        work += self.maybe_send_hello(now)?;
        work += self.maybe_send_qos(now)?;

        if self.reattach_requested && now >= self.next_attach_ns {
            match self.attach(self.client.config().driver_timeout_ns) {
                Ok(_) => {
                    log::info!("[consumer] re-attached to stream {}", self.context.stream_id);
                    work += 1;
                }
                Err(e) => {
                    self.attach_failures += 1;
                    self.next_attach_ns =
                        now + REATTACH_BACKOFF_NS * u64::from(self.attach_failures + 1);
                    log::warn!(
                        "[consumer] re-attach failed ({e}); next try in {} ms",
                        (self.next_attach_ns - now) / 1_000_000
                    );
                }
            }
        }
        Ok(work)
    }

    /// Drain revoke/shutdown events without the rest of the duty cycle.
    /// `do_work` calls this; callers driving the consumer manually may
    /// use it to observe lifecycle transitions promptly.
    pub fn poll_lifecycle(&mut self) -> usize {
        let mut events: Vec<Message> = Vec::new();
        let assembler = &mut self.lifecycle_assembler;
        self.lifecycle_sub.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |buffer| {
                    if let Ok(Decoded::Message(message)) = decode_message(buffer) {
                        events.push(message);
                    }
                });
            },
            LIFECYCLE_FRAGMENT_LIMIT,
        );

        let mut work = 0;
        for event in events {
            match event {
                Message::LeaseRevoked(revoked) => {
                    let ours = self
                        .attach
                        .as_ref()
                        .is_some_and(|a| a.lease_id == revoked.lease_id);
                    if ours {
                        work += 1;
                        log::warn!(
                            "[consumer] lease {} revoked ({:?}), re-attach required",
                            revoked.lease_id,
                            revoked.reason
                        );
                        self.on_lifecycle_ended(ErrorKind::LeaseRevoked, &revoked.message);
                    }
                }
                Message::DriverShutdown(shutdown) => {
                    if self.attach.is_some() {
                        work += 1;
                        log::warn!("[consumer] driver shutdown, re-attach required");
                        self.on_lifecycle_ended(ErrorKind::DriverShutdown, &shutdown.message);
                    }
                }
                _ => {}
            }
        }
        work
    }

    /// Revoke and shutdown share one schedule: unmap, mark, back off.
    fn on_lifecycle_ended(&mut self, kind: ErrorKind, message: &str) {
        self.ring = None;
        self.attach = None;
        self.driver.forget_lease();
        self.state = ConsumerState::Unmapped;
        self.reattach_requested = true;
        self.attach_failures = 0;
        self.next_attach_ns = self.client.clock().now_ns() + REATTACH_BACKOFF_NS;
        if let Some(handler) = &mut self.error_handler {
            handler(kind, message);
        }
    }

    fn poll_announces(&mut self) -> usize {
        let mut announces: Vec<ShmPoolAnnounce> = Vec::new();
        let assembler = &mut self.announce_assembler;
        let stream_id = self.context.stream_id;
        self.announce_sub.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |buffer| {
                    if let Ok(Decoded::Message(Message::ShmPoolAnnounce(announce))) =
                        decode_message(buffer)
                    {
                        if stream_id == 0 || announce.stream_id == stream_id {
                            announces.push(announce);
                        }
                    }
                });
            },
            LIFECYCLE_FRAGMENT_LIMIT,
        );

        let mut work = 0;
        for announce in announces {
            let newer = self
                .last_announce
                .as_ref()
                .is_none_or(|last| announce.epoch > last.epoch);
            if newer {
                work += 1;
                let mapped_epoch = self.attach.as_ref().map(|a| a.epoch);
                if self.state == ConsumerState::Fallback
                    && mapped_epoch.is_some_and(|e| announce.epoch > e)
                {
                    // A fresh epoch may map cleanly; schedule a retry.
                    self.reattach_requested = true;
                }
                self.last_announce = Some(announce);
            }
        }
        work
    }

    /// Most recent announce observed for this stream.
    #[must_use]
    pub fn last_announce(&self) -> Option<&ShmPoolAnnounce> {
        self.last_announce.as_ref()
    }

    fn maybe_send_hello(&mut self, now_ns: u64) -> Result<usize> {
        if self.context.hello_interval_ms == 0 || self.attach.is_none() {
            return Ok(0);
        }
        let interval_ns = self.context.hello_interval_ms * 1_000_000;
        if now_ns < self.last_hello_ns + interval_ns {
            return Ok(0);
        }
        self.last_hello_ns = now_ns;
        let epoch = self.attach.as_ref().map_or(0, |a| a.epoch);
        let hello = Message::ConsumerHello(ConsumerHello {
            epoch,
            timestamp_ns: self.client.clock().now_realtime_ns(),
            stream_id: self.context.stream_id,
            consumer_id: self.context.consumer_id,
        });
        self.driver.offer_control(&hello)?;
        Ok(1)
    }

    fn maybe_send_qos(&mut self, now_ns: u64) -> Result<usize> {
        if self.context.qos_interval_ms == 0 || self.attach.is_none() {
            return Ok(0);
        }
        let interval_ns = self.context.qos_interval_ms * 1_000_000;
        if now_ns < self.last_qos_ns + interval_ns {
            return Ok(0);
        }
        self.last_qos_ns = now_ns;
        let epoch = self.attach.as_ref().map_or(0, |a| a.epoch);
        let qos = Message::QosConsumer(QosConsumer {
            epoch,
            timestamp_ns: self.client.clock().now_realtime_ns(),
            frames_read: self.frames_read,
            drops_gap: self.drops_gap,
            drops_late: self.drops_late,
            stream_id: self.context.stream_id,
            consumer_id: self.context.consumer_id,
        });
        self.qos_pub.offer(&qos.encode()?)?;
        Ok(1)
    }

    /// Detach cleanly, dropping the ring mapping.
    pub fn close(&mut self, timeout_ns: u64) -> Result<()> {
        self.ring = None;
        self.attach = None;
        self.state = ConsumerState::Init;
        if self.driver.attached() {
            self.driver.detach(timeout_ns)?;
        }
        Ok(())
    }
}
