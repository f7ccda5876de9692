// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! The producer role: attach as the stream's single writer, publish
//! frames into the ring, and emit descriptors, progress, QoS, metadata,
//! and trace links on the side channels.

use std::sync::Arc;

use crate::client::driver_client::AttachOptions;
use crate::client::{AttachInfo, Client, DriverClient};
use crate::codec::{
    decode_message, DataSourceAnnounce, DataSourceMeta, Decoded, FrameDescriptor, FrameProgress,
    HugepagesPolicy, Message, MetaAttribute, ProgressState, PublishMode, QosProducer, Role,
    SequenceMergeMap, TimestampMergeMap, TraceLinkSet,
};
use crate::error::{ErrorKind, Result, TpError};
use crate::ring::{PoolRegion, RingProducer};
use crate::shm::{AccessMode, RegionType, ShmRegion, ShmUri, TensorHeader, HEADER_SLOT_BYTES};
use crate::transport::{FragmentAssembler, Publication, Subscription};

const LIFECYCLE_FRAGMENT_LIMIT: usize = 10;

/// Producer construction parameters.
#[derive(Debug, Clone)]
pub struct ProducerContext {
    /// Zero asks the driver to allocate a dynamic stream.
    pub stream_id: u32,
    pub client_id: u32,
    pub publish_mode: PublishMode,
    pub hugepages_policy: HugepagesPolicy,
    /// Cadence of `QosProducer` emissions; zero disables them.
    pub qos_interval_ms: u64,
}

impl ProducerContext {
    #[must_use]
    pub fn new(stream_id: u32, client_id: u32) -> Self {
        Self {
            stream_id,
            client_id,
            publish_mode: PublishMode::ExistingOrCreate,
            hugepages_policy: HugepagesPolicy::Unspecified,
            qos_interval_ms: 1_000,
        }
    }
}

/// Per-frame metadata supplied at publish time.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMetadata {
    pub timestamp_ns: u64,
    pub meta_version: u32,
}

/// Single-writer handle for one stream.
pub struct Producer {
    client: Arc<Client>,
    driver: DriverClient,
    context: ProducerContext,
    descriptor_pub: Arc<dyn Publication>,
    qos_pub: Arc<dyn Publication>,
    metadata_pub: Arc<dyn Publication>,
    lifecycle_sub: Arc<dyn Subscription>,
    lifecycle_assembler: FragmentAssembler,
    request_sub: Arc<dyn Subscription>,
    request_assembler: FragmentAssembler,
    attach: Option<AttachInfo>,
    ring: Option<RingProducer>,
    tracelink_cache: Vec<Option<TraceLinkSet>>,
    tracelink_validator: Option<Box<dyn Fn(&TraceLinkSet) -> bool + Send>>,
    announced_sequence_map: Option<SequenceMergeMap>,
    announced_timestamp_map: Option<TimestampMergeMap>,
    cached_announce: Option<DataSourceAnnounce>,
    cached_meta: Option<DataSourceMeta>,
    frames_published: u64,
    bytes_published: u64,
    publish_errors: u64,
    last_qos_ns: u64,
    reattach_requested: bool,
    error_handler: Option<Box<dyn FnMut(ErrorKind, &str) + Send>>,
}

impl Producer {
    pub fn new(client: Arc<Client>, context: ProducerContext) -> Result<Self> {
        let channels = client.config().channels.clone();
        let timeout = client.config().driver_timeout_ns;
        let driver = DriverClient::new(Arc::clone(&client))?;
        let descriptor_pub = client.add_publication(
            &channels.descriptor.channel,
            channels.descriptor.stream_id,
            timeout,
        )?;
        let qos_pub =
            client.add_publication(&channels.qos.channel, channels.qos.stream_id, timeout)?;
        let metadata_pub = client.add_publication(
            &channels.metadata.channel,
            channels.metadata.stream_id,
            timeout,
        )?;
        let lifecycle_sub = client.add_subscription(
            &channels.control_response.channel,
            channels.control_response.stream_id,
            timeout,
        )?;
        let request_sub = client.add_subscription(
            &channels.metadata.channel,
            channels.metadata.stream_id,
            timeout,
        )?;

        Ok(Self {
            client,
            driver,
            context,
            descriptor_pub,
            qos_pub,
            metadata_pub,
            lifecycle_sub,
            lifecycle_assembler: FragmentAssembler::new(),
            request_sub,
            request_assembler: FragmentAssembler::new(),
            attach: None,
            ring: None,
            tracelink_cache: Vec::new(),
            tracelink_validator: None,
            announced_sequence_map: None,
            announced_timestamp_map: None,
            cached_announce: None,
            cached_meta: None,
            frames_published: 0,
            bytes_published: 0,
            publish_errors: 0,
            last_qos_ns: 0,
            reattach_requested: false,
            error_handler: None,
        })
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn FnMut(ErrorKind, &str) + Send>) {
        self.error_handler = Some(handler);
    }

    pub fn set_tracelink_validator(
        &mut self,
        validator: Box<dyn Fn(&TraceLinkSet) -> bool + Send>,
    ) {
        self.tracelink_validator = Some(validator);
    }

    #[must_use]
    pub fn attach_info(&self) -> Option<&AttachInfo> {
        self.attach.as_ref()
    }

    #[must_use]
    pub fn reattach_requested(&self) -> bool {
        self.reattach_requested
    }

    #[must_use]
    pub fn next_seq(&self) -> Option<u64> {
        self.ring.as_ref().map(RingProducer::next_seq)
    }

    /// Attach as producer and map the new epoch's regions read-write.
    pub fn attach(&mut self, timeout_ns: u64) -> Result<&AttachInfo> {
        let options = AttachOptions {
            publish_mode: self.context.publish_mode,
            hugepages_policy: self.context.hugepages_policy,
            ..AttachOptions::new(self.context.stream_id, self.context.client_id, Role::Producer)
        };
        let info = self.driver.attach(&options, timeout_ns)?;

        let roots = self.client.allowed_roots();
        let header_uri = ShmUri::parse(&info.header_uri)?;
        let header = ShmRegion::open(&header_uri, roots, AccessMode::ReadWrite)?;
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
            let region = ShmRegion::open(&uri, roots, AccessMode::ReadWrite)?;
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

        self.ring = Some(RingProducer::new(header, pools, info.header_nslots)?);
        self.tracelink_cache = vec![None; info.header_nslots as usize];
        self.context.stream_id = info.stream_id;
        self.reattach_requested = false;
        Ok(self.attach.insert(info))
    }

    fn attached(&self) -> Result<(&AttachInfo, u64)> {
        let info = self
            .attach
            .as_ref()
            .ok_or_else(|| TpError::invalid("producer not attached"))?;
        Ok((info, info.epoch))
    }

    /// Publish one frame and announce it with a `FrameDescriptor`.
    pub fn offer_frame(
        &mut self,
        tensor: &TensorHeader,
        payload: &[u8],
        metadata: &FrameMetadata,
    ) -> Result<u64> {
        let (stream_id, epoch) = {
            let (info, epoch) = self.attached()?;
            (info.stream_id, epoch)
        };
        let ring = self
            .ring
            .as_mut()
            .ok_or_else(|| TpError::invalid("producer ring unmapped"))?;

        let pool_id = ring.pick_pool(payload.len())?;
        let timestamp_ns = if metadata.timestamp_ns == 0 {
            self.client.clock().now_realtime_ns()
        } else {
            metadata.timestamp_ns
        };
        let published = match ring.publish(
            tensor,
            timestamp_ns,
            metadata.meta_version,
            pool_id,
            payload,
        ) {
            Ok(published) => published,
            Err(e) => {
                self.publish_errors += 1;
                return Err(e);
            }
        };

        let descriptor = Message::FrameDescriptor(FrameDescriptor {
            epoch,
            seq: published.seq,
            timestamp_ns,
            stream_id,
            slot_index: published.slot_index,
            payload_offset: published.payload_offset,
            values_len_bytes: published.values_len_bytes,
            meta_version: metadata.meta_version,
            pool_id: published.pool_id,
        });
        self.descriptor_pub.offer(&descriptor.encode()?)?;

        self.frames_published += 1;
        self.bytes_published += u64::from(published.values_len_bytes);
        Ok(published.seq)
    }

    /// Report fill progress for an in-flight frame.
    pub fn send_progress(&mut self, seq: u64, bytes_filled: u64, state: ProgressState) -> Result<()> {
        let (info, epoch) = self.attached()?;
        let message = Message::FrameProgress(FrameProgress {
            epoch,
            seq,
            payload_bytes_filled: bytes_filled,
            stream_id: info.stream_id,
            state,
        });
        self.descriptor_pub.offer(&message.encode()?)
    }

    /// Announce the data source (cached for re-emission).
    pub fn announce_source(&mut self, name: &str, meta_version: u32) -> Result<()> {
        let (info, epoch) = self.attached()?;
        let announce = DataSourceAnnounce {
            epoch,
            stream_id: info.stream_id,
            meta_version,
            name: name.to_string(),
        };
        self.metadata_pub
            .offer(&Message::DataSourceAnnounce(announce.clone()).encode()?)?;
        self.cached_announce = Some(announce);
        Ok(())
    }

    /// Publish versioned metadata attributes (cached for re-emission).
    pub fn publish_meta(&mut self, meta_version: u32, attributes: Vec<MetaAttribute>) -> Result<()> {
        let (info, epoch) = self.attached()?;
        let meta = DataSourceMeta {
            epoch,
            stream_id: info.stream_id,
            meta_version,
            attributes,
        };
        self.metadata_pub
            .offer(&Message::DataSourceMeta(meta.clone()).encode()?)?;
        self.cached_meta = Some(meta);
        Ok(())
    }

    /// Announce a sequence merge map for a downstream join.
    pub fn announce_sequence_merge_map(&mut self, map: SequenceMergeMap) -> Result<()> {
        self.metadata_pub
            .offer(&Message::SequenceMergeMap(map.clone()).encode()?)?;
        self.announced_sequence_map = Some(map);
        Ok(())
    }

    /// Announce a timestamp merge map for a downstream join.
    pub fn announce_timestamp_merge_map(&mut self, map: TimestampMergeMap) -> Result<()> {
        self.metadata_pub
            .offer(&Message::TimestampMergeMap(map.clone()).encode()?)?;
        self.announced_timestamp_map = Some(map);
        Ok(())
    }

    /// Publish a trace-link set; validated, cached per ring slot.
    pub fn send_tracelink_set(&mut self, set: TraceLinkSet) -> Result<()> {
        if let Some(validator) = &self.tracelink_validator {
            if !validator(&set) {
                return Err(TpError::invalid("trace link rejected by validator"));
            }
        }
        let bytes = Message::TraceLinkSet(set.clone()).encode()?;
        self.metadata_pub.offer(&bytes)?;
        if !self.tracelink_cache.is_empty() {
            let index = (set.seq as usize) & (self.tracelink_cache.len() - 1);
            self.tracelink_cache[index] = Some(set);
        }
        Ok(())
    }

    /// Cached trace-link set for `seq`, if it has not been lapped.
    #[must_use]
    pub fn tracelink_for(&self, seq: u64) -> Option<&TraceLinkSet> {
        if self.tracelink_cache.is_empty() {
            return None;
        }
        self.tracelink_cache[(seq as usize) & (self.tracelink_cache.len() - 1)]
            .as_ref()
            .filter(|set| set.seq == seq)
    }

    /// Detach cleanly, dropping the ring mapping.
    pub fn close(&mut self, timeout_ns: u64) -> Result<()> {
        self.ring = None;
        self.attach = None;
        if self.driver.attached() {
            self.driver.detach(timeout_ns)?;
        }
        Ok(())
    }

    /// One producer pass: keepalive, lifecycle events, merge-map
    /// requests, periodic QoS.
    pub fn do_work(&mut self) -> Result<usize> {
        let mut work = self.client.do_work()?;
        let now = self.client.clock().now_ns();

        if self.driver.keepalive(now)? {
            work += 1;
        }
        work += self.poll_lifecycle();
        work += self.poll_requests();
        work += self.maybe_send_qos(now)?;
        Ok(work)
    }

    fn poll_lifecycle(&mut self) -> usize {
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
                            "[producer] lease {} revoked ({:?}), re-attach required",
                            revoked.lease_id,
                            revoked.reason
                        );
                        self.on_lifecycle_ended(ErrorKind::LeaseRevoked, &revoked.message);
                    }
                }
                Message::DriverShutdown(shutdown) => {
                    if self.attach.is_some() {
                        work += 1;
                        log::warn!("[producer] driver shutdown, re-attach required");
                        self.on_lifecycle_ended(ErrorKind::DriverShutdown, &shutdown.message);
                    }
                }
                _ => {}
            }
        }
        work
    }

    fn on_lifecycle_ended(&mut self, kind: ErrorKind, message: &str) {
        self.ring = None;
        self.attach = None;
        self.driver.forget_lease();
        self.reattach_requested = true;
        if let Some(handler) = &mut self.error_handler {
            handler(kind, message);
        }
    }

    fn poll_requests(&mut self) -> usize {
        let mut requests: Vec<Message> = Vec::new();
        let assembler = &mut self.request_assembler;
        self.request_sub.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |buffer| {
                    if let Ok(Decoded::Message(message)) = decode_message(buffer) {
                        requests.push(message);
                    }
                });
            },
            LIFECYCLE_FRAGMENT_LIMIT,
        );

        let mut work = 0;
        for request in requests {
            match request {
                Message::SequenceMergeMapRequest(request) => {
                    if let Some(map) = self
                        .announced_sequence_map
                        .clone()
                        .filter(|m| m.out_stream_id == request.out_stream_id)
                    {
                        work += 1;
                        if let Err(e) = self.announce_sequence_merge_map(map) {
                            log::warn!("[producer] merge map re-announce failed: {e}");
                        }
                    }
                }
                Message::TimestampMergeMapRequest(request) => {
                    if let Some(map) = self
                        .announced_timestamp_map
                        .clone()
                        .filter(|m| m.out_stream_id == request.out_stream_id)
                    {
                        work += 1;
                        if let Err(e) = self.announce_timestamp_merge_map(map) {
                            log::warn!("[producer] merge map re-announce failed: {e}");
                        }
                    }
                }
                _ => {}
            }
        }
        work
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
        let (info, epoch) = self.attached()?;
        let qos = Message::QosProducer(QosProducer {
            epoch,
            timestamp_ns: self.client.clock().now_realtime_ns(),
            frames_published: self.frames_published,
            bytes_published: self.bytes_published,
            errors: self.publish_errors,
            stream_id: info.stream_id,
        });
        self.qos_pub.offer(&qos.encode()?)?;
        Ok(1)
    }
}
