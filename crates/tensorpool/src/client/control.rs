// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Control demux: routes decoded control-plane messages to handlers and
//! keeps join barriers and the merge-map registry fed.
//!
//! One poller serves one subscription. Unknown templates and foreign
//! schemas are dropped (the former at WARN); handler slots left empty
//! simply ignore their message kind.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::barrier::{JoinBarrier, MergeMapRegistry};
use crate::clock::Clock;
use crate::codec::{
    decode_message, ConsumerConfig, ConsumerHello, DataSourceAnnounce, Decoded, DetachResponse,
    DriverShutdown, LeaseRevoked, Message, MetaAttribute, SequenceMergeMap, ShmPoolAnnounce,
    TimestampMergeMap, TraceLinkSet,
};
use crate::transport::{FragmentAssembler, Subscription};

type Handler<T> = Option<Box<dyn FnMut(&T) + Send>>;

/// Callback set for the control demux. Every slot is optional.
#[derive(Default)]
pub struct ControlHandlers {
    pub on_shm_pool_announce: Handler<ShmPoolAnnounce>,
    pub on_consumer_hello: Handler<ConsumerHello>,
    pub on_consumer_config: Handler<ConsumerConfig>,
    pub on_detach_response: Handler<DetachResponse>,
    pub on_lease_revoked: Handler<LeaseRevoked>,
    pub on_shutdown: Handler<DriverShutdown>,
    pub on_data_source_announce: Handler<DataSourceAnnounce>,
    pub on_data_source_meta_begin: Option<Box<dyn FnMut(u32, u64, u32) + Send>>,
    pub on_data_source_meta_attr: Handler<MetaAttribute>,
    pub on_data_source_meta_end: Option<Box<dyn FnMut(u32, u64, u32) + Send>>,
    pub on_sequence_merge_map: Handler<SequenceMergeMap>,
    pub on_timestamp_merge_map: Handler<TimestampMergeMap>,
    pub on_tracelink_set: Handler<TraceLinkSet>,
}

/// Demultiplexing poller over one control subscription.
pub struct ControlPoller {
    subscription: Arc<dyn Subscription>,
    assembler: FragmentAssembler,
    handlers: ControlHandlers,
    clock: Arc<dyn Clock>,
    registry: Option<Arc<Mutex<MergeMapRegistry>>>,
    sequence_barrier: Option<Arc<Mutex<JoinBarrier>>>,
    timestamp_barrier: Option<Arc<Mutex<JoinBarrier>>>,
    latest_barrier: Option<Arc<Mutex<JoinBarrier>>>,
}

impl ControlPoller {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        handlers: ControlHandlers,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            subscription,
            assembler: FragmentAssembler::new(),
            handlers,
            clock,
            registry: None,
            sequence_barrier: None,
            timestamp_barrier: None,
            latest_barrier: None,
        }
    }

    /// Announced merge maps get upserted here.
    pub fn set_registry(&mut self, registry: Arc<Mutex<MergeMapRegistry>>) {
        self.registry = Some(registry);
    }

    /// Sequence announces are applied to this barrier.
    pub fn set_sequence_barrier(&mut self, barrier: Arc<Mutex<JoinBarrier>>) {
        self.sequence_barrier = Some(barrier);
    }

    /// Timestamp announces are applied to this barrier.
    pub fn set_timestamp_barrier(&mut self, barrier: Arc<Mutex<JoinBarrier>>) {
        self.timestamp_barrier = Some(barrier);
    }

    /// Both announce kinds re-arm this latest-value barrier.
    pub fn set_latest_barrier(&mut self, barrier: Arc<Mutex<JoinBarrier>>) {
        self.latest_barrier = Some(barrier);
    }

    /// Drain up to `fragment_limit` fragments; returns fragments consumed.
    pub fn poll(&mut self, fragment_limit: usize) -> usize {
        let mut buffers: Vec<Vec<u8>> = Vec::new();
        let assembler = &mut self.assembler;
        let consumed = self.subscription.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |msg| buffers.push(msg.to_vec()));
            },
            fragment_limit,
        );
        for buffer in buffers {
            self.dispatch(&buffer);
        }
        consumed
    }

    /// Dispatch one reassembled message (also the fuzzing entry point).
    pub fn dispatch(&mut self, buffer: &[u8]) {
        match decode_message(buffer) {
            Ok(Decoded::Message(message)) => self.on_message(message),
            Ok(Decoded::NotOurs) => {}
            Ok(Decoded::UnknownTemplate(template_id)) => {
                log::warn!("[control] unknown template {template_id}, dropping");
            }
            Err(e) => log::warn!("[control] dropping invalid message: {e}"),
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::ShmPoolAnnounce(announce) => {
                if let Some(handler) = &mut self.handlers.on_shm_pool_announce {
                    handler(&announce);
                }
            }
            Message::ConsumerHello(hello) => {
                if let Some(handler) = &mut self.handlers.on_consumer_hello {
                    handler(&hello);
                }
            }
            Message::ConsumerConfig(config) => {
                if let Some(handler) = &mut self.handlers.on_consumer_config {
                    handler(&config);
                }
            }
            Message::DetachResponse(response) => {
                if let Some(handler) = &mut self.handlers.on_detach_response {
                    handler(&response);
                }
            }
            Message::LeaseRevoked(revoked) => {
                if let Some(handler) = &mut self.handlers.on_lease_revoked {
                    handler(&revoked);
                }
            }
            Message::DriverShutdown(shutdown) => {
                if let Some(handler) = &mut self.handlers.on_shutdown {
                    handler(&shutdown);
                }
            }
            Message::DataSourceAnnounce(announce) => {
                if let Some(handler) = &mut self.handlers.on_data_source_announce {
                    handler(&announce);
                }
            }
            Message::DataSourceMeta(meta) => {
                if let Some(begin) = &mut self.handlers.on_data_source_meta_begin {
                    begin(meta.stream_id, meta.epoch, meta.meta_version);
                }
                if let Some(attr) = &mut self.handlers.on_data_source_meta_attr {
                    for attribute in &meta.attributes {
                        attr(attribute);
                    }
                }
                if let Some(end) = &mut self.handlers.on_data_source_meta_end {
                    end(meta.stream_id, meta.epoch, meta.meta_version);
                }
            }
            Message::SequenceMergeMap(map) => self.on_sequence_map(map),
            Message::TimestampMergeMap(map) => self.on_timestamp_map(map),
            Message::TraceLinkSet(set) => {
                if let Some(handler) = &mut self.handlers.on_tracelink_set {
                    handler(&set);
                }
            }
            other => {
                log::debug!("[control] ignoring template {}", other.template_id());
            }
        }
    }

    fn on_sequence_map(&mut self, map: SequenceMergeMap) {
        let now = self.clock.now_ns();
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.lock().upsert_sequence(&map, now) {
                log::warn!("[control] sequence map upsert failed: {e}");
            }
        }
        if let Some(barrier) = &self.sequence_barrier {
            if let Err(e) = barrier.lock().apply_sequence_map(&map) {
                log::warn!("[control] sequence map apply failed: {e}");
            }
        }
        if let Some(barrier) = &self.latest_barrier {
            if let Err(e) = barrier.lock().apply_latest_value_sequence_map(&map) {
                log::warn!("[control] latest-value map apply failed: {e}");
            }
        }
        if let Some(handler) = &mut self.handlers.on_sequence_merge_map {
            handler(&map);
        }
    }

    fn on_timestamp_map(&mut self, map: TimestampMergeMap) {
        let now = self.clock.now_ns();
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.lock().upsert_timestamp(&map, now) {
                log::warn!("[control] timestamp map upsert failed: {e}");
            }
        }
        if let Some(barrier) = &self.timestamp_barrier {
            if let Err(e) = barrier.lock().apply_timestamp_map(&map) {
                log::warn!("[control] timestamp map apply failed: {e}");
            }
        }
        if let Some(barrier) = &self.latest_barrier {
            if let Err(e) = barrier.lock().apply_latest_value_timestamp_map(&map) {
                log::warn!("[control] latest-value map apply failed: {e}");
            }
        }
        if let Some(handler) = &mut self.handlers.on_timestamp_merge_map {
            handler(&map);
        }
    }
}

impl crate::client::Poller for ControlPoller {
    fn poll(&mut self, fragment_limit: usize) -> usize {
        ControlPoller::poll(self, fragment_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::BarrierKind;
    use crate::clock::MonotonicClock;
    use crate::codec::{MergeRuleType, SequenceMergeRule, NULL_U64};
    use crate::transport::{LoopbackBus, MessageTransport, Publication};

    fn poller_pair(handlers: ControlHandlers) -> (ControlPoller, Arc<dyn Publication>) {
        let bus = LoopbackBus::new();
        let subscription = bus
            .add_subscription("control", 1)
            .expect("add failed")
            .poll()
            .expect("poll failed")
            .expect("not immediate");
        let publication = bus
            .add_publication("control", 1)
            .expect("add failed")
            .poll()
            .expect("poll failed")
            .expect("not immediate");
        (
            ControlPoller::new(subscription, handlers, Arc::new(MonotonicClock)),
            publication,
        )
    }

    fn sequence_map() -> SequenceMergeMap {
        SequenceMergeMap {
            out_stream_id: 30,
            epoch: 4,
            stale_timeout_ns: NULL_U64,
            rules: vec![SequenceMergeRule {
                input_stream_id: 10,
                rule_type: MergeRuleType::Offset,
                offset: 0,
                window_size: 0,
            }],
        }
    }

    #[test]
    fn test_announce_routed_to_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let handlers = ControlHandlers {
            on_shm_pool_announce: Some(Box::new(move |a: &ShmPoolAnnounce| {
                seen_in.lock().push(a.epoch);
            })),
            ..ControlHandlers::default()
        };
        let (mut poller, publication) = poller_pair(handlers);

        let announce = Message::ShmPoolAnnounce(ShmPoolAnnounce {
            epoch: 9,
            timestamp_ns: 0,
            stream_id: 7,
            layout_version: 1,
            header_nslots: 4,
            header_slot_bytes: 128,
            require_hugepages: false,
            clock_domain: 0,
            header_uri: "shm:file?path=/x|require_hugepages=false".to_string(),
            pools: Vec::new(),
        });
        publication
            .offer(&announce.encode().expect("encode failed"))
            .expect("offer failed");
        poller.poll(10);
        assert_eq!(*seen.lock(), vec![9]);
    }

    #[test]
    fn test_merge_map_feeds_registry_and_barrier() {
        let (mut poller, publication) = poller_pair(ControlHandlers::default());
        let registry = Arc::new(Mutex::new(MergeMapRegistry::new(4).expect("new failed")));
        let barrier = Arc::new(Mutex::new(
            JoinBarrier::new(BarrierKind::Sequence, 4).expect("new failed"),
        ));
        poller.set_registry(Arc::clone(&registry));
        poller.set_sequence_barrier(Arc::clone(&barrier));

        let map = sequence_map();
        publication
            .offer(
                &Message::SequenceMergeMap(map.clone())
                    .encode()
                    .expect("encode failed"),
            )
            .expect("offer failed");
        poller.poll(10);

        assert!(registry.lock().find_sequence(30, 4).is_some());
        assert_eq!(barrier.lock().epoch(), 4);
        assert_eq!(barrier.lock().rule_count(), 1);
    }

    #[test]
    fn test_invalid_message_dropped_not_fatal() {
        let (mut poller, publication) = poller_pair(ControlHandlers::default());
        publication.offer(&[0xFF; 6]).expect("offer failed");
        poller.poll(10);

        // Still alive for valid traffic afterwards.
        let map = sequence_map();
        publication
            .offer(&Message::SequenceMergeMap(map).encode().expect("encode failed"))
            .expect("offer failed");
        assert_eq!(poller.poll(10), 1);
    }

    #[test]
    fn test_meta_begin_attr_end_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let begin_events = Arc::clone(&events);
        let attr_events = Arc::clone(&events);
        let end_events = Arc::clone(&events);
        let handlers = ControlHandlers {
            on_data_source_meta_begin: Some(Box::new(move |_, _, v| {
                begin_events.lock().push(format!("begin:{v}"));
            })),
            on_data_source_meta_attr: Some(Box::new(move |a: &MetaAttribute| {
                attr_events.lock().push(format!("attr:{}", a.key));
            })),
            on_data_source_meta_end: Some(Box::new(move |_, _, v| {
                end_events.lock().push(format!("end:{v}"));
            })),
            ..ControlHandlers::default()
        };
        let (mut poller, publication) = poller_pair(handlers);

        let meta = Message::DataSourceMeta(crate::codec::DataSourceMeta {
            epoch: 1,
            stream_id: 7,
            meta_version: 3,
            attributes: vec![
                MetaAttribute {
                    key: "a".to_string(),
                    value: "1".to_string(),
                },
                MetaAttribute {
                    key: "b".to_string(),
                    value: "2".to_string(),
                },
            ],
        });
        publication
            .offer(&meta.encode().expect("encode failed"))
            .expect("offer failed");
        poller.poll(10);
        assert_eq!(
            *events.lock(),
            vec!["begin:3", "attr:a", "attr:b", "end:3"]
        );
    }
}
