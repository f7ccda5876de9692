// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! In-process loopback bus.
//!
//! Fans every published message out to all subscribers of the same
//! (channel, stream id), fragmenting at [`LoopbackBus::max_fragment`]
//! bytes. Delivery is per-publication FIFO. Used by the test suite and
//! the listener tools; production deployments plug a real transport into
//! [`MessageTransport`] instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{
    MessageTransport, PendingPublication, PendingSubscription, Publication, Subscription,
    FRAGMENT_BEGIN, FRAGMENT_END, FRAGMENT_UNFRAGMENTED,
};
use crate::error::{Result, TpError};

const DEFAULT_MAX_FRAGMENT: usize = 1024;

#[derive(Debug, Clone)]
struct Fragment {
    flags: u8,
    data: Vec<u8>,
}

struct SubscriberEntry {
    id: u64,
    sender: Sender<Fragment>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: RwLock<Vec<SubscriberEntry>>,
    publishers: AtomicU64,
}

struct BusInner {
    channels: DashMap<(String, u32), Arc<ChannelState>>,
    next_subscriber_id: AtomicU64,
    max_fragment: usize,
}

/// Process-local loopback implementation of [`MessageTransport`].
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl LoopbackBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_fragment(DEFAULT_MAX_FRAGMENT)
    }

    /// Bus with a specific fragment payload limit (tests exercise small
    /// limits to force reassembly).
    #[must_use]
    pub fn with_max_fragment(max_fragment: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: DashMap::new(),
                next_subscriber_id: AtomicU64::new(1),
                max_fragment: max_fragment.max(1),
            }),
        }
    }

    fn channel_state(&self, channel: &str, stream_id: u32) -> Arc<ChannelState> {
        self.inner
            .channels
            .entry((channel.to_string(), stream_id))
            .or_default()
            .clone()
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTransport for LoopbackBus {
    fn add_publication(
        &self,
        channel: &str,
        stream_id: u32,
    ) -> Result<Box<dyn PendingPublication>> {
        let state = self.channel_state(channel, stream_id);
        state.publishers.fetch_add(1, Ordering::AcqRel);
        let publication: Arc<dyn Publication> = Arc::new(LoopbackPublication {
            state,
            channel: channel.to_string(),
            stream_id,
            max_fragment: self.inner.max_fragment,
        });
        Ok(Box::new(ImmediatePublication {
            publication: Some(publication),
        }))
    }

    fn add_subscription(
        &self,
        channel: &str,
        stream_id: u32,
    ) -> Result<Box<dyn PendingSubscription>> {
        let state = self.channel_state(channel, stream_id);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded();
        state.subscribers.write().push(SubscriberEntry { id, sender });
        let subscription: Arc<dyn Subscription> = Arc::new(LoopbackSubscription {
            state,
            receiver,
            id,
            channel: channel.to_string(),
            stream_id,
        });
        Ok(Box::new(ImmediateSubscription {
            subscription: Some(subscription),
        }))
    }

    fn max_fragment_payload(&self) -> usize {
        self.inner.max_fragment
    }
}

/// Loopback adds complete on the first poll.
struct ImmediatePublication {
    publication: Option<Arc<dyn Publication>>,
}

impl PendingPublication for ImmediatePublication {
    fn poll(&mut self) -> Result<Option<Arc<dyn Publication>>> {
        Ok(self.publication.take())
    }
}

struct ImmediateSubscription {
    subscription: Option<Arc<dyn Subscription>>,
}

impl PendingSubscription for ImmediateSubscription {
    fn poll(&mut self) -> Result<Option<Arc<dyn Subscription>>> {
        Ok(self.subscription.take())
    }
}

struct LoopbackPublication {
    state: Arc<ChannelState>,
    channel: String,
    stream_id: u32,
    max_fragment: usize,
}

impl Publication for LoopbackPublication {
    fn offer(&self, message: &[u8]) -> Result<()> {
        if message.is_empty() {
            return Err(TpError::invalid("cannot offer an empty message"));
        }

        let subscribers = self.state.subscribers.read();
        let chunks: Vec<&[u8]> = message.chunks(self.max_fragment).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let flags = if chunks.len() == 1 {
                FRAGMENT_UNFRAGMENTED
            } else if i == 0 {
                FRAGMENT_BEGIN
            } else if i == last {
                FRAGMENT_END
            } else {
                0
            };
            for sub in subscribers.iter() {
                // A disconnected receiver just means the subscriber went
                // away between cleanup passes.
                let _ = sub.sender.send(Fragment {
                    flags,
                    data: chunk.to_vec(),
                });
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.state.subscribers.read().is_empty()
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl Drop for LoopbackPublication {
    fn drop(&mut self) {
        self.state.publishers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct LoopbackSubscription {
    state: Arc<ChannelState>,
    receiver: Receiver<Fragment>,
    id: u64,
    channel: String,
    stream_id: u32,
}

impl Subscription for LoopbackSubscription {
    fn poll(&self, handler: &mut dyn FnMut(u8, &[u8]), fragment_limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < fragment_limit {
            match self.receiver.try_recv() {
                Ok(fragment) => {
                    handler(fragment.flags, &fragment.data);
                    delivered += 1;
                }
                Err(_) => break,
            }
        }
        delivered
    }

    fn is_connected(&self) -> bool {
        self.state.publishers.load(Ordering::Acquire) > 0
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl Drop for LoopbackSubscription {
    fn drop(&mut self) {
        self.state.subscribers.write().retain(|s| s.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FragmentAssembler;

    fn complete_pub(mut pending: Box<dyn PendingPublication>) -> Arc<dyn Publication> {
        pending.poll().expect("poll failed").expect("not immediate")
    }

    fn complete_sub(mut pending: Box<dyn PendingSubscription>) -> Arc<dyn Subscription> {
        pending.poll().expect("poll failed").expect("not immediate")
    }

    #[test]
    fn test_pub_sub_connectivity() {
        let bus = LoopbackBus::new();
        let publication = complete_pub(bus.add_publication("control", 100).expect("add failed"));
        assert!(!publication.is_connected());

        let subscription =
            complete_sub(bus.add_subscription("control", 100).expect("add failed"));
        assert!(publication.is_connected());
        assert!(subscription.is_connected());

        drop(publication);
        assert!(!subscription.is_connected());
    }

    #[test]
    fn test_fanout_to_all_subscribers() {
        let bus = LoopbackBus::new();
        let sub_a = complete_sub(bus.add_subscription("announce", 1).expect("add failed"));
        let sub_b = complete_sub(bus.add_subscription("announce", 1).expect("add failed"));
        let publication = complete_pub(bus.add_publication("announce", 1).expect("add failed"));

        publication.offer(b"epoch-5").expect("offer failed");

        for sub in [&sub_a, &sub_b] {
            let mut seen = Vec::new();
            sub.poll(&mut |_, data| seen.push(data.to_vec()), 10);
            assert_eq!(seen, vec![b"epoch-5".to_vec()]);
        }
    }

    #[test]
    fn test_streams_are_isolated() {
        let bus = LoopbackBus::new();
        let sub = complete_sub(bus.add_subscription("c", 1).expect("add failed"));
        let other = complete_pub(bus.add_publication("c", 2).expect("add failed"));
        other.offer(b"wrong stream").expect("offer failed");

        let mut seen = 0;
        sub.poll(&mut |_, _| seen += 1, 10);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        let bus = LoopbackBus::with_max_fragment(4);
        let sub = complete_sub(bus.add_subscription("c", 1).expect("add failed"));
        let publication = complete_pub(bus.add_publication("c", 1).expect("add failed"));

        let message: Vec<u8> = (0u8..23).collect();
        publication.offer(&message).expect("offer failed");

        let mut assembler = FragmentAssembler::new();
        let mut out = Vec::new();
        let fragments = sub.poll(
            &mut |flags, data| {
                assembler.on_fragment(flags, data, &mut |msg| out.push(msg.to_vec()));
            },
            64,
        );
        assert_eq!(fragments, 6);
        assert_eq!(out, vec![message]);
    }

    #[test]
    fn test_fragment_limit_respected() {
        let bus = LoopbackBus::new();
        let sub = complete_sub(bus.add_subscription("c", 1).expect("add failed"));
        let publication = complete_pub(bus.add_publication("c", 1).expect("add failed"));
        for _ in 0..5 {
            publication.offer(b"x").expect("offer failed");
        }

        let mut count = 0;
        assert_eq!(sub.poll(&mut |_, _| count += 1, 3), 3);
        assert_eq!(sub.poll(&mut |_, _| count += 1, 3), 2);
        assert_eq!(count, 5);
    }
}
