// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! QoS counter poller.

use std::sync::Arc;

use crate::codec::{decode_message, Decoded, Message, QosConsumer, QosProducer};
use crate::transport::{FragmentAssembler, Subscription};

type Handler<T> = Option<Box<dyn FnMut(&T) + Send>>;

/// Callbacks for QoS traffic.
#[derive(Default)]
pub struct QosHandlers {
    pub on_producer: Handler<QosProducer>,
    pub on_consumer: Handler<QosConsumer>,
}

/// Poller over a QoS subscription.
pub struct QosPoller {
    subscription: Arc<dyn Subscription>,
    assembler: FragmentAssembler,
    handlers: QosHandlers,
}

impl QosPoller {
    pub fn new(subscription: Arc<dyn Subscription>, handlers: QosHandlers) -> Self {
        Self {
            subscription,
            assembler: FragmentAssembler::new(),
            handlers,
        }
    }

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
            match decode_message(&buffer) {
                Ok(Decoded::Message(Message::QosProducer(qos))) => {
                    if let Some(handler) = &mut self.handlers.on_producer {
                        handler(&qos);
                    }
                }
                Ok(Decoded::Message(Message::QosConsumer(qos))) => {
                    if let Some(handler) = &mut self.handlers.on_consumer {
                        handler(&qos);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("[qos] dropping invalid message: {e}"),
            }
        }
        consumed
    }
}

impl crate::client::Poller for QosPoller {
    fn poll(&mut self, fragment_limit: usize) -> usize {
        QosPoller::poll(self, fragment_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackBus, MessageTransport, Publication};
    use parking_lot::Mutex;

    #[test]
    fn test_both_directions_dispatched() {
        let bus = LoopbackBus::new();
        let subscription = bus
            .add_subscription("qos", 1)
            .expect("add failed")
            .poll()
            .expect("poll failed")
            .expect("not immediate");
        let publication: Arc<dyn Publication> = bus
            .add_publication("qos", 1)
            .expect("add failed")
            .poll()
            .expect("poll failed")
            .expect("not immediate");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let producer_seen = Arc::clone(&seen);
        let consumer_seen = Arc::clone(&seen);
        let mut poller = QosPoller::new(
            subscription,
            QosHandlers {
                on_producer: Some(Box::new(move |q: &QosProducer| {
                    producer_seen.lock().push(("producer", q.frames_published));
                })),
                on_consumer: Some(Box::new(move |q: &QosConsumer| {
                    consumer_seen.lock().push(("consumer", q.frames_read));
                })),
            },
        );

        publication
            .offer(
                &Message::QosProducer(QosProducer {
                    epoch: 1,
                    timestamp_ns: 0,
                    frames_published: 10,
                    bytes_published: 640,
                    errors: 0,
                    stream_id: 7,
                })
                .encode()
                .expect("encode failed"),
            )
            .expect("offer failed");
        publication
            .offer(
                &Message::QosConsumer(QosConsumer {
                    epoch: 1,
                    timestamp_ns: 0,
                    frames_read: 9,
                    drops_gap: 1,
                    drops_late: 0,
                    stream_id: 7,
                    consumer_id: 3,
                })
                .encode()
                .expect("encode failed"),
            )
            .expect("offer failed");

        poller.poll(10);
        assert_eq!(*seen.lock(), vec![("producer", 10), ("consumer", 9)]);
    }
}
