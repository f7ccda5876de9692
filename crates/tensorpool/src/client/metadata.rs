// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Data-source metadata poller.
//!
//! Surfaces `DataSourceAnnounce` and the begin / attribute / end phases
//! of `DataSourceMeta` to the application.

use std::sync::Arc;

use crate::codec::{
    decode_message, DataSourceAnnounce, Decoded, Message, MetaAttribute,
};
use crate::transport::{FragmentAssembler, Subscription};

/// Callbacks for metadata traffic.
#[derive(Default)]
pub struct MetadataHandlers {
    pub on_announce: Option<Box<dyn FnMut(&DataSourceAnnounce) + Send>>,
    pub on_meta_begin: Option<Box<dyn FnMut(u32, u64, u32) + Send>>,
    pub on_meta_attr: Option<Box<dyn FnMut(&MetaAttribute) + Send>>,
    pub on_meta_end: Option<Box<dyn FnMut(u32, u64, u32) + Send>>,
}

/// Poller over a metadata subscription.
pub struct MetadataPoller {
    subscription: Arc<dyn Subscription>,
    assembler: FragmentAssembler,
    handlers: MetadataHandlers,
}

impl MetadataPoller {
    pub fn new(subscription: Arc<dyn Subscription>, handlers: MetadataHandlers) -> Self {
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
                Ok(Decoded::Message(Message::DataSourceAnnounce(announce))) => {
                    if let Some(handler) = &mut self.handlers.on_announce {
                        handler(&announce);
                    }
                }
                Ok(Decoded::Message(Message::DataSourceMeta(meta))) => {
                    if let Some(begin) = &mut self.handlers.on_meta_begin {
                        begin(meta.stream_id, meta.epoch, meta.meta_version);
                    }
                    if let Some(attr) = &mut self.handlers.on_meta_attr {
                        for attribute in &meta.attributes {
                            attr(attribute);
                        }
                    }
                    if let Some(end) = &mut self.handlers.on_meta_end {
                        end(meta.stream_id, meta.epoch, meta.meta_version);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("[metadata] dropping invalid message: {e}"),
            }
        }
        consumed
    }
}

impl crate::client::Poller for MetadataPoller {
    fn poll(&mut self, fragment_limit: usize) -> usize {
        MetadataPoller::poll(self, fragment_limit)
    }
}
