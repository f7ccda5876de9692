// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Frame-progress poller: validates monotonicity before the user sees
//! anything.

use std::sync::Arc;

use crate::codec::{decode_message, Decoded, FrameProgress, Message};
use crate::ring::ProgressTracker;
use crate::error::Result;
use crate::transport::{FragmentAssembler, Subscription};

/// Poller over a progress subscription with a ring-sized tracker.
pub struct ProgressPoller {
    subscription: Arc<dyn Subscription>,
    assembler: FragmentAssembler,
    tracker: ProgressTracker,
    stream_id: u32,
    handler: Box<dyn FnMut(&FrameProgress) + Send>,
    rejected: u64,
}

impl ProgressPoller {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        stream_id: u32,
        nslots: u32,
        handler: Box<dyn FnMut(&FrameProgress) + Send>,
    ) -> Result<Self> {
        Ok(Self {
            subscription,
            assembler: FragmentAssembler::new(),
            tracker: ProgressTracker::new(nslots)?,
            stream_id,
            handler,
            rejected: 0,
        })
    }

    /// Progress updates dropped for violating monotonicity.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// A new epoch starts with a clean tracker.
    pub fn reset_for_epoch(&mut self) {
        self.tracker.clear();
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
            let progress = match decode_message(&buffer) {
                Ok(Decoded::Message(Message::FrameProgress(p))) => p,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("[progress] dropping invalid message: {e}");
                    continue;
                }
            };
            if progress.stream_id != self.stream_id {
                continue;
            }
            match self.tracker.apply(&progress) {
                Ok(_) => (self.handler)(&progress),
                Err(e) => {
                    self.rejected += 1;
                    log::warn!("[progress] rejected update: {e}");
                }
            }
        }
        consumed
    }
}

impl crate::client::Poller for ProgressPoller {
    fn poll(&mut self, fragment_limit: usize) -> usize {
        ProgressPoller::poll(self, fragment_limit)
    }
}
