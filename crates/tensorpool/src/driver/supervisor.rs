// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Consumer registry and per-consumer routing.
//!
//! Consolidates `ConsumerHello` beacons keyed by (stream, consumer). With
//! per-consumer routing enabled, each consumer is assigned a descriptor
//! and control stream id derived from its consumer id and echoed back in
//! a `ConsumerConfig`. A periodic sweep drops consumers that stopped
//! saying hello.

use crate::codec::{ConsumerConfig, ConsumerHello};
use crate::config::SupervisorConfig;

#[derive(Debug, Clone, Copy)]
struct ConsumerEntry {
    stream_id: u32,
    consumer_id: u32,
    last_seen_ns: u64,
    descriptor_stream_id: u32,
    control_stream_id: u32,
}

/// Supervisor state; owned and driven by the driver loop.
pub struct Supervisor {
    config: SupervisorConfig,
    entries: Vec<ConsumerEntry>,
    next_sweep_ns: u64,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            next_sweep_ns: 0,
        }
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.entries.len()
    }

    /// Record a hello; returns the config to echo when routing applies.
    pub fn on_consumer_hello(
        &mut self,
        hello: &ConsumerHello,
        now_ns: u64,
    ) -> Option<ConsumerConfig> {
        let descriptor_stream_id = self.config.per_consumer_descriptor_base
            + hello.consumer_id % self.config.per_consumer_descriptor_range.max(1);
        let control_stream_id = self.config.per_consumer_control_base
            + hello.consumer_id % self.config.per_consumer_control_range.max(1);

        match self
            .entries
            .iter_mut()
            .find(|e| e.stream_id == hello.stream_id && e.consumer_id == hello.consumer_id)
        {
            Some(entry) => entry.last_seen_ns = now_ns,
            None => {
                if self.entries.len() >= self.config.consumer_capacity {
                    log::warn!(
                        "[supervisor] consumer table full ({}), dropping hello from {}",
                        self.config.consumer_capacity,
                        hello.consumer_id
                    );
                    return None;
                }
                self.entries.push(ConsumerEntry {
                    stream_id: hello.stream_id,
                    consumer_id: hello.consumer_id,
                    last_seen_ns: now_ns,
                    descriptor_stream_id,
                    control_stream_id,
                });
                log::debug!(
                    "[supervisor] consumer {} on stream {} registered",
                    hello.consumer_id,
                    hello.stream_id
                );
            }
        }

        let force_no_shm = match self.config.force_mode.as_str() {
            "no_shm" => true,
            "shm" => false,
            _ => self.config.force_no_shm,
        };
        self.config.per_consumer_enabled.then(|| ConsumerConfig {
            stream_id: hello.stream_id,
            consumer_id: hello.consumer_id,
            descriptor_stream_id,
            control_stream_id,
            force_no_shm,
            payload_fallback_uri: self.config.payload_fallback_uri.clone(),
        })
    }

    /// Drop consumers not seen within the sweep interval. Returns work
    /// done (entries dropped).
    pub fn do_work(&mut self, now_ns: u64) -> usize {
        if now_ns < self.next_sweep_ns {
            return 0;
        }
        let interval_ns = self.config.consumer_stale_ms * 1_000_000;
        self.next_sweep_ns = now_ns + interval_ns;

        let before = self.entries.len();
        self.entries
            .retain(|e| now_ns.saturating_sub(e.last_seen_ns) <= interval_ns);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            log::debug!("[supervisor] dropped {dropped} stale consumers");
        }
        dropped
    }

    /// Routing assignment for a known consumer.
    #[must_use]
    pub fn routing(&self, stream_id: u32, consumer_id: u32) -> Option<(u32, u32)> {
        self.entries
            .iter()
            .find(|e| e.stream_id == stream_id && e.consumer_id == consumer_id)
            .map(|e| (e.descriptor_stream_id, e.control_stream_id))
    }
}
