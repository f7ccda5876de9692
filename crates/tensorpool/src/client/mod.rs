// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Client-side runtime: conductor, attach machinery, pollers, and the
//! producer/consumer roles.
//!
//! One [`Client`] owns one conductor loop. Producers and consumers are
//! built over a client and drive their own subscriptions from their
//! owning thread; cross-thread requests (async publication/subscription
//! adds) go through the conductor's command queue.

mod asyncop;
mod conductor;
mod consumer;
mod control;
mod driver_client;
mod metadata;
mod producer;
mod progress;
mod qos;

pub use asyncop::{AsyncAddResult, AsyncToken};
pub use conductor::{Command, Conductor, Poller, COMMAND_QUEUE_CAPACITY};
pub use consumer::{Consumer, ConsumerContext, ConsumerState};
pub use control::{ControlHandlers, ControlPoller};
pub use driver_client::{AttachInfo, AttachOptions, DriverClient, ATTACH_RETRY_INTERVAL_NS};
pub use metadata::{MetadataHandlers, MetadataPoller};
pub use producer::{FrameMetadata, Producer, ProducerContext};
pub use progress::ProgressPoller;
pub use qos::{QosHandlers, QosPoller};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{AgentRunner, IdleStrategy};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{Result, TpError};
use crate::rt::MpscQueue;
use crate::shm::AllowedRoots;
use crate::transport::{MessageTransport, Publication, Subscription};

use asyncop::AsyncArena;

/// Shared client handle.
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn MessageTransport>,
    clock: Arc<dyn Clock>,
    conductor: Mutex<Conductor>,
    commands: Arc<MpscQueue<Command>>,
    arena: Arc<Mutex<AsyncArena>>,
    roots: AllowedRoots,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn MessageTransport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let commands = Arc::new(MpscQueue::new(COMMAND_QUEUE_CAPACITY));
        let arena = Arc::new(Mutex::new(AsyncArena::new()));
        let conductor = Conductor::new(
            Arc::clone(&transport),
            Arc::clone(&commands),
            Arc::clone(&arena),
        );
        let roots = AllowedRoots::new(config.allowed_roots.clone());
        Arc::new(Self {
            config,
            transport,
            clock,
            conductor: Mutex::new(conductor),
            commands,
            arena,
            roots,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn MessageTransport> {
        &self.transport
    }

    #[must_use]
    pub fn allowed_roots(&self) -> &AllowedRoots {
        &self.roots
    }

    /// One conductor pass. Re-entrant calls (a poller calling back into
    /// the client) skip the pass instead of recursing.
    pub fn do_work(&self) -> Result<usize> {
        match self.conductor.try_lock() {
            Some(mut conductor) => conductor.do_work(),
            None => Ok(0),
        }
    }

    /// Queue an async publication add from any thread.
    pub fn async_add_publication(&self, channel: &str, stream_id: u32) -> Result<AsyncToken> {
        let token = self.arena.lock().allocate();
        let command = Command::AddPublication {
            channel: channel.to_string(),
            stream_id,
            token,
        };
        if self.commands.offer(command).is_err() {
            self.arena.lock().release(token);
            return Err(TpError::internal("conductor command queue full"));
        }
        Ok(token)
    }

    /// Queue an async subscription add from any thread.
    pub fn async_add_subscription(&self, channel: &str, stream_id: u32) -> Result<AsyncToken> {
        let token = self.arena.lock().allocate();
        let command = Command::AddSubscription {
            channel: channel.to_string(),
            stream_id,
            token,
        };
        if self.commands.offer(command).is_err() {
            self.arena.lock().release(token);
            return Err(TpError::internal("conductor command queue full"));
        }
        Ok(token)
    }

    /// Non-blocking poll of an async publication add.
    pub fn poll_publication(&self, token: AsyncToken) -> Result<Option<Arc<dyn Publication>>> {
        match self.arena.lock().take(token)? {
            None => Ok(None),
            Some(Ok(AsyncAddResult::Publication(p))) => Ok(Some(p)),
            Some(Ok(AsyncAddResult::Subscription(_))) => {
                Err(TpError::invalid("token resolves to a subscription"))
            }
            Some(Err(e)) => Err(e),
        }
    }

    /// Non-blocking poll of an async subscription add.
    pub fn poll_subscription(&self, token: AsyncToken) -> Result<Option<Arc<dyn Subscription>>> {
        match self.arena.lock().take(token)? {
            None => Ok(None),
            Some(Ok(AsyncAddResult::Subscription(s))) => Ok(Some(s)),
            Some(Ok(AsyncAddResult::Publication(_))) => {
                Err(TpError::invalid("token resolves to a publication"))
            }
            Some(Err(e)) => Err(e),
        }
    }

    /// Synchronous add: drives the conductor until the publication is
    /// ready or `timeout_ns` passes.
    pub fn add_publication(
        &self,
        channel: &str,
        stream_id: u32,
        timeout_ns: u64,
    ) -> Result<Arc<dyn Publication>> {
        let token = self.async_add_publication(channel, stream_id)?;
        let deadline = self.clock.now_ns() + timeout_ns;
        loop {
            self.do_work()?;
            if let Some(publication) = self.poll_publication(token)? {
                return Ok(publication);
            }
            if self.clock.now_ns() > deadline {
                return Err(TpError::Timeout(format!("add_publication {channel}")));
            }
            std::thread::yield_now();
        }
    }

    /// Synchronous add: drives the conductor until the subscription is
    /// ready or `timeout_ns` passes.
    pub fn add_subscription(
        &self,
        channel: &str,
        stream_id: u32,
        timeout_ns: u64,
    ) -> Result<Arc<dyn Subscription>> {
        let token = self.async_add_subscription(channel, stream_id)?;
        let deadline = self.clock.now_ns() + timeout_ns;
        loop {
            self.do_work()?;
            if let Some(subscription) = self.poll_subscription(token)? {
                return Ok(subscription);
            }
            if self.clock.now_ns() > deadline {
                return Err(TpError::Timeout(format!("add_subscription {channel}")));
            }
            std::thread::yield_now();
        }
    }

    /// Register a poller with the conductor loop.
    pub fn add_poller(&self, poller: Box<dyn Poller>) -> u64 {
        self.conductor.lock().add_poller(poller)
    }

    pub fn remove_poller(&self, id: u64) -> bool {
        self.conductor.lock().remove_poller(id)
    }

    /// Run the conductor on its own agent thread.
    pub fn spawn_agent(self: &Arc<Self>) -> Result<AgentRunner> {
        let client = Arc::clone(self);
        let strategy = IdleStrategy::Sleeping {
            sleep_ns: self.config.idle_sleep_duration_ns,
        };
        AgentRunner::start("tp-client-conductor", strategy, move || client.do_work())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::transport::LoopbackBus;

    fn test_client() -> Arc<Client> {
        Client::new(
            ClientConfig::default(),
            Arc::new(LoopbackBus::new()),
            Arc::new(MonotonicClock),
        )
    }

    #[test]
    fn test_sync_add_publication_and_subscription() {
        let client = test_client();
        let publication = client
            .add_publication("c", 1, 1_000_000_000)
            .expect("add failed");
        let subscription = client
            .add_subscription("c", 1, 1_000_000_000)
            .expect("add failed");
        assert!(publication.is_connected());
        assert!(subscription.is_connected());
    }

    #[test]
    fn test_async_add_round_trip() {
        let client = test_client();
        let token = client.async_add_publication("c", 2).expect("queue failed");
        assert!(client.poll_publication(token).expect("poll failed").is_none());
        client.do_work().expect("do_work failed");
        assert!(client.poll_publication(token).expect("poll failed").is_some());
    }

    #[test]
    fn test_agent_drives_conductor() {
        let client = test_client();
        let mut agent = client.spawn_agent().expect("agent failed");
        let token = client.async_add_subscription("c", 3).expect("queue failed");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Some(sub) = client.poll_subscription(token).expect("poll failed") {
                assert_eq!(sub.stream_id(), 3);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "agent never completed add");
            std::thread::yield_now();
        }
        agent.stop();
    }
}
