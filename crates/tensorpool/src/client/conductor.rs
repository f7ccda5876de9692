// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! The client conductor: a single-threaded event loop advancing async
//! transport adds and walking registered pollers.
//!
//! Other threads talk to the conductor exclusively through the bounded
//! MPSC command queue; the conductor is the queue's only consumer.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::asyncop::{AsyncAddResult, AsyncArena, AsyncToken};
use crate::error::Result;
use crate::rt::MpscQueue;
use crate::transport::{MessageTransport, PendingPublication, PendingSubscription};

/// Capacity of the conductor command queue.
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Default fragment budget handed to each poller per pass.
pub const POLLER_FRAGMENT_LIMIT: usize = 10;

/// Cross-thread commands into the conductor.
pub enum Command {
    AddPublication {
        channel: String,
        stream_id: u32,
        token: AsyncToken,
    },
    AddSubscription {
        channel: String,
        stream_id: u32,
        token: AsyncToken,
    },
}

/// Anything the conductor fans fragments into each pass.
pub trait Poller: Send {
    fn poll(&mut self, fragment_limit: usize) -> usize;
}

impl<F> Poller for F
where
    F: FnMut(usize) -> usize + Send,
{
    fn poll(&mut self, fragment_limit: usize) -> usize {
        self(fragment_limit)
    }
}

pub struct Conductor {
    transport: Arc<dyn MessageTransport>,
    commands: Arc<MpscQueue<Command>>,
    arena: Arc<Mutex<AsyncArena>>,
    pending_publications: Vec<(AsyncToken, Box<dyn PendingPublication>)>,
    pending_subscriptions: Vec<(AsyncToken, Box<dyn PendingSubscription>)>,
    pollers: Vec<(u64, Box<dyn Poller>)>,
    next_poller_id: u64,
}

impl Conductor {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        commands: Arc<MpscQueue<Command>>,
        arena: Arc<Mutex<AsyncArena>>,
    ) -> Self {
        Self {
            transport,
            commands,
            arena,
            pending_publications: Vec::new(),
            pending_subscriptions: Vec::new(),
            pollers: Vec::new(),
            next_poller_id: 1,
        }
    }

    /// Register a poller; returns an id for removal.
    pub fn add_poller(&mut self, poller: Box<dyn Poller>) -> u64 {
        let id = self.next_poller_id;
        self.next_poller_id += 1;
        self.pollers.push((id, poller));
        id
    }

    pub fn remove_poller(&mut self, id: u64) -> bool {
        let before = self.pollers.len();
        self.pollers.retain(|(pid, _)| *pid != id);
        before != self.pollers.len()
    }

    #[must_use]
    pub fn poller_count(&self) -> usize {
        self.pollers.len()
    }

    fn process_commands(&mut self) -> usize {
        let mut work = 0;
        while let Some(command) = self.commands.poll() {
            work += 1;
            match command {
                Command::AddPublication {
                    channel,
                    stream_id,
                    token,
                } => match self.transport.add_publication(&channel, stream_id) {
                    Ok(pending) => self.pending_publications.push((token, pending)),
                    Err(e) => self.arena.lock().complete(token, Err(e)),
                },
                Command::AddSubscription {
                    channel,
                    stream_id,
                    token,
                } => match self.transport.add_subscription(&channel, stream_id) {
                    Ok(pending) => self.pending_subscriptions.push((token, pending)),
                    Err(e) => self.arena.lock().complete(token, Err(e)),
                },
            }
        }
        work
    }

    fn poll_pending(&mut self) -> usize {
        let mut work = 0;
        let arena = &self.arena;

        self.pending_publications.retain_mut(|(token, pending)| {
            match pending.poll() {
                Ok(None) => true,
                Ok(Some(publication)) => {
                    arena
                        .lock()
                        .complete(*token, Ok(AsyncAddResult::Publication(publication)));
                    work += 1;
                    false
                }
                Err(e) => {
                    arena.lock().complete(*token, Err(e));
                    work += 1;
                    false
                }
            }
        });
        self.pending_subscriptions.retain_mut(|(token, pending)| {
            match pending.poll() {
                Ok(None) => true,
                Ok(Some(subscription)) => {
                    arena
                        .lock()
                        .complete(*token, Ok(AsyncAddResult::Subscription(subscription)));
                    work += 1;
                    false
                }
                Err(e) => {
                    arena.lock().complete(*token, Err(e));
                    work += 1;
                    false
                }
            }
        });
        work
    }

    /// One bounded pass: commands, pending adds, registered pollers.
    pub fn do_work(&mut self) -> Result<usize> {
        let mut work = self.process_commands();
        work += self.poll_pending();
        for (_, poller) in &mut self.pollers {
            work += poller.poll(POLLER_FRAGMENT_LIMIT);
        }
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackBus;

    fn conductor_with_bus() -> (Conductor, Arc<MpscQueue<Command>>, Arc<Mutex<AsyncArena>>) {
        let commands = Arc::new(MpscQueue::new(COMMAND_QUEUE_CAPACITY));
        let arena = Arc::new(Mutex::new(AsyncArena::new()));
        let conductor = Conductor::new(
            Arc::new(LoopbackBus::new()),
            Arc::clone(&commands),
            Arc::clone(&arena),
        );
        (conductor, commands, arena)
    }

    #[test]
    fn test_add_publication_via_command_queue() {
        let (mut conductor, commands, arena) = conductor_with_bus();
        let token = arena.lock().allocate();
        commands
            .offer(Command::AddPublication {
                channel: "c".to_string(),
                stream_id: 5,
                token,
            })
            .unwrap_or_else(|_| panic!("offer failed"));

        conductor.do_work().expect("do_work failed");
        let outcome = arena
            .lock()
            .take(token)
            .expect("take failed")
            .expect("should be done")
            .expect("should be ok");
        match outcome {
            AsyncAddResult::Publication(p) => assert_eq!(p.stream_id(), 5),
            AsyncAddResult::Subscription(_) => panic!("wrong result kind"),
        }
    }

    #[test]
    fn test_pollers_invoked_and_removable() {
        let (mut conductor, _commands, _arena) = conductor_with_bus();
        let hits = Arc::new(Mutex::new(0usize));
        let hits_in = Arc::clone(&hits);
        let id = conductor.add_poller(Box::new(move |_limit: usize| {
            *hits_in.lock() += 1;
            0
        }));

        conductor.do_work().expect("do_work failed");
        conductor.do_work().expect("do_work failed");
        assert_eq!(*hits.lock(), 2);

        assert!(conductor.remove_poller(id));
        conductor.do_work().expect("do_work failed");
        assert_eq!(*hits.lock(), 2);
        assert!(!conductor.remove_poller(id));
    }

    #[test]
    fn test_subscription_add_completes() {
        let (mut conductor, commands, arena) = conductor_with_bus();
        let token = arena.lock().allocate();
        commands
            .offer(Command::AddSubscription {
                channel: "c".to_string(),
                stream_id: 9,
                token,
            })
            .unwrap_or_else(|_| panic!("offer failed"));
        conductor.do_work().expect("do_work failed");
        let outcome = arena
            .lock()
            .take(token)
            .expect("take failed")
            .expect("should be done")
            .expect("should be ok");
        assert!(matches!(outcome, AsyncAddResult::Subscription(_)));
    }
}
