// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! # TensorPool - shared-memory pub/sub for large tensor frames
//!
//! A local, multi-process publish/subscribe fabric. A producer writes
//! tensor frames into a fixed-size ring of shared-memory slots; any
//! number of consumers read the same slots zero-copy. A small RPC layer
//! over a pluggable message bus carries metadata, flow control, and
//! lifecycle events, and a central driver arbitrates the shared memory:
//! it provisions ring files, grants time-bounded leases, and revokes
//! them on expiry, detach, or misbehavior.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tensorpool::client::{Client, Producer, ProducerContext, FrameMetadata};
//! use tensorpool::config::ClientConfig;
//! use tensorpool::clock::MonotonicClock;
//! use tensorpool::shm::TensorHeader;
//! use tensorpool::transport::LoopbackBus;
//!
//! fn main() -> tensorpool::Result<()> {
//!     let client = Client::new(
//!         ClientConfig::default(),
//!         Arc::new(LoopbackBus::new()),
//!         Arc::new(MonotonicClock),
//!     );
//!     let mut producer = Producer::new(client, ProducerContext::new(0, 42))?;
//!     producer.attach(5_000_000_000)?;
//!     let payload = [0u8; 64];
//!     producer.offer_frame(&TensorHeader::default(), &payload, &FrameMetadata::default())?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  Producer ----------(slot commit)----------> Consumer              |
//! |      |            shared-memory ring            |   zero-copy read |
//! +------|-----------------------------------------|-------------------+
//!        |                                         |
//!        |   attach / keepalive / detach           |
//!        +------------------+  +-------------------+
//!                           v  v
//!                      +----------+   ShmPoolAnnounce / LeaseRevoked
//!                      |  Driver  | ------------------------------->
//!                      +----------+   provisions ring files, leases,
//!                                     epochs, node-id cooldowns
//! ```
//!
//! ## Modules
//!
//! - [`ring`] - the slot commit/read protocol (start here for the core)
//! - [`shm`] - superblock/slot layout and region mapping
//! - [`driver`] - lease & epoch arbiter, ring provisioning, supervisor
//! - [`client`] - conductor, attach machine, pollers, producer/consumer
//! - [`barrier`] - join barriers and the merge-map registry
//! - [`codec`] - the control-plane wire format
//! - [`transport`] - the bus abstraction and the in-process loopback

pub mod agent;
pub mod barrier;
pub mod clock;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod ring;
pub mod rt;
pub mod shm;
pub mod transport;

/// Client-side runtime (conductor, producer, consumer, pollers).
pub mod client;

pub use error::{ErrorKind, Result, TpError};
