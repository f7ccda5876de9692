// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Message transport abstraction.
//!
//! The control plane rides on an external reliable, ordered, fragmentable
//! bus. The core only sees these traits; a concrete transport is plugged
//! in at construction time. Fragments preserve per-publication FIFO
//! order, and a message larger than the transport's fragment payload is
//! split into BEGIN / middle / END fragments reassembled by
//! [`FragmentAssembler`].
//!
//! [`LoopbackBus`] is the in-process implementation used by tests and the
//! listener tools.

mod fragment;
mod inproc;

pub use fragment::FragmentAssembler;
pub use inproc::LoopbackBus;

use std::sync::Arc;

use crate::error::Result;

/// First fragment of a message.
pub const FRAGMENT_BEGIN: u8 = 0x01;
/// Last fragment of a message.
pub const FRAGMENT_END: u8 = 0x02;
/// An unfragmented message carries both flags.
pub const FRAGMENT_UNFRAGMENTED: u8 = FRAGMENT_BEGIN | FRAGMENT_END;

/// Outbound message stream on one (channel, stream id).
pub trait Publication: Send + Sync {
    /// Queue a whole message; the transport fragments as needed.
    fn offer(&self, message: &[u8]) -> Result<()>;

    /// True once at least one subscriber is reachable.
    fn is_connected(&self) -> bool;

    fn channel(&self) -> &str;

    fn stream_id(&self) -> u32;
}

/// Inbound message stream on one (channel, stream id).
pub trait Subscription: Send + Sync {
    /// Deliver up to `fragment_limit` fragments to `handler` as
    /// `(flags, bytes)` pairs; returns the number delivered.
    fn poll(&self, handler: &mut dyn FnMut(u8, &[u8]), fragment_limit: usize) -> usize;

    /// True once at least one publisher is reachable.
    fn is_connected(&self) -> bool;

    fn channel(&self) -> &str;

    fn stream_id(&self) -> u32;
}

/// In-flight asynchronous publication add.
pub trait PendingPublication: Send {
    /// `Ok(None)` while pending; the publication exactly once when ready.
    fn poll(&mut self) -> Result<Option<Arc<dyn Publication>>>;
}

/// In-flight asynchronous subscription add.
pub trait PendingSubscription: Send {
    /// `Ok(None)` while pending; the subscription exactly once when ready.
    fn poll(&mut self) -> Result<Option<Arc<dyn Subscription>>>;
}

/// The bus itself.
pub trait MessageTransport: Send + Sync {
    fn add_publication(
        &self,
        channel: &str,
        stream_id: u32,
    ) -> Result<Box<dyn PendingPublication>>;

    fn add_subscription(
        &self,
        channel: &str,
        stream_id: u32,
    ) -> Result<Box<dyn PendingSubscription>>;

    /// Largest fragment payload this transport delivers.
    fn max_fragment_payload(&self) -> usize;
}
