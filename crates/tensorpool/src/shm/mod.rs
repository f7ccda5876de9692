// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Shared-memory ring files.
//!
//! A stream's data plane lives in ordinary files under the driver's base
//! directory, memory-mapped shared by every participant:
//!
//! ```text
//! +-------------------------------------------------------------+
//! | Superblock (4096 bytes: magic, layout, stream, epoch, ...)  |
//! +-------------------------------------------------------------+
//! | slot[0] .. slot[nslots-1]        (header ring, 128 B each)  |
//! |   or                                                        |
//! | payload[0] .. payload[nslots-1]  (pool, stride_bytes each)  |
//! +-------------------------------------------------------------+
//! ```
//!
//! The slot's `seq_commit` word is the only synchronization point between
//! the producer and readers; see [`layout`] for the commit discipline.

pub mod layout;
pub mod region;

pub use layout::{
    commit_word, in_progress_word, unpack_word, DType, FrameSlotHeader, MajorOrder, ProgressUnit,
    RegionType, SlotView, Superblock, TensorHeader, HEADER_SLOT_BYTES, LAYOUT_VERSION, MAX_DIMS,
    SUPERBLOCK_BYTES, SUPERBLOCK_MAGIC,
};
pub use region::{AccessMode, AllowedRoots, ShmRegion, ShmUri};
