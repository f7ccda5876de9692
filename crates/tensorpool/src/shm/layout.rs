// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Byte layout of the superblock and header-ring slots.
//!
//! # Slot commit discipline
//!
//! `seq_commit` packs the frame sequence and an in-progress bit:
//!
//! - `seq_commit = (seq << 1) | 1` -> write in progress (bit 0 set)
//! - `seq_commit = seq << 1` -> committed
//!
//! The producer stores the in-progress word *before* touching any other
//! slot byte and stores the committed word with Release ordering *after*
//! the payload copy; that final store is the publish fence. Readers load
//! `seq_commit` with Acquire ordering before and after copying the slot,
//! discarding the read if the word changed or bit 0 was set. The encoding
//! is wire-compatible and must not change.
//!
//! # Memory ordering
//!
//! - **Release** on the commit store: everything the producer wrote before
//!   it is visible to a reader that Acquire-loads the same word.
//! - **Acquire** on reader loads: no reads of slot bytes are reordered
//!   before the load.
//! - **Relaxed** is enough for the in-progress store: the odd value itself
//!   tells readers the slot is unusable.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TpError};

/// Shared-memory layout version checked on every attach.
pub const LAYOUT_VERSION: u32 = 1;

/// Magic at offset 0 of every ring file ("TNSRPOOL").
pub const SUPERBLOCK_MAGIC: u64 = 0x544E_5352_504F_4F4C;

/// Superblock size; slots start page-aligned right after it.
pub const SUPERBLOCK_BYTES: usize = 4096;

/// Fixed size of one header-ring slot.
pub const HEADER_SLOT_BYTES: usize = 128;

/// Maximum tensor rank carried in a slot header.
pub const MAX_DIMS: usize = 8;

/// What a ring file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegionType {
    HeaderRing = 1,
    PayloadPool = 2,
}

impl RegionType {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::HeaderRing),
            2 => Ok(Self::PayloadPool),
            other => Err(TpError::invalid(format!("unknown region type {other}"))),
        }
    }
}

/// Element type of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DType {
    Int8 = 1,
    Uint8 = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    Int64 = 7,
    Uint64 = 8,
    Float16 = 9,
    #[default]
    Float32 = 10,
    Float64 = 11,
    Bfloat16 = 12,
}

impl DType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Int8),
            2 => Ok(Self::Uint8),
            3 => Ok(Self::Int16),
            4 => Ok(Self::Uint16),
            5 => Ok(Self::Int32),
            6 => Ok(Self::Uint32),
            7 => Ok(Self::Int64),
            8 => Ok(Self::Uint64),
            9 => Ok(Self::Float16),
            10 => Ok(Self::Float32),
            11 => Ok(Self::Float64),
            12 => Ok(Self::Bfloat16),
            other => Err(TpError::invalid(format!("unknown dtype {other}"))),
        }
    }
}

/// Axis ordering of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MajorOrder {
    #[default]
    RowMajor = 1,
    ColMajor = 2,
}

impl MajorOrder {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::RowMajor),
            2 => Ok(Self::ColMajor),
            other => Err(TpError::invalid(format!("unknown major order {other}"))),
        }
    }
}

/// Unit of the producer's `payload_bytes_filled` progress reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ProgressUnit {
    #[default]
    Bytes = 1,
    Elements = 2,
    Rows = 3,
}

impl ProgressUnit {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Bytes),
            2 => Ok(Self::Elements),
            3 => Ok(Self::Rows),
            other => Err(TpError::invalid(format!("unknown progress unit {other}"))),
        }
    }
}

// ============================================================================
// Superblock
// ============================================================================

/// Leading block of every ring file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub layout_version: u32,
    pub region_type: RegionType,
    pub stream_id: u32,
    pub pool_id: u16,
    pub epoch: u64,
    pub nslots: u32,
    pub slot_bytes: u32,
    pub stride_bytes: u32,
    pub producer_pid: u64,
    pub start_timestamp_ns: u64,
    pub last_activity_ns: u64,
}

impl Superblock {
    /// Serialize at the head of `buf` (`buf.len() >= SUPERBLOCK_BYTES`).
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < SUPERBLOCK_BYTES {
            return Err(TpError::invalid("buffer smaller than superblock"));
        }
        buf[0..8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.layout_version.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.region_type as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[20..22].copy_from_slice(&self.pool_id.to_le_bytes());
        buf[22..24].copy_from_slice(&[0, 0]);
        buf[24..32].copy_from_slice(&self.epoch.to_le_bytes());
        buf[32..36].copy_from_slice(&self.nslots.to_le_bytes());
        buf[36..40].copy_from_slice(&self.slot_bytes.to_le_bytes());
        buf[40..44].copy_from_slice(&self.stride_bytes.to_le_bytes());
        buf[44..48].copy_from_slice(&[0, 0, 0, 0]);
        buf[48..56].copy_from_slice(&self.producer_pid.to_le_bytes());
        buf[56..64].copy_from_slice(&self.start_timestamp_ns.to_le_bytes());
        buf[64..72].copy_from_slice(&self.last_activity_ns.to_le_bytes());
        Ok(())
    }

    /// Parse the head of `buf`, checking the magic.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_BYTES {
            return Err(TpError::invalid("region smaller than superblock"));
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().expect("slice length checked"));
        if magic != SUPERBLOCK_MAGIC {
            return Err(TpError::invalid(format!(
                "bad superblock magic {magic:#018x}"
            )));
        }
        let u32_at = |off: usize| {
            u32::from_le_bytes(buf[off..off + 4].try_into().expect("slice length checked"))
        };
        let u64_at = |off: usize| {
            u64::from_le_bytes(buf[off..off + 8].try_into().expect("slice length checked"))
        };
        Ok(Self {
            layout_version: u32_at(8),
            region_type: RegionType::from_u32(u32_at(12))?,
            stream_id: u32_at(16),
            pool_id: u16::from_le_bytes(buf[20..22].try_into().expect("slice length checked")),
            epoch: u64_at(24),
            nslots: u32_at(32),
            slot_bytes: u32_at(36),
            stride_bytes: u32_at(40),
            producer_pid: u64_at(48),
            start_timestamp_ns: u64_at(56),
            last_activity_ns: u64_at(64),
        })
    }
}

// ============================================================================
// Slot header
// ============================================================================

/// Typed tensor header embedded in every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorHeader {
    pub dtype: DType,
    pub major_order: MajorOrder,
    pub ndims: u8,
    pub progress_unit: ProgressUnit,
    pub dims: [u32; MAX_DIMS],
    pub strides: [u32; MAX_DIMS],
}

/// Slot header fields other than `seq_commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSlotHeader {
    pub values_len_bytes: u32,
    pub payload_slot_index: u32,
    pub pool_id: u16,
    pub payload_offset: u32,
    pub timestamp_ns: u64,
    pub meta_version: u32,
    pub tensor: TensorHeader,
}

/// Pack a committed `seq_commit` word.
#[inline]
#[must_use]
pub const fn commit_word(seq: u64) -> u64 {
    seq << 1
}

/// Pack an in-progress `seq_commit` word.
#[inline]
#[must_use]
pub const fn in_progress_word(seq: u64) -> u64 {
    (seq << 1) | 1
}

/// Unpack a `seq_commit` word into (seq, in_progress).
#[inline]
#[must_use]
pub const fn unpack_word(word: u64) -> (u64, bool) {
    (word >> 1, word & 1 == 1)
}

/// View over one 128-byte slot in a mapped header ring.
///
/// All accesses go through this type: `seq_commit` atomically, the rest as
/// plain byte copies bracketed by the seqlock protocol.
#[derive(Clone, Copy)]
pub struct SlotView {
    ptr: *mut u8,
}

// SAFETY: the slot lives in shared memory; cross-thread and cross-process
// access is mediated by the seq_commit protocol.
unsafe impl Send for SlotView {}
unsafe impl Sync for SlotView {}

impl SlotView {
    /// # Safety
    ///
    /// `ptr` must point at the start of a slot with at least
    /// `HEADER_SLOT_BYTES` valid bytes, 8-byte aligned, inside a mapping
    /// that outlives the view.
    #[must_use]
    pub const unsafe fn new(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    #[inline]
    fn seq_commit_atomic(&self) -> &AtomicU64 {
        // SAFETY: per the constructor contract the first 8 bytes of the slot
        // are valid and 8-byte aligned; AtomicU64 has no invalid bit
        // patterns and shared-memory access is what it exists for.
        unsafe { &*(self.ptr as *const AtomicU64) }
    }

    /// Acquire-load the commit word.
    #[inline]
    #[must_use]
    pub fn load_seq_commit(&self) -> u64 {
        self.seq_commit_atomic().load(Ordering::Acquire)
    }

    /// Mark the slot in-progress for `seq`. Relaxed is sufficient: the odd
    /// value itself disqualifies the slot for readers.
    #[inline]
    pub fn mark_in_progress(&self, seq: u64) {
        self.seq_commit_atomic()
            .store(in_progress_word(seq), Ordering::Relaxed);
    }

    /// Publish the slot for `seq`. The Release store is the publish fence.
    #[inline]
    pub fn commit(&self, seq: u64) {
        self.seq_commit_atomic()
            .store(commit_word(seq), Ordering::Release);
    }

    /// Write every non-`seq_commit` field. Producer-only, between
    /// `mark_in_progress` and `commit`.
    pub fn write_fields(&self, header: &FrameSlotHeader) {
        let mut bytes = [0u8; HEADER_SLOT_BYTES - 8];
        bytes[0..4].copy_from_slice(&header.values_len_bytes.to_le_bytes());
        bytes[4..8].copy_from_slice(&header.payload_slot_index.to_le_bytes());
        bytes[8..10].copy_from_slice(&header.pool_id.to_le_bytes());
        bytes[12..16].copy_from_slice(&header.payload_offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&header.timestamp_ns.to_le_bytes());
        bytes[24..28].copy_from_slice(&header.meta_version.to_le_bytes());
        bytes[28] = header.tensor.dtype as u8;
        bytes[29] = header.tensor.major_order as u8;
        bytes[30] = header.tensor.ndims;
        bytes[31] = header.tensor.progress_unit as u8;
        for (i, d) in header.tensor.dims.iter().enumerate() {
            bytes[32 + i * 4..36 + i * 4].copy_from_slice(&d.to_le_bytes());
        }
        for (i, s) in header.tensor.strides.iter().enumerate() {
            bytes[64 + i * 4..68 + i * 4].copy_from_slice(&s.to_le_bytes());
        }
        // SAFETY: constructor contract gives us HEADER_SLOT_BYTES valid
        // bytes; we skip the 8-byte seq_commit word and copy the rest. The
        // slot is marked in-progress, so no reader trusts these bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(8), bytes.len());
        }
    }

    /// Copy every non-`seq_commit` field out. Caller re-checks
    /// `load_seq_commit` afterwards to detect a torn read.
    pub fn read_fields(&self) -> Result<FrameSlotHeader> {
        let mut bytes = [0u8; HEADER_SLOT_BYTES - 8];
        // SAFETY: constructor contract gives us HEADER_SLOT_BYTES valid
        // bytes starting at ptr; the copy cannot overlap a stack array.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(8), bytes.as_mut_ptr(), bytes.len());
        }
        let u32_at = |off: usize| {
            u32::from_le_bytes(bytes[off..off + 4].try_into().expect("slice length checked"))
        };
        let mut dims = [0u32; MAX_DIMS];
        let mut strides = [0u32; MAX_DIMS];
        for i in 0..MAX_DIMS {
            dims[i] = u32_at(32 + i * 4);
            strides[i] = u32_at(64 + i * 4);
        }
        Ok(FrameSlotHeader {
            values_len_bytes: u32_at(0),
            payload_slot_index: u32_at(4),
            pool_id: u16::from_le_bytes(bytes[8..10].try_into().expect("slice length checked")),
            payload_offset: u32_at(12),
            timestamp_ns: u64::from_le_bytes(
                bytes[16..24].try_into().expect("slice length checked"),
            ),
            meta_version: u32_at(24),
            tensor: TensorHeader {
                dtype: DType::from_u8(bytes[28])?,
                major_order: MajorOrder::from_u8(bytes[29])?,
                ndims: bytes[30],
                progress_unit: ProgressUnit::from_u8(bytes[31])?,
                dims,
                strides,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_packing() {
        assert_eq!(commit_word(5), 10);
        assert_eq!(in_progress_word(5), 11);
        assert_eq!(unpack_word(10), (5, false));
        assert_eq!(unpack_word(11), (5, true));
    }

    #[test]
    fn test_superblock_round_trip() {
        let sb = Superblock {
            layout_version: LAYOUT_VERSION,
            region_type: RegionType::HeaderRing,
            stream_id: 7,
            pool_id: 0,
            epoch: 1_700_000_000_000_000_000,
            nslots: 64,
            slot_bytes: HEADER_SLOT_BYTES as u32,
            stride_bytes: 0,
            producer_pid: 4242,
            start_timestamp_ns: 1,
            last_activity_ns: 2,
        };
        let mut buf = vec![0u8; SUPERBLOCK_BYTES];
        sb.encode(&mut buf).expect("encode failed");
        assert_eq!(Superblock::decode(&buf).expect("decode failed"), sb);
    }

    #[test]
    fn test_superblock_bad_magic() {
        let buf = vec![0u8; SUPERBLOCK_BYTES];
        assert!(Superblock::decode(&buf).is_err());
    }

    #[test]
    fn test_slot_view_round_trip() {
        let mut slot = vec![0u8; HEADER_SLOT_BYTES];
        // SAFETY: slot is a live, 8-byte-aligned Vec allocation of
        // HEADER_SLOT_BYTES bytes that outlives the view.
        let view = unsafe { SlotView::new(slot.as_mut_ptr()) };

        let mut header = FrameSlotHeader {
            values_len_bytes: 16,
            payload_slot_index: 3,
            pool_id: 1,
            payload_offset: 192,
            timestamp_ns: 999,
            meta_version: 2,
            tensor: TensorHeader {
                dtype: DType::Float32,
                major_order: MajorOrder::RowMajor,
                ndims: 2,
                progress_unit: ProgressUnit::Bytes,
                ..TensorHeader::default()
            },
        };
        header.tensor.dims[0] = 2;
        header.tensor.dims[1] = 2;
        header.tensor.strides[0] = 8;
        header.tensor.strides[1] = 4;

        view.mark_in_progress(7);
        assert_eq!(view.load_seq_commit(), in_progress_word(7));
        view.write_fields(&header);
        view.commit(7);
        assert_eq!(view.load_seq_commit(), commit_word(7));
        assert_eq!(view.read_fields().expect("read failed"), header);
    }

    #[test]
    fn test_zeroed_slot_fields_rejected() {
        let mut slot = vec![0u8; HEADER_SLOT_BYTES];
        // SAFETY: as above.
        let view = unsafe { SlotView::new(slot.as_mut_ptr()) };
        // dtype 0 is not a valid encoding
        assert!(view.read_fields().is_err());
    }
}
