// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Producer side of the ring protocol.

use super::{slot_view, PoolRegion};
use crate::error::{Result, TpError};
use crate::shm::{FrameSlotHeader, ShmRegion, TensorHeader};

/// Where a published frame landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedFrame {
    pub seq: u64,
    pub slot_index: u32,
    pub pool_id: u16,
    pub payload_offset: u32,
    pub values_len_bytes: u32,
    pub timestamp_ns: u64,
}

/// Single-writer view of a stream's header ring and payload pools.
pub struct RingProducer {
    header: ShmRegion,
    pools: Vec<PoolRegion>,
    nslots: u32,
    next_seq: u64,
}

impl RingProducer {
    /// Wrap validated, read-write regions. Every pool must carry the same
    /// slot count as the header ring.
    pub fn new(header: ShmRegion, pools: Vec<PoolRegion>, nslots: u32) -> Result<Self> {
        if nslots == 0 || !nslots.is_power_of_two() {
            return Err(TpError::invalid(format!(
                "nslots {nslots} not a power of two"
            )));
        }
        if pools.is_empty() {
            return Err(TpError::invalid("producer needs at least one payload pool"));
        }
        for pool in &pools {
            if pool.nslots != nslots {
                return Err(TpError::invalid(format!(
                    "pool {} slot count {} != header {nslots}",
                    pool.pool_id, pool.nslots
                )));
            }
        }
        Ok(Self {
            header,
            pools,
            nslots,
            next_seq: 1,
        })
    }

    /// Next sequence that `publish` will claim.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    #[must_use]
    pub fn nslots(&self) -> u32 {
        self.nslots
    }

    fn pool_for(&self, pool_id: u16) -> Result<&PoolRegion> {
        self.pools
            .iter()
            .find(|p| p.pool_id == pool_id)
            .ok_or_else(|| TpError::invalid(format!("unknown pool {pool_id}")))
    }

    /// Smallest pool whose stride fits `len`, if the caller does not care.
    pub fn pick_pool(&self, len: usize) -> Result<u16> {
        self.pools
            .iter()
            .filter(|p| p.stride_bytes as usize >= len)
            .min_by_key(|p| p.stride_bytes)
            .map(|p| p.pool_id)
            .ok_or_else(|| TpError::invalid(format!("no pool fits payload of {len} bytes")))
    }

    /// Publish one frame and return its placement.
    ///
    /// Commit discipline: in-progress store, header fields, payload copy,
    /// then the Release commit store.
    pub fn publish(
        &mut self,
        tensor: &TensorHeader,
        timestamp_ns: u64,
        meta_version: u32,
        pool_id: u16,
        payload: &[u8],
    ) -> Result<PublishedFrame> {
        let pool = self.pool_for(pool_id)?;
        let values_len = u32::try_from(payload.len())
            .map_err(|_| TpError::invalid("payload exceeds u32 length"))?;
        if values_len > pool.stride_bytes {
            return Err(TpError::invalid(format!(
                "payload {values_len} bytes exceeds pool stride {}",
                pool.stride_bytes
            )));
        }

        let seq = self.next_seq;
        let slot_index = (seq & u64::from(self.nslots - 1)) as u32;
        let slot = slot_view(&self.header, self.nslots, seq);

        // 1. Raise the in-progress flag before touching anything else.
        slot.mark_in_progress(seq);

        // 2. Header fields.
        slot.write_fields(&FrameSlotHeader {
            values_len_bytes: values_len,
            payload_slot_index: slot_index,
            pool_id,
            payload_offset: 0,
            timestamp_ns,
            meta_version,
            tensor: *tensor,
        });

        // 3. Payload into the pool slot.
        // SAFETY: slot_ptr is in bounds for stride_bytes and values_len <=
        // stride_bytes was checked above; src and dst cannot overlap (the
        // caller's buffer is not inside the mapping).
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), pool.slot_ptr(slot_index), payload.len());
        }

        // 4. Publish fence.
        slot.commit(seq);

        self.next_seq = seq + 1;
        Ok(PublishedFrame {
            seq,
            slot_index,
            pool_id,
            payload_offset: 0,
            values_len_bytes: values_len,
            timestamp_ns,
        })
    }
}
