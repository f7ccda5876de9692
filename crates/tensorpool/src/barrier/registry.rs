// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Fixed-capacity registry of the latest announced merge maps.
//!
//! Keyed by (kind, out stream, epoch). Upserting a map evicts every entry
//! for the same (kind, out stream) with a different epoch: old epochs are
//! dead the moment a new one is announced, and lookups are epoch-exact.

use crate::codec::{SequenceMergeMap, TimestampMergeMap};
use crate::error::{Result, TpError};

/// Which flavor an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMapKind {
    Sequence,
    Timestamp,
}

#[derive(Debug, Clone)]
struct Entry {
    kind: MergeMapKind,
    out_stream_id: u32,
    epoch: u64,
    last_announce_ns: u64,
    sequence: Option<SequenceMergeMap>,
    timestamp: Option<TimestampMergeMap>,
}

/// Owns a copy of each live merge map.
pub struct MergeMapRegistry {
    entries: Vec<Option<Entry>>,
}

impl MergeMapRegistry {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TpError::invalid("registry needs a non-zero capacity"));
        }
        Ok(Self {
            entries: vec![None; capacity],
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn invalidate_stream(&mut self, kind: MergeMapKind, out_stream_id: u32, epoch: u64) {
        for slot in &mut self.entries {
            if let Some(entry) = slot {
                if entry.kind == kind
                    && entry.out_stream_id == out_stream_id
                    && entry.epoch != epoch
                {
                    log::debug!(
                        "[merge-map] evicting stream {} epoch {} for epoch {}",
                        out_stream_id,
                        entry.epoch,
                        epoch
                    );
                    *slot = None;
                }
            }
        }
    }

    fn slot_for(
        &mut self,
        kind: MergeMapKind,
        out_stream_id: u32,
        epoch: u64,
    ) -> Result<&mut Option<Entry>> {
        let matching = self.entries.iter().position(|e| {
            e.as_ref().is_some_and(|e| {
                e.kind == kind && e.out_stream_id == out_stream_id && e.epoch == epoch
            })
        });
        let index = match matching {
            Some(i) => i,
            None => self
                .entries
                .iter()
                .position(|e| e.is_none())
                .ok_or_else(|| TpError::internal("merge map registry full"))?,
        };
        Ok(&mut self.entries[index])
    }

    /// Install or refresh the sequence map for (out stream, epoch).
    pub fn upsert_sequence(&mut self, map: &SequenceMergeMap, now_ns: u64) -> Result<()> {
        self.invalidate_stream(MergeMapKind::Sequence, map.out_stream_id, map.epoch);
        let slot = self.slot_for(MergeMapKind::Sequence, map.out_stream_id, map.epoch)?;
        *slot = Some(Entry {
            kind: MergeMapKind::Sequence,
            out_stream_id: map.out_stream_id,
            epoch: map.epoch,
            last_announce_ns: now_ns,
            sequence: Some(map.clone()),
            timestamp: None,
        });
        Ok(())
    }

    /// Install or refresh the timestamp map for (out stream, epoch).
    pub fn upsert_timestamp(&mut self, map: &TimestampMergeMap, now_ns: u64) -> Result<()> {
        self.invalidate_stream(MergeMapKind::Timestamp, map.out_stream_id, map.epoch);
        let slot = self.slot_for(MergeMapKind::Timestamp, map.out_stream_id, map.epoch)?;
        *slot = Some(Entry {
            kind: MergeMapKind::Timestamp,
            out_stream_id: map.out_stream_id,
            epoch: map.epoch,
            last_announce_ns: now_ns,
            sequence: None,
            timestamp: Some(map.clone()),
        });
        Ok(())
    }

    /// Epoch-exact lookup; an older epoch's rules are never returned.
    #[must_use]
    pub fn find_sequence(&self, out_stream_id: u32, epoch: u64) -> Option<&SequenceMergeMap> {
        self.entries.iter().flatten().find_map(|e| {
            (e.kind == MergeMapKind::Sequence
                && e.out_stream_id == out_stream_id
                && e.epoch == epoch)
                .then_some(e.sequence.as_ref())
                .flatten()
        })
    }

    /// Epoch-exact lookup; an older epoch's rules are never returned.
    #[must_use]
    pub fn find_timestamp(&self, out_stream_id: u32, epoch: u64) -> Option<&TimestampMergeMap> {
        self.entries.iter().flatten().find_map(|e| {
            (e.kind == MergeMapKind::Timestamp
                && e.out_stream_id == out_stream_id
                && e.epoch == epoch)
                .then_some(e.timestamp.as_ref())
                .flatten()
        })
    }

    /// Timestamp of the most recent announce for (out stream, epoch).
    #[must_use]
    pub fn last_announce_ns(
        &self,
        kind: MergeMapKind,
        out_stream_id: u32,
        epoch: u64,
    ) -> Option<u64> {
        self.entries.iter().flatten().find_map(|e| {
            (e.kind == kind && e.out_stream_id == out_stream_id && e.epoch == epoch)
                .then_some(e.last_announce_ns)
        })
    }
}
