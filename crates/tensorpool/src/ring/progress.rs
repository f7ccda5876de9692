// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Reader-side frame progress validation.
//!
//! The tracker is sized to the header ring: the key for (epoch, seq) is
//! `seq & (nslots - 1)`, and a wrapped sequence simply overwrites the old
//! entry. Within one (epoch, seq) the reported `payload_bytes_filled`
//! must never decrease.

use crate::codec::{FrameProgress, ProgressState};
use crate::error::{Result, TpError};

/// Last accepted progress report for one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEntry {
    pub epoch: u64,
    pub seq: u64,
    pub payload_bytes_filled: u64,
    pub state: ProgressState,
}

/// Ring-sized monotonic progress validator.
pub struct ProgressTracker {
    entries: Vec<Option<ProgressEntry>>,
    mask: u64,
}

impl ProgressTracker {
    /// `nslots` must match the stream's header ring.
    pub fn new(nslots: u32) -> Result<Self> {
        if nslots == 0 || !nslots.is_power_of_two() {
            return Err(TpError::invalid(format!(
                "nslots {nslots} not a power of two"
            )));
        }
        Ok(Self {
            entries: vec![None; nslots as usize],
            mask: u64::from(nslots - 1),
        })
    }

    /// Validate and record one progress report.
    ///
    /// Regressions within the same (epoch, seq) are rejected; a new epoch
    /// or a wrapped sequence replaces the slot's entry.
    pub fn apply(&mut self, progress: &FrameProgress) -> Result<ProgressEntry> {
        let index = (progress.seq & self.mask) as usize;
        let entry = &mut self.entries[index];

        if let Some(existing) = entry {
            if existing.epoch == progress.epoch && existing.seq == progress.seq {
                if progress.payload_bytes_filled < existing.payload_bytes_filled {
                    return Err(TpError::invalid(format!(
                        "progress regression for seq {}: {} < {}",
                        progress.seq, progress.payload_bytes_filled, existing.payload_bytes_filled
                    )));
                }
            }
        }

        let updated = ProgressEntry {
            epoch: progress.epoch,
            seq: progress.seq,
            payload_bytes_filled: progress.payload_bytes_filled,
            state: progress.state,
        };
        *entry = Some(updated);
        Ok(updated)
    }

    /// Last accepted entry whose (epoch, seq) matches.
    #[must_use]
    pub fn get(&self, epoch: u64, seq: u64) -> Option<ProgressEntry> {
        self.entries[(seq & self.mask) as usize]
            .filter(|e| e.epoch == epoch && e.seq == seq)
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }
}
