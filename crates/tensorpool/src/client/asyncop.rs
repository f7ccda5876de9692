// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Arena of in-flight async operations.
//!
//! Callers get a small token; the conductor completes operations by
//! writing through the token. Generations catch stale tokens after a
//! slot is reused. No handle ever points back at its owner.

use std::sync::Arc;

use crate::error::{Result, TpError};
use crate::transport::{Publication, Subscription};

/// What an async add resolves to.
pub enum AsyncAddResult {
    Publication(Arc<dyn Publication>),
    Subscription(Arc<dyn Subscription>),
}

/// Opaque handle to one in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncToken {
    index: u32,
    generation: u32,
}

enum SlotState {
    Free,
    Pending,
    Done(Result<AsyncAddResult>),
}

struct Slot {
    generation: u32,
    state: SlotState,
}

/// Slab of operation slots with a free list.
#[derive(Default)]
pub struct AsyncArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl AsyncArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot in `Pending` state.
    pub fn allocate(&mut self) -> AsyncToken {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = SlotState::Pending;
            return AsyncToken {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Pending,
        });
        AsyncToken {
            index,
            generation: 0,
        }
    }

    fn slot_mut(&mut self, token: AsyncToken) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(token.index as usize)
            .filter(|s| s.generation == token.generation)
            .ok_or_else(|| TpError::invalid("stale async token"))?;
        Ok(slot)
    }

    /// Write the outcome for a pending operation.
    pub fn complete(&mut self, token: AsyncToken, outcome: Result<AsyncAddResult>) {
        match self.slot_mut(token) {
            Ok(slot) => match slot.state {
                SlotState::Pending => slot.state = SlotState::Done(outcome),
                _ => log::warn!("[async] completing a non-pending slot, dropping outcome"),
            },
            Err(_) => log::warn!("[async] completion for stale token dropped"),
        }
    }

    /// Poll: `Ok(None)` while pending; consuming the outcome frees the
    /// slot. A second take with the same token is an error.
    pub fn take(&mut self, token: AsyncToken) -> Result<Option<Result<AsyncAddResult>>> {
        let slot = self.slot_mut(token)?;
        match &slot.state {
            SlotState::Pending => Ok(None),
            SlotState::Free => Err(TpError::invalid("async token already consumed")),
            SlotState::Done(_) => {
                let state = std::mem::replace(&mut slot.state, SlotState::Free);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(token.index);
                match state {
                    SlotState::Done(outcome) => Ok(Some(outcome)),
                    _ => unreachable!("state checked above"),
                }
            }
        }
    }

    /// Abandon a pending operation (e.g. command queue full).
    pub fn release(&mut self, token: AsyncToken) {
        if let Ok(slot) = self.slot_mut(token) {
            slot.state = SlotState::Free;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(token.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_complete_take() {
        let mut arena = AsyncArena::new();
        let token = arena.allocate();
        assert!(arena.take(token).expect("take failed").is_none());

        arena.complete(token, Err(TpError::internal("boom")));
        let outcome = arena
            .take(token)
            .expect("take failed")
            .expect("should be done");
        assert!(outcome.is_err());

        // Token is stale after consumption.
        assert!(arena.take(token).is_err());
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut arena = AsyncArena::new();
        let first = arena.allocate();
        arena.complete(first, Err(TpError::internal("x")));
        let _ = arena.take(first);

        let second = arena.allocate();
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        // The old token no longer resolves.
        assert!(arena.take(first).is_err());
    }

    #[test]
    fn test_release_frees_pending() {
        let mut arena = AsyncArena::new();
        let token = arena.allocate();
        arena.release(token);
        assert!(arena.take(token).is_err());
        let again = arena.allocate();
        assert_eq!(again.index, token.index);
    }
}
