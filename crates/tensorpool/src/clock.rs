// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Nanosecond clocks.
//!
//! All timestamps in the fabric are `u64` nanoseconds. Timers and lease
//! expiries use the monotonic clock; epoch generation and wire timestamps
//! use the realtime clock so they stay meaningful across process restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn gettime_ns(clock_id: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec and clock_id is one of the
    // CLOCK_* constants; clock_gettime only writes through the pointer.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc < 0 {
        return 0;
    }
    (ts.tv_sec as u64).wrapping_mul(1_000_000_000) + ts.tv_nsec as u64
}

/// Current monotonic time in nanoseconds.
#[must_use]
pub fn now_ns() -> u64 {
    gettime_ns(libc::CLOCK_MONOTONIC)
}

/// Current realtime (wall-clock) time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_realtime_ns() -> u64 {
    gettime_ns(libc::CLOCK_REALTIME)
}

/// Time source seam so driver sweeps and lease expiry are testable.
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds.
    fn now_ns(&self) -> u64;
    /// Realtime nanoseconds.
    fn now_realtime_ns(&self) -> u64 {
        now_realtime_ns()
    }
}

/// System clock backed by `clock_gettime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        now_ns()
    }
}

/// Hand-advanced clock for deterministic tests.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ns)),
        }
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn now_realtime_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_realtime_nonzero() {
        assert!(now_realtime_ns() > 0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ns(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ns(), 150);
        clock.set(10);
        assert_eq!(clock.now_ns(), 10);
    }
}
