// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Generic duty-cycle worker.
//!
//! An [`AgentRunner`] loops a `do_work` closure on its own named thread and
//! applies an [`IdleStrategy`] whenever a pass returns zero work. Start,
//! stop, and close are idempotent; a closed runner cannot be restarted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{Result, TpError};

/// What to do when a work pass produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Sleep a fixed duration.
    Sleeping { sleep_ns: u64 },
    /// Cooperative `yield_now`.
    Yielding,
    /// Spin without yielding the CPU.
    BusySpin,
    /// Return to the loop immediately.
    Noop,
    /// Spin, then yield, then park with doubling periods.
    Backoff(BackoffConfig),
}

/// Parameters for [`IdleStrategy::Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub max_spins: u64,
    pub max_yields: u64,
    pub min_park_period_ns: u64,
    pub max_park_period_ns: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_spins: 10,
            max_yields: 5,
            min_park_period_ns: 1_000,
            max_park_period_ns: 1_000_000,
        }
    }
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self::Sleeping {
            sleep_ns: 1_000_000,
        }
    }
}

/// Mutable idle state carried between passes.
#[derive(Debug, Default)]
struct IdleState {
    spins: u64,
    yields: u64,
    park_ns: u64,
}

impl IdleState {
    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park_ns = 0;
    }

    fn idle(&mut self, strategy: &IdleStrategy) {
        match strategy {
            IdleStrategy::Sleeping { sleep_ns } => {
                thread::sleep(Duration::from_nanos(*sleep_ns));
            }
            IdleStrategy::Yielding => thread::yield_now(),
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Noop => {}
            IdleStrategy::Backoff(cfg) => {
                if self.spins < cfg.max_spins {
                    self.spins += 1;
                    std::hint::spin_loop();
                } else if self.yields < cfg.max_yields {
                    self.yields += 1;
                    thread::yield_now();
                } else {
                    if self.park_ns == 0 {
                        self.park_ns = cfg.min_park_period_ns;
                    }
                    thread::sleep(Duration::from_nanos(self.park_ns));
                    self.park_ns = (self.park_ns * 2).min(cfg.max_park_period_ns);
                }
            }
        }
    }
}

const STATE_INIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Runs a work function on a dedicated thread until stopped.
pub struct AgentRunner {
    role: String,
    state: Arc<AtomicU8>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AgentRunner {
    /// Spawn `do_work` on a thread named `role`.
    ///
    /// The closure returns the amount of work done in one pass; zero engages
    /// the idle strategy. Returning an error logs it and keeps looping.
    pub fn start<F>(role: &str, strategy: IdleStrategy, mut do_work: F) -> Result<Self>
    where
        F: FnMut() -> Result<usize> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));
        let thread_state = Arc::clone(&state);
        let thread_role = role.to_string();

        let handle = thread::Builder::new()
            .name(role.to_string())
            .spawn(move || {
                let mut idle = IdleState::default();
                while thread_state.load(Ordering::Acquire) == STATE_RUNNING {
                    match do_work() {
                        Ok(0) => idle.idle(&strategy),
                        Ok(_) => idle.reset(),
                        Err(e) => {
                            log::warn!("[agent] {} work error: {}", thread_role, e);
                            idle.idle(&strategy);
                        }
                    }
                }
            })
            .map_err(|e| TpError::internal(format!("agent spawn failed: {e}")))?;

        log::debug!("[agent] started role='{role}'");
        Ok(Self {
            role: role.to_string(),
            state,
            handle: Some(handle),
        })
    }

    /// Signal the loop to exit and join the thread. Idempotent.
    pub fn stop(&mut self) {
        let prev = self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|v| v);
        if prev == STATE_RUNNING {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            log::debug!("[agent] stopped role='{}'", self.role);
        }
    }

    /// Stop (if still running) and mark the runner closed.
    pub fn close(&mut self) {
        self.stop();
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_work_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut runner = AgentRunner::start("test-agent", IdleStrategy::Yielding, move || {
            c.fetch_add(1, Ordering::Relaxed);
            Ok(1)
        })
        .expect("start failed");

        while count.load(Ordering::Relaxed) < 10 {
            thread::yield_now();
        }
        runner.stop();
        assert!(!runner.is_running());
    }

    #[test]
    fn test_stop_idempotent() {
        let mut runner =
            AgentRunner::start("idem", IdleStrategy::default(), || Ok(0)).expect("start failed");
        runner.stop();
        runner.stop();
        runner.close();
        runner.close();
    }

    #[test]
    fn test_error_keeps_looping() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut runner = AgentRunner::start("flaky", IdleStrategy::Noop, move || {
            let n = c.fetch_add(1, Ordering::Relaxed);
            if n % 2 == 0 {
                Err(TpError::internal("boom"))
            } else {
                Ok(1)
            }
        })
        .expect("start failed");

        while count.load(Ordering::Relaxed) < 6 {
            thread::yield_now();
        }
        runner.stop();
    }

    #[test]
    fn test_backoff_defaults() {
        let cfg = BackoffConfig::default();
        assert!(cfg.min_park_period_ns <= cfg.max_park_period_ns);
    }
}
