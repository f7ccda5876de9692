// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Structured error type for every fallible TensorPool operation.
//!
//! Errors are values: they propagate with `?` and surface to user callbacks
//! as `(ErrorKind, message)` pairs. There is no thread-local error state.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TpError>;

/// Coarse error classification surfaced to error handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed message, schema mismatch, out-of-range field, path outside
    /// the allowed roots.
    Invalid,
    /// Attach or wait exceeded its deadline.
    Timeout,
    /// The driver declined a request for policy reasons.
    Rejected,
    /// Allocation failure or an error reported by the transport.
    Internal,
    /// Reader discovered a sequence ahead of the requested one.
    Gap,
    /// Reader discovered a sequence behind the requested one.
    Late,
    /// Slot is mid-write; retry later.
    InProgress,
    /// Lease expired without keepalives.
    LeaseExpired,
    /// Lease revoked by the driver.
    LeaseRevoked,
    /// Driver announced shutdown.
    DriverShutdown,
}

impl ErrorKind {
    /// Lifecycle kinds require the owning producer/consumer to re-attach.
    #[must_use]
    pub fn requires_reattach(self) -> bool {
        matches!(
            self,
            Self::LeaseExpired | Self::LeaseRevoked | Self::DriverShutdown
        )
    }
}

/// Errors produced by TensorPool operations.
#[derive(Debug)]
pub enum TpError {
    /// Malformed input, codec violation, or out-of-bounds field.
    Invalid(String),

    /// Deadline exceeded.
    Timeout(String),

    /// Driver declined the request; carries the driver's message.
    Rejected(String),

    /// Allocation or transport failure.
    Internal(String),

    /// OS-level failure (open, mmap, mkdir, ...).
    Io(io::Error),

    /// Slot holds a newer sequence than requested.
    Gap { want: u64, stored: u64 },

    /// Slot holds an older sequence than requested.
    Late { want: u64, stored: u64 },

    /// Slot's in-progress bit was set.
    InProgress,

    /// Lease expired; re-attach required.
    LeaseExpired,

    /// Lease revoked by the driver; re-attach required.
    LeaseRevoked(String),

    /// Driver shut down; re-attach required once a driver returns.
    DriverShutdown(String),
}

impl TpError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Internal(_) | Self::Io(_) => ErrorKind::Internal,
            Self::Gap { .. } => ErrorKind::Gap,
            Self::Late { .. } => ErrorKind::Late,
            Self::InProgress => ErrorKind::InProgress,
            Self::LeaseExpired => ErrorKind::LeaseExpired,
            Self::LeaseRevoked(_) => ErrorKind::LeaseRevoked,
            Self::DriverShutdown(_) => ErrorKind::DriverShutdown,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl fmt::Display for TpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid: {msg}"),
            Self::Timeout(what) => write!(f, "timed out: {what}"),
            Self::Rejected(msg) => write!(f, "rejected by driver: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Gap { want, stored } => {
                write!(f, "gap: slot holds seq {stored}, wanted {want}")
            }
            Self::Late { want, stored } => {
                write!(f, "late: slot holds seq {stored}, wanted {want}")
            }
            Self::InProgress => write!(f, "slot write in progress"),
            Self::LeaseExpired => write!(f, "lease expired"),
            Self::LeaseRevoked(msg) => write!(f, "lease revoked: {msg}"),
            Self::DriverShutdown(msg) => write!(f, "driver shutdown: {msg}"),
        }
    }
}

impl std::error::Error for TpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TpError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
