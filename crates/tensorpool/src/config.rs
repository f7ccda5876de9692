// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Configuration for clients, the driver, and the supervisor.
//!
//! Everything is a plain struct with working defaults; the
//! `config-loaders` feature adds YAML loading for the tools.

use std::path::PathBuf;

#[cfg(feature = "config-loaders")]
use serde::{Deserialize, Serialize};

use crate::error::Result;
#[cfg(feature = "config-loaders")]
use crate::error::TpError;

/// One transport endpoint: a channel URI plus a stream id.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
pub struct ChannelConfig {
    pub channel: String,
    pub stream_id: u32,
}

impl ChannelConfig {
    #[must_use]
    pub fn new(channel: &str, stream_id: u32) -> Self {
        Self {
            channel: channel.to_string(),
            stream_id,
        }
    }
}

/// The fabric's well-known control-plane endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(default))]
pub struct ChannelsConfig {
    /// Client requests (attach / detach / keepalive) into the driver.
    pub control: ChannelConfig,
    /// Driver responses, revokes, and shutdown to clients.
    pub control_response: ChannelConfig,
    /// `ShmPoolAnnounce` fan-out.
    pub announce: ChannelConfig,
    /// Frame descriptors and progress.
    pub descriptor: ChannelConfig,
    /// QoS counters.
    pub qos: ChannelConfig,
    /// Data-source announce / metadata.
    pub metadata: ChannelConfig,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            control: ChannelConfig::new("loopback:control", 1001),
            control_response: ChannelConfig::new("loopback:control", 1002),
            announce: ChannelConfig::new("loopback:announce", 1010),
            descriptor: ChannelConfig::new("loopback:descriptor", 1020),
            qos: ChannelConfig::new("loopback:qos", 1030),
            metadata: ChannelConfig::new("loopback:metadata", 1040),
        }
    }
}

/// One payload pool of a stream profile.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
pub struct PoolProfile {
    pub pool_id: u16,
    pub stride_bytes: u32,
}

/// Ring geometry the driver provisions for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
pub struct StreamProfile {
    pub name: String,
    /// Power of two.
    pub header_nslots: u32,
    pub pools: Vec<PoolProfile>,
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            header_nslots: 64,
            pools: vec![PoolProfile {
                pool_id: 1,
                stride_bytes: 1 << 20,
            }],
        }
    }
}

/// Inclusive range of stream ids the driver may hand out dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
pub struct StreamIdRange {
    pub first: u32,
    pub last: u32,
}

/// Old-epoch garbage collection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(default))]
pub struct EpochGcConfig {
    pub enabled: bool,
    /// Newest epochs to keep per stream.
    pub keep: usize,
    /// Only epochs whose mtime is older than this are removed.
    pub min_age_ns: u64,
    pub on_startup: bool,
}

impl Default for EpochGcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keep: 2,
            min_age_ns: 60_000_000_000,
            on_startup: false,
        }
    }
}

/// Supervisor knobs (per-consumer routing).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(default))]
pub struct SupervisorConfig {
    pub per_consumer_enabled: bool,
    pub per_consumer_descriptor_channel: String,
    pub per_consumer_descriptor_base: u32,
    pub per_consumer_descriptor_range: u32,
    pub per_consumer_control_channel: String,
    pub per_consumer_control_base: u32,
    pub per_consumer_control_range: u32,
    pub force_no_shm: bool,
    /// Overrides the consumer transport decision: "" leaves it alone,
    /// "no_shm" forces the payload fallback, "shm" forces the ring.
    pub force_mode: String,
    pub payload_fallback_uri: String,
    pub consumer_capacity: usize,
    pub consumer_stale_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            per_consumer_enabled: false,
            per_consumer_descriptor_channel: "loopback:descriptor".to_string(),
            per_consumer_descriptor_base: 5000,
            per_consumer_descriptor_range: 256,
            per_consumer_control_channel: "loopback:control".to_string(),
            per_consumer_control_base: 6000,
            per_consumer_control_range: 256,
            force_no_shm: false,
            force_mode: String::new(),
            payload_fallback_uri: String::new(),
            consumer_capacity: 64,
            consumer_stale_ms: 10_000,
        }
    }
}

/// Driver configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(default))]
pub struct DriverConfig {
    pub channels: ChannelsConfig,
    /// Base directory for ring files; also an allowed root.
    pub shm_base_dir: PathBuf,
    pub shm_namespace: String,
    /// Octal file mode for ring files; directories add execute bits.
    pub permissions_mode: u32,
    pub require_hugepages: bool,
    pub prefault_shm: bool,
    pub mlock_shm: bool,
    pub stream_id_ranges: Vec<StreamIdRange>,
    pub profiles: Vec<StreamProfile>,
    pub default_profile: String,
    pub allow_dynamic_streams: bool,
    pub announce_period_ms: u64,
    pub lease_keepalive_interval_ms: u64,
    pub lease_expiry_grace_intervals: u64,
    pub node_id_reuse_cooldown_ms: u64,
    pub epoch_gc: EpochGcConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            channels: ChannelsConfig::default(),
            shm_base_dir: PathBuf::from("/dev/shm"),
            shm_namespace: "default".to_string(),
            permissions_mode: 0o600,
            require_hugepages: false,
            prefault_shm: false,
            mlock_shm: false,
            stream_id_ranges: vec![StreamIdRange {
                first: 10_000,
                last: 19_999,
            }],
            profiles: vec![StreamProfile::default()],
            default_profile: "default".to_string(),
            allow_dynamic_streams: true,
            announce_period_ms: 1_000,
            lease_keepalive_interval_ms: 1_000,
            lease_expiry_grace_intervals: 3,
            node_id_reuse_cooldown_ms: 5_000,
            epoch_gc: EpochGcConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&StreamProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn keepalive_interval_ns(&self) -> u64 {
        self.lease_keepalive_interval_ms * 1_000_000
    }

    /// Lease lifetime granted per attach or keepalive.
    #[must_use]
    pub fn lease_duration_ns(&self) -> u64 {
        self.keepalive_interval_ns() * self.lease_expiry_grace_intervals
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(default))]
pub struct ClientConfig {
    pub channels: ChannelsConfig,
    /// Synchronous attach deadline.
    pub driver_timeout_ns: u64,
    /// Cadence at which attached clients emit keepalives.
    pub lease_keepalive_interval_ms: u64,
    /// Default idle-strategy sleep for the conductor agent.
    pub idle_sleep_duration_ns: u64,
    /// Directories ring-file paths may resolve under.
    pub allowed_roots: Vec<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channels: ChannelsConfig::default(),
            driver_timeout_ns: 5_000_000_000,
            lease_keepalive_interval_ms: 1_000,
            idle_sleep_duration_ns: 1_000_000,
            allowed_roots: Vec::new(),
        }
    }
}

#[cfg(feature = "config-loaders")]
impl DriverConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| TpError::invalid(format!("bad driver config {}: {e}", path.display())))
    }
}

#[cfg(feature = "config-loaders")]
impl ClientConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| TpError::invalid(format!("bad client config {}: {e}", path.display())))
    }
}
