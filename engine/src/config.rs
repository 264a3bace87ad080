//! Run configuration

use std::fmt;

use hits_gpu::{CopyKind, DeviceId};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Largest supported per-iteration transfer (1 GiB)
pub const MAX_TRANSFER_SIZE: u64 = 1 << 30;

pub const DEFAULT_TRANSFER_SIZE: u64 = MAX_TRANSFER_SIZE;

pub const DEFAULT_ITERATIONS: u64 = 100;

/// Direction of a transfer channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl Direction {
    /// Copy primitive used for direct (non-peer) channels
    pub fn copy_kind(self) -> Option<CopyKind> {
        match self {
            Direction::HostToDevice => Some(CopyKind::HostToDevice),
            Direction::DeviceToHost => Some(CopyKind::DeviceToHost),
            Direction::DeviceToDevice => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::HostToDevice => "Host to Device",
            Direction::DeviceToHost => "Device to Host",
            Direction::DeviceToDevice => "Device to Device",
        })
    }
}

/// One requested transfer path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum ChannelSpec {
    HostToDevice { device: DeviceId },
    DeviceToHost { device: DeviceId },
    /// Peer copy from `src` into `dst`
    DeviceToDevice { dst: DeviceId, src: DeviceId },
}

impl ChannelSpec {
    pub fn direction(&self) -> Direction {
        match self {
            ChannelSpec::HostToDevice { .. } => Direction::HostToDevice,
            ChannelSpec::DeviceToHost { .. } => Direction::DeviceToHost,
            ChannelSpec::DeviceToDevice { .. } => Direction::DeviceToDevice,
        }
    }

    /// Device owning the channel's stream (the destination for peer copies)
    pub fn primary_device(&self) -> DeviceId {
        match *self {
            ChannelSpec::HostToDevice { device } | ChannelSpec::DeviceToHost { device } => device,
            ChannelSpec::DeviceToDevice { dst, .. } => dst,
        }
    }

    /// Source device of a peer copy, `None` for host channels
    pub fn secondary_device(&self) -> Option<DeviceId> {
        match *self {
            ChannelSpec::DeviceToDevice { src, .. } => Some(src),
            _ => None,
        }
    }

    /// Every device the channel touches, primary first
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> {
        std::iter::once(self.primary_device()).chain(self.secondary_device())
    }
}

/// Host allocation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocPolicy {
    /// Steer host buffers to the NUMA node closest to the device
    pub numa_aware: bool,

    /// Use page-locked host memory instead of pageable allocations
    pub pinned: bool,
}

impl Default for AllocPolicy {
    fn default() -> Self {
        Self {
            numa_aware: true,
            pinned: true,
        }
    }
}

/// Finished configuration for one benchmark run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Channels in the order they were requested
    pub channels: Vec<ChannelSpec>,

    /// Copies issued per channel
    pub iterations: u64,

    /// Bytes moved by each copy
    pub transfer_size: u64,

    pub policy: AllocPolicy,
}

impl RunConfig {
    /// Configuration with default iteration count, size and policy
    pub fn new(channels: Vec<ChannelSpec>) -> Self {
        Self {
            channels,
            iterations: DEFAULT_ITERATIONS,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            policy: AllocPolicy::default(),
        }
    }

    /// Bytes each channel moves over the whole run
    pub fn bytes_per_channel(&self) -> u64 {
        self.transfer_size.saturating_mul(self.iterations)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.channels.is_empty() {
            return Err(EngineError::Configuration(
                "at least one --htod, --dtoh or --dtod transfer is required".to_string(),
            ));
        }

        if self.transfer_size == 0 {
            return Err(EngineError::Configuration(
                "transfer size must be greater than 0".to_string(),
            ));
        }

        if self.transfer_size > MAX_TRANSFER_SIZE {
            return Err(EngineError::Configuration(format!(
                "maximum transfer size value is {}",
                MAX_TRANSFER_SIZE
            )));
        }

        Ok(())
    }
}
