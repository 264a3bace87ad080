//! Bandwidth measurements and the run report

use std::fmt;

use hits_gpu::DeviceId;
use serde::Serialize;

use crate::channel::Channel;
use crate::config::{AllocPolicy, ChannelSpec, Direction, RunConfig};

/// Bytes per second for `iterations` copies of `bytes_per_iter` in `elapsed_secs`
pub fn bandwidth(bytes_per_iter: u64, iterations: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    bytes_per_iter as f64 * iterations as f64 / elapsed_secs
}

/// Timing of one channel between its start and stop marks
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub elapsed_secs: f64,
    pub bytes_total: u64,
    pub bandwidth_bytes_per_sec: f64,
}

impl Measurement {
    pub fn new(bytes_per_iter: u64, iterations: u64, elapsed_secs: f64) -> Self {
        Self {
            elapsed_secs,
            bytes_total: bytes_per_iter.saturating_mul(iterations),
            bandwidth_bytes_per_sec: bandwidth(bytes_per_iter, iterations, elapsed_secs),
        }
    }

    /// Bandwidth in decimal gigabytes per second
    pub fn gigabytes_per_sec(&self) -> f64 {
        self.bandwidth_bytes_per_sec / 1e9
    }
}

/// PCI bus of a device, as printed next to its id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceLabel {
    pub device: DeviceId,
    pub pci_bus_id: u32,
}

impl fmt::Display for DeviceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device {} (0x{:02x})", self.device, self.pci_bus_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    pub index: usize,
    pub spec: ChannelSpec,
    pub direction: Direction,
    pub primary: DeviceLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<DeviceLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa_node: Option<u32>,
    /// `None` when the channel never ran
    pub measurement: Option<Measurement>,
}

impl ChannelReport {
    pub(crate) fn new(channel: &Channel, measurement: Option<Measurement>) -> Self {
        let label = |device: DeviceId, bus: Option<u32>| DeviceLabel {
            device,
            pci_bus_id: bus.unwrap_or_default(),
        };

        Self {
            index: channel.index(),
            spec: channel.spec(),
            direction: channel.direction(),
            primary: label(
                channel.primary_device(),
                channel.primary_properties().map(|p| p.pci_bus_id),
            ),
            secondary: channel.secondary_device().map(|device| {
                label(device, channel.secondary_properties().map(|p| p.pci_bus_id))
            }),
            numa_node: channel.numa_node(),
            measurement,
        }
    }
}

impl fmt::Display for ChannelReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transfer {} - ", self.index)?;
        match self.secondary {
            Some(src) => write!(f, "P2P transfers from {} to {}", src, self.primary)?,
            None => write!(
                f,
                "Direct transfers ({}) with {}",
                self.direction, self.primary
            )?,
        }

        match &self.measurement {
            Some(m) => write!(
                f,
                ": {:.3} GB/s  ({:.2} seconds)",
                m.gigabytes_per_sec(),
                m.elapsed_secs
            ),
            None => f.write_str(": not measured"),
        }
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub runtime: String,
    pub iterations: u64,
    pub transfer_size: u64,
    pub policy: AllocPolicy,
    pub channels: Vec<ChannelReport>,
}

impl BenchmarkReport {
    pub(crate) fn new(runtime: &str, config: &RunConfig, channels: Vec<ChannelReport>) -> Self {
        Self {
            runtime: runtime.to_string(),
            iterations: config.iterations,
            transfer_size: config.transfer_size,
            policy: config.policy,
            channels,
        }
    }

    /// Sum of the bandwidths of every measured channel
    pub fn aggregate_bandwidth(&self) -> f64 {
        self.channels
            .iter()
            .filter_map(|c| c.measurement.as_ref())
            .map(|m| m.bandwidth_bytes_per_sec)
            .sum()
    }
}
