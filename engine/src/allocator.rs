//! Buffer allocation
//!
//! Acquires everything a channel needs before any copy is issued: device
//! properties, the stream, both timing events and the two buffers.

use hits_gpu::{DeviceId, GpuRuntime, MemPtr};
use tracing::{debug, warn};

use crate::buffer::{Buffer, PageableBuffer, PendingResources};
use crate::channel::{Channel, ChannelState, Placement};
use crate::config::{AllocPolicy, ChannelSpec};
use crate::error::{ChannelContext, EngineError, MemoryKind};
use crate::numa::NumaTopology;

pub struct BufferAllocator<'a> {
    runtime: &'a dyn GpuRuntime,
    topology: &'a dyn NumaTopology,
    size: usize,
    policy: AllocPolicy,
}

impl<'a> BufferAllocator<'a> {
    pub fn new(
        runtime: &'a dyn GpuRuntime,
        topology: &'a dyn NumaTopology,
        size: usize,
        policy: AllocPolicy,
    ) -> Self {
        Self {
            runtime,
            topology,
            size,
            policy,
        }
    }

    /// Bring `channel` from `Uninitialized` to `Ready`.
    ///
    /// On failure nothing acquired for the channel is left behind.
    pub fn allocate(&self, channel: &mut Channel) -> Result<(), EngineError> {
        if channel.state() != ChannelState::Uninitialized {
            return Err(EngineError::InvalidState {
                channel: channel.index(),
                action: "allocate",
                state: channel.state(),
            });
        }

        let mut pending = PendingResources::new(channel.primary_device());
        match self.acquire(channel, &mut pending) {
            Ok(placement) => match pending.finish() {
                Ok(resources) => channel.mark_ready(resources, placement),
                Err(incomplete) => {
                    let _ = incomplete.release(self.runtime, channel.index());
                    Err(EngineError::InvalidState {
                        channel: channel.index(),
                        action: "complete allocation",
                        state: channel.state(),
                    })
                }
            },
            Err(e) => {
                if let Err(release) = pending.release(self.runtime, channel.index()) {
                    debug!("Cleanup after failed allocation also failed: {}", release);
                }
                Err(e)
            }
        }
    }

    fn acquire(
        &self,
        channel: &Channel,
        pending: &mut PendingResources,
    ) -> Result<Placement, EngineError> {
        let index = channel.index();
        let device = channel.primary_device();

        let primary = self
            .runtime
            .device_properties(device)
            .on_channel(index, device)?;
        let secondary = match channel.secondary_device() {
            Some(peer) => Some(
                self.runtime
                    .device_properties(peer)
                    .on_channel(index, peer)?,
            ),
            None => None,
        };

        pending.stream = Some(self.runtime.create_stream(device).on_channel(index, device)?);
        pending.start_mark = Some(self.runtime.create_event(device).on_channel(index, device)?);
        pending.stop_mark = Some(self.runtime.create_event(device).on_channel(index, device)?);

        let mut numa_node = None;
        match channel.spec() {
            ChannelSpec::HostToDevice { .. } => {
                numa_node = self.resolve_node(index, primary.pci_domain_id, primary.pci_bus_id);
                pending.source = Some(self.host_buffer(index, device, numa_node)?);
                pending.destination = Some(self.device_buffer(index, device)?);
            }
            ChannelSpec::DeviceToHost { .. } => {
                numa_node = self.resolve_node(index, primary.pci_domain_id, primary.pci_bus_id);
                pending.destination = Some(self.host_buffer(index, device, numa_node)?);
                pending.source = Some(self.device_buffer(index, device)?);
            }
            ChannelSpec::DeviceToDevice { dst, src } => {
                let reachable = self.runtime.can_access_peer(dst, src).on_channel(index, dst)?;
                if !reachable {
                    return Err(EngineError::PeerAccessUnsupported {
                        channel: index,
                        device: dst,
                        peer: src,
                    });
                }
                pending.destination = Some(self.device_buffer(index, dst)?);
                self.runtime
                    .enable_peer_access(dst, src)
                    .on_channel(index, dst)?;
                pending.source = Some(self.device_buffer(index, src)?);
            }
        }

        Ok(Placement {
            primary,
            secondary,
            numa_node,
        })
    }

    fn resolve_node(&self, channel: usize, domain: u32, bus: u32) -> Option<u32> {
        if !self.policy.numa_aware {
            return None;
        }
        let node = self.topology.node_of_pci_bus(domain, bus);
        if node.is_none() {
            debug!(
                "Transfer {}: no NUMA node for bus {:04x}:{:02x}, allocating without preference",
                channel, domain, bus
            );
        }
        node
    }

    /// Host buffer, steered to `node` when one is known
    fn host_buffer(
        &self,
        channel: usize,
        device: DeviceId,
        node: Option<u32>,
    ) -> Result<Buffer, EngineError> {
        let preferred = match node {
            Some(node) => match self.topology.set_preferred(node) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Transfer {}: cannot prefer NUMA node {}: {}", channel, node, e);
                    false
                }
            },
            None => false,
        };

        let buffer = if self.policy.pinned {
            self.runtime
                .host_alloc_pinned(self.size, node.is_some())
                .on_channel(channel, device)
                .and_then(|ptr| self.non_null(channel, ptr, MemoryKind::PinnedHost))
                .map(|ptr| Buffer::PinnedHost { ptr })
        } else {
            PageableBuffer::new(self.size)
                .map(Buffer::PageableHost)
                .ok_or(EngineError::Allocation {
                    channel,
                    memory: MemoryKind::PageableHost,
                    bytes: self.size,
                })
        };

        if preferred {
            if let Err(e) = self.topology.clear_preferred() {
                warn!("Transfer {}: cannot reset NUMA policy: {}", channel, e);
            }
        }

        buffer
    }

    fn device_buffer(&self, channel: usize, device: DeviceId) -> Result<Buffer, EngineError> {
        let ptr = self
            .runtime
            .device_alloc(device, self.size)
            .on_channel(channel, device)?;
        let ptr = self.non_null(channel, ptr, MemoryKind::Device)?;
        Ok(Buffer::Device { device, ptr })
    }

    fn non_null(
        &self,
        channel: usize,
        ptr: MemPtr,
        memory: MemoryKind,
    ) -> Result<MemPtr, EngineError> {
        if ptr.is_null() {
            return Err(EngineError::Allocation {
                channel,
                memory,
                bytes: self.size,
            });
        }
        Ok(ptr)
    }
}
