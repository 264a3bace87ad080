//! Transfer channel
//!
//! A channel is one configured transfer path. It owns its buffers, its stream
//! and its two timing events, and moves through
//! `Uninitialized → Ready → Running → Stopped → Finalized`.

use hits_gpu::{DeviceId, DeviceProperties, GpuRuntime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffer::ChannelResources;
use crate::config::{ChannelSpec, Direction};
use crate::error::{ChannelContext, EngineError};

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Requested, nothing acquired yet
    Uninitialized,
    /// Buffers, stream and events acquired
    Ready,
    /// Start mark recorded, copies being issued
    Running,
    /// Stop mark recorded after the final copy
    Stopped,
    /// Stream drained
    Finalized,
}

/// Properties snapshot taken at allocation time
#[derive(Debug, Clone)]
pub(crate) struct Placement {
    pub primary: DeviceProperties,
    pub secondary: Option<DeviceProperties>,
    pub numa_node: Option<u32>,
}

#[derive(Debug)]
pub struct Channel {
    index: usize,
    spec: ChannelSpec,
    state: ChannelState,
    started: bool,
    placement: Option<Placement>,
    resources: Option<ChannelResources>,
}

impl Channel {
    pub fn new(index: usize, spec: ChannelSpec) -> Self {
        Self {
            index,
            spec,
            state: ChannelState::Uninitialized,
            started: false,
            placement: None,
            resources: None,
        }
    }

    /// Position in the run configuration
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> ChannelSpec {
        self.spec
    }

    pub fn direction(&self) -> Direction {
        self.spec.direction()
    }

    pub fn primary_device(&self) -> DeviceId {
        self.spec.primary_device()
    }

    pub fn secondary_device(&self) -> Option<DeviceId> {
        self.spec.secondary_device()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the first iteration has been issued
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// NUMA node the host buffer was steered to
    pub fn numa_node(&self) -> Option<u32> {
        self.placement.as_ref().and_then(|p| p.numa_node)
    }

    pub fn primary_properties(&self) -> Option<&DeviceProperties> {
        self.placement.as_ref().map(|p| &p.primary)
    }

    pub fn secondary_properties(&self) -> Option<&DeviceProperties> {
        self.placement.as_ref().and_then(|p| p.secondary.as_ref())
    }

    pub fn resources(&self) -> Option<&ChannelResources> {
        self.resources.as_ref()
    }

    fn invalid(&self, action: &'static str) -> EngineError {
        EngineError::InvalidState {
            channel: self.index,
            action,
            state: self.state,
        }
    }

    /// Install freshly acquired resources: `Uninitialized → Ready`
    pub(crate) fn mark_ready(
        &mut self,
        resources: ChannelResources,
        placement: Placement,
    ) -> Result<(), EngineError> {
        if self.state != ChannelState::Uninitialized {
            return Err(self.invalid("install resources"));
        }
        self.resources = Some(resources);
        self.placement = Some(placement);
        self.state = ChannelState::Ready;
        Ok(())
    }

    /// Issue iteration `iteration` of `iterations`.
    ///
    /// The first call records the start mark before its copy and the last
    /// one records the stop mark after it. Never blocks.
    pub(crate) fn issue(
        &mut self,
        runtime: &dyn GpuRuntime,
        iteration: u64,
        iterations: u64,
        bytes: usize,
    ) -> Result<(), EngineError> {
        let first = iteration == 0;
        let last = iteration + 1 == iterations;
        match self.state {
            ChannelState::Ready if first => {}
            ChannelState::Running if !first && iteration < iterations => {}
            _ => return Err(self.invalid("issue a copy")),
        }

        let Some(res) = self.resources.as_ref() else {
            return Err(self.invalid("issue a copy"));
        };
        let channel = self.index;
        let device = res.device;

        if !self.started {
            self.announce();
            runtime
                .record_event(device, res.start_mark, res.stream)
                .on_channel(channel, device)?;
            self.started = true;
            self.state = ChannelState::Running;
        }

        let dst = res.destination.addr();
        let src = res.source.addr();
        match self.spec {
            ChannelSpec::DeviceToDevice { dst: dst_device, src: src_device } => {
                // SAFETY: both buffers are device allocations of at least
                // `bytes` owned by this channel and freed only after the
                // stream has drained.
                unsafe {
                    runtime.memcpy_peer_async(dst, dst_device, src, src_device, bytes, res.stream)
                }
                .on_channel(channel, dst_device)?;
            }
            ChannelSpec::HostToDevice { .. } | ChannelSpec::DeviceToHost { .. } => {
                let Some(kind) = self.spec.direction().copy_kind() else {
                    return Err(self.invalid("issue a direct copy"));
                };
                // SAFETY: host and device buffers are `bytes` long, owned by
                // this channel and freed only after the stream has drained.
                unsafe { runtime.memcpy_async(device, dst, src, bytes, kind, res.stream) }
                    .on_channel(channel, device)?;
            }
        }

        if last {
            runtime
                .record_event(device, res.stop_mark, res.stream)
                .on_channel(channel, device)?;
            self.state = ChannelState::Stopped;
            debug!("Transfer {} issued its final copy", channel);
        }

        Ok(())
    }

    /// Block until the channel's stream has drained: `Stopped → Finalized`.
    ///
    /// A channel that never ran (zero iterations) goes straight from `Ready`.
    pub(crate) fn finalize(&mut self, runtime: &dyn GpuRuntime) -> Result<(), EngineError> {
        if !matches!(self.state, ChannelState::Stopped | ChannelState::Ready) {
            return Err(self.invalid("synchronize"));
        }
        let Some(res) = self.resources.as_ref() else {
            return Err(self.invalid("synchronize"));
        };

        runtime
            .stream_synchronize(res.device, res.stream)
            .on_channel(self.index, res.device)?;
        self.state = ChannelState::Finalized;
        Ok(())
    }

    /// Give every resource back to the runtime.
    ///
    /// A channel interrupted mid-run has its stream drained first so that no
    /// copy still references memory being freed.
    pub(crate) fn release(&mut self, runtime: &dyn GpuRuntime) -> Result<(), EngineError> {
        let Some(res) = self.resources.take() else {
            return Ok(());
        };

        if matches!(self.state, ChannelState::Running | ChannelState::Stopped) {
            if let Err(e) = runtime.stream_synchronize(res.device, res.stream) {
                debug!("Draining transfer {} before release failed: {}", self.index, e);
            }
        }
        res.release(runtime, self.index)
    }

    fn announce(&self) {
        let bus = |p: Option<&DeviceProperties>| p.map(|p| p.pci_bus_id).unwrap_or_default();

        match self.spec {
            ChannelSpec::DeviceToDevice { dst, src } => info!(
                "Launching P2P PCIe transfers from Device {} (0x{:02x}) to Device {} (0x{:02x})",
                src,
                bus(self.secondary_properties()),
                dst,
                bus(self.primary_properties()),
            ),
            _ => {
                let numa = self
                    .numa_node()
                    .map(|node| format!(" - Host buffer allocated on NUMA node {}", node))
                    .unwrap_or_default();
                info!(
                    "Launching {} transfers with Device {} (0x{:02x}){}",
                    self.direction(),
                    self.primary_device(),
                    bus(self.primary_properties()),
                    numa
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use hits_gpu::mock::MockRuntime;

    fn ready_channel(rt: &MockRuntime, spec: ChannelSpec) -> Channel {
        let device = spec.primary_device();
        let source_device = spec.secondary_device().unwrap_or(device);
        let (source, destination) = match spec {
            ChannelSpec::HostToDevice { .. } => (
                Buffer::PinnedHost {
                    ptr: rt.host_alloc_pinned(1024, false).unwrap(),
                },
                Buffer::Device {
                    device,
                    ptr: rt.device_alloc(device, 1024).unwrap(),
                },
            ),
            ChannelSpec::DeviceToHost { .. } => (
                Buffer::Device {
                    device,
                    ptr: rt.device_alloc(device, 1024).unwrap(),
                },
                Buffer::PinnedHost {
                    ptr: rt.host_alloc_pinned(1024, false).unwrap(),
                },
            ),
            ChannelSpec::DeviceToDevice { .. } => {
                rt.enable_peer_access(device, source_device).unwrap();
                (
                    Buffer::Device {
                        device: source_device,
                        ptr: rt.device_alloc(source_device, 1024).unwrap(),
                    },
                    Buffer::Device {
                        device,
                        ptr: rt.device_alloc(device, 1024).unwrap(),
                    },
                )
            }
        };

        let resources = ChannelResources {
            device,
            stream: rt.create_stream(device).unwrap(),
            start_mark: rt.create_event(device).unwrap(),
            stop_mark: rt.create_event(device).unwrap(),
            source,
            destination,
        };
        let placement = Placement {
            primary: rt.device_properties(device).unwrap(),
            secondary: spec.secondary_device().map(|d| rt.device_properties(d).unwrap()),
            numa_node: None,
        };

        let mut channel = Channel::new(0, spec);
        channel.mark_ready(resources, placement).unwrap();
        channel
    }

    #[test]
    fn test_lifecycle_marks_recorded_once() {
        let rt = MockRuntime::new(1);
        let mut channel = ready_channel(&rt, ChannelSpec::HostToDevice { device: 0 });
        assert_eq!(channel.state(), ChannelState::Ready);
        assert!(!channel.is_started());

        let iterations = 5;
        for i in 0..iterations {
            channel.issue(&rt, i, iterations, 1024).unwrap();
            assert!(channel.is_started());
            let expected = if i + 1 == iterations {
                ChannelState::Stopped
            } else {
                ChannelState::Running
            };
            assert_eq!(channel.state(), expected);
        }

        let res = channel.resources().unwrap();
        assert_eq!(rt.event_records(res.start_mark), Some(1));
        assert_eq!(rt.event_records(res.stop_mark), Some(1));
        assert_eq!(rt.stream_copies(res.stream), Some(5));

        channel.finalize(&rt).unwrap();
        assert_eq!(channel.state(), ChannelState::Finalized);
    }

    #[test]
    fn test_single_iteration_records_both_marks() {
        let rt = MockRuntime::new(1);
        let mut channel = ready_channel(&rt, ChannelSpec::DeviceToHost { device: 0 });
        channel.issue(&rt, 0, 1, 1024).unwrap();
        assert_eq!(channel.state(), ChannelState::Stopped);

        let res = channel.resources().unwrap();
        assert_eq!(rt.event_records(res.start_mark), Some(1));
        assert_eq!(rt.event_records(res.stop_mark), Some(1));
    }

    #[test]
    fn test_peer_channel_uses_peer_copy() {
        let rt = MockRuntime::new(2).with_peer_access(0, 1);
        let mut channel = ready_channel(&rt, ChannelSpec::DeviceToDevice { dst: 1, src: 0 });
        channel.issue(&rt, 0, 2, 1024).unwrap();
        channel.issue(&rt, 1, 2, 1024).unwrap();

        assert_eq!(rt.call_count("hipMemcpyPeerAsync"), 2);
        assert_eq!(rt.call_count("hipMemcpyAsync"), 0);
    }

    #[test]
    fn test_finalized_channel_cannot_rerun() {
        let rt = MockRuntime::new(1);
        let mut channel = ready_channel(&rt, ChannelSpec::HostToDevice { device: 0 });
        channel.issue(&rt, 0, 1, 1024).unwrap();
        channel.finalize(&rt).unwrap();

        let err = channel.issue(&rt, 0, 1, 1024).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                state: ChannelState::Finalized,
                ..
            }
        ));
        assert!(channel.finalize(&rt).is_err());
    }

    #[test]
    fn test_running_channel_cannot_finalize() {
        let rt = MockRuntime::new(1);
        let mut channel = ready_channel(&rt, ChannelSpec::HostToDevice { device: 0 });
        channel.issue(&rt, 0, 3, 1024).unwrap();
        assert!(channel.finalize(&rt).is_err());
    }

    #[test]
    fn test_idle_channel_finalizes_without_marks() {
        let rt = MockRuntime::new(1);
        let mut channel = ready_channel(&rt, ChannelSpec::HostToDevice { device: 0 });
        channel.finalize(&rt).unwrap();

        assert_eq!(channel.state(), ChannelState::Finalized);
        assert!(!channel.is_started());
        let res = channel.resources().unwrap();
        assert_eq!(rt.event_records(res.start_mark), Some(0));
    }

    #[test]
    fn test_copy_failure_names_channel_and_device() {
        let rt = MockRuntime::new(1).fail_call_after("hipMemcpyAsync", 1, 1);
        let mut channel = ready_channel(&rt, ChannelSpec::HostToDevice { device: 0 });
        channel.issue(&rt, 0, 3, 1024).unwrap();

        let err = channel.issue(&rt, 1, 3, 1024).unwrap_err();
        match err {
            EngineError::ChannelCall {
                channel, device, ref source, ..
            } => {
                assert_eq!(channel, 0);
                assert_eq!(device, 0);
                assert_eq!(source.call, "hipMemcpyAsync");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_release_returns_everything() {
        let rt = MockRuntime::new(1);
        let mut channel = ready_channel(&rt, ChannelSpec::HostToDevice { device: 0 });
        channel.issue(&rt, 0, 2, 1024).unwrap();

        channel.release(&rt).unwrap();
        assert!(channel.resources().is_none());
        assert_eq!(rt.live_device_buffers(), 0);
        assert_eq!(rt.live_pinned_buffers(), 0);
        assert_eq!(rt.live_events(), 0);
        assert_eq!(rt.live_streams(), 0);
        // Interrupted mid-run, so the stream was drained first
        assert_eq!(rt.synchronizations(), 1);
    }
}
