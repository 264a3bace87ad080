//! In-process runtime for tests and dry runs
//!
//! `MockRuntime` never touches memory behind the pointers it is handed. It
//! keeps a registry of the streams, events and allocations it gave out, a log
//! of every call, and a virtual clock per stream: each copy advances its
//! stream's clock by `bytes / bandwidth`, and recording an event stamps it with
//! the current clock. Failures can be injected per call name.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    CopyKind, DeviceId, DeviceProperties, EventHandle, GpuRuntime, MemPtr, Result, RuntimeError,
    StreamHandle,
};

// Status codes borrowed from hipError_t so messages read the same as on hardware
pub const ERROR_INVALID_VALUE: i32 = 1;
pub const ERROR_INVALID_DEVICE: i32 = 101;
pub const ERROR_INVALID_HANDLE: i32 = 400;
pub const ERROR_PEER_ACCESS_NOT_ENABLED: i32 = 705;

/// Default simulated link speeds, bytes per second
pub const DEFAULT_HOST_BANDWIDTH: f64 = 25.0e9;
pub const DEFAULT_PEER_BANDWIDTH: f64 = 50.0e9;

const SIMULATED_MEMORY_BYTES: u64 = 64 << 30;
const ADDRESS_STRIDE: usize = 0x1000;

#[derive(Debug)]
struct Fault {
    successes_left: u32,
    code: i32,
}

#[derive(Debug)]
struct MockStream {
    device: DeviceId,
    clock_secs: f64,
    copies: u64,
}

#[derive(Debug)]
struct MockEvent {
    timestamp_secs: Option<f64>,
    records: u32,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: usize,
    calls: Vec<&'static str>,
    faults: HashMap<&'static str, Fault>,
    streams: HashMap<StreamHandle, MockStream>,
    events: HashMap<EventHandle, MockEvent>,
    device_buffers: HashMap<MemPtr, (DeviceId, usize)>,
    pinned_buffers: HashMap<MemPtr, usize>,
    peer_enabled: HashSet<(DeviceId, DeviceId)>,
    device_allocations: u64,
    pinned_allocations: u64,
    numa_user_allocations: u64,
    synchronizations: u64,
}

impl MockState {
    /// Log the call and fire an injected fault if one is due
    #[track_caller]
    fn enter(&mut self, call: &'static str) -> Result<()> {
        self.calls.push(call);
        if let Some(fault) = self.faults.get_mut(call) {
            if fault.successes_left > 0 {
                fault.successes_left -= 1;
            } else {
                let code = fault.code;
                self.faults.remove(call);
                return Err(RuntimeError::new(call, code, "injected failure"));
            }
        }
        Ok(())
    }

    fn next_handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle * ADDRESS_STRIDE
    }

    #[track_caller]
    fn stream_mut(&mut self, call: &'static str, stream: StreamHandle) -> Result<&mut MockStream> {
        self.streams
            .get_mut(&stream)
            .ok_or_else(|| RuntimeError::new(call, ERROR_INVALID_HANDLE, "unknown stream"))
    }

    #[track_caller]
    fn require_device_buffer(
        &self,
        call: &'static str,
        ptr: MemPtr,
        device: DeviceId,
        bytes: usize,
    ) -> Result<()> {
        match self.device_buffers.get(&ptr) {
            Some(&(owner, size)) if owner == device && size >= bytes => Ok(()),
            Some(_) => Err(RuntimeError::new(
                call,
                ERROR_INVALID_VALUE,
                format!("buffer {:#x} does not hold {} bytes on device {}", ptr.0, bytes, device),
            )),
            None => Err(RuntimeError::new(
                call,
                ERROR_INVALID_VALUE,
                format!("{:#x} is not a device allocation", ptr.0),
            )),
        }
    }
}

/// Fake accelerator runtime with a deterministic virtual clock
#[derive(Debug)]
pub struct MockRuntime {
    devices: Vec<DeviceProperties>,
    peers: HashSet<(DeviceId, DeviceId)>,
    host_bandwidth: f64,
    peer_bandwidth: f64,
    null_allocations: bool,
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// A runtime exposing `device_count` devices with no peer connectivity
    pub fn new(device_count: u32) -> Self {
        let devices = (0..device_count)
            .map(|i| DeviceProperties {
                name: format!("Simulated GPU {}", i),
                pci_domain_id: 0,
                pci_bus_id: 0x10 * (i + 1),
                pci_device_id: 0,
                total_memory_bytes: SIMULATED_MEMORY_BYTES,
            })
            .collect();

        Self {
            devices,
            peers: HashSet::new(),
            host_bandwidth: DEFAULT_HOST_BANDWIDTH,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            null_allocations: false,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Allow peer access between `a` and `b`, in both directions
    pub fn with_peer_access(mut self, a: DeviceId, b: DeviceId) -> Self {
        self.peers.insert((a, b));
        self.peers.insert((b, a));
        self
    }

    /// Allow peer access between every pair of distinct devices
    pub fn with_full_peer_access(mut self) -> Self {
        let count = self.devices.len() as DeviceId;
        for a in 0..count {
            for b in (0..count).filter(|&b| b != a) {
                self.peers.insert((a, b));
            }
        }
        self
    }

    /// Simulated copy speeds in bytes per second
    pub fn with_bandwidth(mut self, host_to_device: f64, peer: f64) -> Self {
        self.host_bandwidth = host_to_device;
        self.peer_bandwidth = peer;
        self
    }

    /// Make every allocation "succeed" with a null pointer
    pub fn with_null_allocations(mut self) -> Self {
        self.null_allocations = true;
        self
    }

    /// Fail the first invocation of `call` with `code`
    pub fn fail_call(self, call: &'static str, code: i32) -> Self {
        self.fail_call_after(call, 0, code)
    }

    /// Let `call` succeed `successes` times, then fail once with `code`
    pub fn fail_call_after(mut self, call: &'static str, successes: u32, code: i32) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .faults
            .insert(
                call,
                Fault {
                    successes_left: successes,
                    code,
                },
            );
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[track_caller]
    fn check_device(&self, call: &'static str, device: DeviceId) -> Result<()> {
        if (device as usize) < self.devices.len() {
            Ok(())
        } else {
            Err(RuntimeError::new(
                call,
                ERROR_INVALID_DEVICE,
                format!("invalid device ordinal {}", device),
            ))
        }
    }

    /// Properties of the simulated devices, by ordinal
    pub fn devices(&self) -> &[DeviceProperties] {
        &self.devices
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|&&c| c == call).count()
    }

    /// Device buffers allocated over the lifetime of the runtime
    pub fn device_allocations(&self) -> u64 {
        self.state().device_allocations
    }

    /// Pinned host buffers allocated over the lifetime of the runtime
    pub fn pinned_allocations(&self) -> u64 {
        self.state().pinned_allocations
    }

    /// Pinned allocations that asked to follow the caller's NUMA policy
    pub fn numa_user_allocations(&self) -> u64 {
        self.state().numa_user_allocations
    }

    pub fn live_device_buffers(&self) -> usize {
        self.state().device_buffers.len()
    }

    pub fn live_pinned_buffers(&self) -> usize {
        self.state().pinned_buffers.len()
    }

    pub fn live_streams(&self) -> usize {
        self.state().streams.len()
    }

    pub fn live_events(&self) -> usize {
        self.state().events.len()
    }

    /// How many times `event` was recorded, `None` once destroyed
    pub fn event_records(&self, event: EventHandle) -> Option<u32> {
        self.state().events.get(&event).map(|e| e.records)
    }

    /// Copies enqueued on `stream`, `None` once destroyed
    pub fn stream_copies(&self, stream: StreamHandle) -> Option<u64> {
        self.state().streams.get(&stream).map(|s| s.copies)
    }

    pub fn synchronizations(&self) -> u64 {
        self.state().synchronizations
    }

    pub fn peer_access_enabled(&self, device: DeviceId, peer: DeviceId) -> bool {
        self.state().peer_enabled.contains(&(device, peer))
    }
}

impl GpuRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn device_count(&self) -> Result<u32> {
        self.state().enter("hipGetDeviceCount")?;
        Ok(self.devices.len() as u32)
    }

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties> {
        const CALL: &str = "hipGetDeviceProperties";
        self.state().enter(CALL)?;
        self.check_device(CALL, device)?;
        Ok(self.devices[device as usize].clone())
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle> {
        const CALL: &str = "hipStreamCreateWithFlags";
        let mut state = self.state();
        state.enter(CALL)?;
        self.check_device(CALL, device)?;

        let stream = StreamHandle(state.next_handle());
        state.streams.insert(
            stream,
            MockStream {
                device,
                clock_secs: 0.0,
                copies: 0,
            },
        );
        Ok(stream)
    }

    fn destroy_stream(&self, _device: DeviceId, stream: StreamHandle) -> Result<()> {
        const CALL: &str = "hipStreamDestroy";
        let mut state = self.state();
        state.enter(CALL)?;
        state
            .streams
            .remove(&stream)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::new(CALL, ERROR_INVALID_HANDLE, "unknown stream"))
    }

    fn create_event(&self, device: DeviceId) -> Result<EventHandle> {
        const CALL: &str = "hipEventCreate";
        let mut state = self.state();
        state.enter(CALL)?;
        self.check_device(CALL, device)?;

        let event = EventHandle(state.next_handle());
        state.events.insert(
            event,
            MockEvent {
                timestamp_secs: None,
                records: 0,
            },
        );
        Ok(event)
    }

    fn destroy_event(&self, _device: DeviceId, event: EventHandle) -> Result<()> {
        const CALL: &str = "hipEventDestroy";
        let mut state = self.state();
        state.enter(CALL)?;
        state
            .events
            .remove(&event)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::new(CALL, ERROR_INVALID_HANDLE, "unknown event"))
    }

    fn record_event(
        &self,
        _device: DeviceId,
        event: EventHandle,
        stream: StreamHandle,
    ) -> Result<()> {
        const CALL: &str = "hipEventRecord";
        let mut state = self.state();
        state.enter(CALL)?;

        let now = state.stream_mut(CALL, stream)?.clock_secs;
        let event = state
            .events
            .get_mut(&event)
            .ok_or_else(|| RuntimeError::new(CALL, ERROR_INVALID_HANDLE, "unknown event"))?;
        event.timestamp_secs = Some(now);
        event.records += 1;
        Ok(())
    }

    fn elapsed_ms(&self, _device: DeviceId, start: EventHandle, stop: EventHandle) -> Result<f32> {
        const CALL: &str = "hipEventElapsedTime";
        let mut state = self.state();
        state.enter(CALL)?;

        let stamp = |event: EventHandle| {
            state
                .events
                .get(&event)
                .and_then(|e| e.timestamp_secs)
                .ok_or_else(|| {
                    RuntimeError::new(CALL, ERROR_INVALID_HANDLE, "event was never recorded")
                })
        };
        let elapsed_secs = stamp(stop)? - stamp(start)?;
        Ok((elapsed_secs * 1e3) as f32)
    }

    fn device_alloc(&self, device: DeviceId, bytes: usize) -> Result<MemPtr> {
        const CALL: &str = "hipMalloc";
        let mut state = self.state();
        state.enter(CALL)?;
        self.check_device(CALL, device)?;

        if self.null_allocations {
            return Ok(MemPtr::NULL);
        }
        let ptr = MemPtr(state.next_handle());
        state.device_buffers.insert(ptr, (device, bytes));
        state.device_allocations += 1;
        Ok(ptr)
    }

    fn device_free(&self, _device: DeviceId, ptr: MemPtr) -> Result<()> {
        const CALL: &str = "hipFree";
        let mut state = self.state();
        state.enter(CALL)?;
        state
            .device_buffers
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::new(CALL, ERROR_INVALID_VALUE, "not a device allocation"))
    }

    fn host_alloc_pinned(&self, bytes: usize, numa_user: bool) -> Result<MemPtr> {
        let mut state = self.state();
        state.enter("hipHostMalloc")?;

        if self.null_allocations {
            return Ok(MemPtr::NULL);
        }
        let ptr = MemPtr(state.next_handle());
        state.pinned_buffers.insert(ptr, bytes);
        state.pinned_allocations += 1;
        if numa_user {
            state.numa_user_allocations += 1;
        }
        Ok(ptr)
    }

    fn host_free_pinned(&self, ptr: MemPtr) -> Result<()> {
        const CALL: &str = "hipHostFree";
        let mut state = self.state();
        state.enter(CALL)?;
        state
            .pinned_buffers
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::new(CALL, ERROR_INVALID_VALUE, "not a pinned allocation"))
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        const CALL: &str = "hipDeviceCanAccessPeer";
        self.state().enter(CALL)?;
        self.check_device(CALL, device)?;
        self.check_device(CALL, peer)?;
        Ok(self.peers.contains(&(device, peer)))
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        const CALL: &str = "hipDeviceEnablePeerAccess";
        let mut state = self.state();
        state.enter(CALL)?;
        self.check_device(CALL, device)?;
        self.check_device(CALL, peer)?;

        if !self.peers.contains(&(device, peer)) {
            return Err(RuntimeError::new(
                CALL,
                ERROR_INVALID_DEVICE,
                format!("device {} cannot access device {}", device, peer),
            ));
        }
        state.peer_enabled.insert((device, peer));
        Ok(())
    }

    unsafe fn memcpy_async(
        &self,
        device: DeviceId,
        dst: MemPtr,
        src: MemPtr,
        bytes: usize,
        kind: CopyKind,
        stream: StreamHandle,
    ) -> Result<()> {
        const CALL: &str = "hipMemcpyAsync";
        let mut state = self.state();
        state.enter(CALL)?;

        let (device_ptr, host_ptr) = match kind {
            CopyKind::HostToDevice => (dst, src),
            CopyKind::DeviceToHost => (src, dst),
        };
        if host_ptr.is_null() {
            return Err(RuntimeError::new(CALL, ERROR_INVALID_VALUE, "null host pointer"));
        }
        state.require_device_buffer(CALL, device_ptr, device, bytes)?;

        let seconds = bytes as f64 / self.host_bandwidth;
        let stream = state.stream_mut(CALL, stream)?;
        if stream.device != device {
            return Err(RuntimeError::new(
                CALL,
                ERROR_INVALID_HANDLE,
                "stream belongs to another device",
            ));
        }
        stream.clock_secs += seconds;
        stream.copies += 1;
        Ok(())
    }

    unsafe fn memcpy_peer_async(
        &self,
        dst: MemPtr,
        dst_device: DeviceId,
        src: MemPtr,
        src_device: DeviceId,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        const CALL: &str = "hipMemcpyPeerAsync";
        let mut state = self.state();
        state.enter(CALL)?;

        state.require_device_buffer(CALL, dst, dst_device, bytes)?;
        state.require_device_buffer(CALL, src, src_device, bytes)?;
        if !state.peer_enabled.contains(&(dst_device, src_device)) {
            return Err(RuntimeError::new(
                CALL,
                ERROR_PEER_ACCESS_NOT_ENABLED,
                format!("peer access {} -> {} not enabled", dst_device, src_device),
            ));
        }

        let seconds = bytes as f64 / self.peer_bandwidth;
        let stream = state.stream_mut(CALL, stream)?;
        stream.clock_secs += seconds;
        stream.copies += 1;
        Ok(())
    }

    fn stream_synchronize(&self, _device: DeviceId, stream: StreamHandle) -> Result<()> {
        const CALL: &str = "hipStreamSynchronize";
        let mut state = self.state();
        state.enter(CALL)?;
        state.stream_mut(CALL, stream)?;
        state.synchronizations += 1;
        Ok(())
    }
}
