//! Accelerator runtime capabilities
//!
//! The transfer engine never talks to a vendor runtime directly. Everything it
//! needs (device enumeration, async copies, peer access, event timing) goes
//! through the [`GpuRuntime`] trait. Two implementations ship here:
//! - [`hip::HipRuntime`] (feature `hip`), backed by the ROCm HIP runtime
//! - [`mock::MockRuntime`], an in-process fake with a virtual device clock

pub mod error;
#[cfg(feature = "hip")]
pub mod hip;
pub mod mock;
pub mod pci;

pub use error::{Result, RuntimeError};

use serde::{Deserialize, Serialize};

/// Accelerator ordinal as understood by the runtime
pub type DeviceId = u32;

/// Address of a memory region (device, pinned host or pageable host)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemPtr(pub usize);

impl MemPtr {
    pub const NULL: MemPtr = MemPtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Handle to an asynchronous work queue (HIP stream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub usize);

/// Handle to a timing event recorded on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub usize);

/// Direction of a non-peer copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
}

/// Static description of a device, fetched once and kept for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub name: String,
    pub pci_domain_id: u32,
    pub pci_bus_id: u32,
    pub pci_device_id: u32,
    pub total_memory_bytes: u64,
}

/// Capabilities consumed from the accelerator runtime.
///
/// Every call names the device it targets; implementations that keep a
/// per-thread "current device" select it themselves before issuing the call.
pub trait GpuRuntime: Send + Sync {
    /// Short backend name for logs and reports
    fn name(&self) -> &'static str;

    fn device_count(&self) -> Result<u32>;

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties>;

    /// Create a stream that does not synchronize with the default stream
    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle>;

    fn destroy_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()>;

    fn create_event(&self, device: DeviceId) -> Result<EventHandle>;

    fn destroy_event(&self, device: DeviceId, event: EventHandle) -> Result<()>;

    /// Enqueue a timestamp on `stream`
    fn record_event(&self, device: DeviceId, event: EventHandle, stream: StreamHandle)
        -> Result<()>;

    /// Device-clock time between two recorded events, in milliseconds
    fn elapsed_ms(&self, device: DeviceId, start: EventHandle, stop: EventHandle) -> Result<f32>;

    /// Allocate device memory. A null return is reported to the caller as-is.
    fn device_alloc(&self, device: DeviceId, bytes: usize) -> Result<MemPtr>;

    fn device_free(&self, device: DeviceId, ptr: MemPtr) -> Result<()>;

    /// Allocate page-locked host memory.
    ///
    /// With `numa_user` set the runtime places the pages according to the
    /// calling thread's memory policy instead of its own default.
    fn host_alloc_pinned(&self, bytes: usize, numa_user: bool) -> Result<MemPtr>;

    fn host_free_pinned(&self, ptr: MemPtr) -> Result<()>;

    /// Whether `device` can directly access memory owned by `peer`
    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool>;

    /// Allow `device` to access memory owned by `peer`. Enabling an already
    /// enabled pair succeeds.
    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()>;

    /// Enqueue a host/device copy on `stream` and return immediately.
    ///
    /// # Safety
    ///
    /// `dst` and `src` must each point to at least `bytes` valid bytes of the
    /// memory kind implied by `kind`, and must stay valid until `stream` has
    /// drained.
    unsafe fn memcpy_async(
        &self,
        device: DeviceId,
        dst: MemPtr,
        src: MemPtr,
        bytes: usize,
        kind: CopyKind,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Enqueue a direct device-to-device copy on `stream` and return immediately.
    ///
    /// # Safety
    ///
    /// `dst` must be a device allocation of at least `bytes` on `dst_device`,
    /// `src` one on `src_device`, and both must stay valid until `stream` has
    /// drained.
    unsafe fn memcpy_peer_async(
        &self,
        dst: MemPtr,
        dst_device: DeviceId,
        src: MemPtr,
        src_device: DeviceId,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Block until every operation enqueued on `stream` has completed
    fn stream_synchronize(&self, device: DeviceId, stream: StreamHandle) -> Result<()>;
}
