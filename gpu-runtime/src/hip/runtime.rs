//! `GpuRuntime` over the HIP runtime API

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;

use tracing::debug;

use super::bindings::*;
use crate::error::GENERIC_FAILURE;
use crate::pci::{ParsePciAddressError, PciAddress};
use crate::{
    CopyKind, DeviceId, DeviceProperties, EventHandle, GpuRuntime, MemPtr, Result, RuntimeError,
    StreamHandle,
};

const NAME_LEN: usize = 256;
const PCI_BUS_ID_LEN: usize = 64;

/// HIP runtime backend.
///
/// Holds no state of its own: streams, events and allocations live in the
/// HIP runtime and are addressed through the handles returned to the caller.
#[derive(Debug)]
pub struct HipRuntime {
    device_count: u32,
}

impl HipRuntime {
    /// Initialize the runtime and enumerate devices
    pub fn new() -> Result<Self> {
        let mut count: c_int = 0;
        check("hipGetDeviceCount", unsafe { hipGetDeviceCount(&mut count) })?;
        debug!("HIP runtime reports {} device(s)", count);

        Ok(Self {
            device_count: count.max(0) as u32,
        })
    }

    #[track_caller]
    fn set_device(&self, device: DeviceId) -> Result<()> {
        check("hipSetDevice", unsafe { hipSetDevice(device as c_int) })
    }
}

#[track_caller]
fn check(call: &'static str, code: hipError_t) -> Result<()> {
    if code == hipSuccess {
        return Ok(());
    }
    Err(RuntimeError::new(call, code, error_string(code)))
}

fn error_string(code: hipError_t) -> String {
    let raw = unsafe { hipGetErrorString(code) };
    if raw.is_null() {
        return format!("unknown HIP error {}", code);
    }
    unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
}

fn c_buffer_to_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

impl GpuRuntime for HipRuntime {
    fn name(&self) -> &'static str {
        "hip"
    }

    fn device_count(&self) -> Result<u32> {
        Ok(self.device_count)
    }

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties> {
        let ordinal = device as c_int;

        let mut name = [0 as c_char; NAME_LEN];
        check("hipDeviceGetName", unsafe {
            hipDeviceGetName(name.as_mut_ptr(), NAME_LEN as c_int, ordinal)
        })?;

        let mut bus_id = [0 as c_char; PCI_BUS_ID_LEN];
        check("hipDeviceGetPCIBusId", unsafe {
            hipDeviceGetPCIBusId(bus_id.as_mut_ptr(), PCI_BUS_ID_LEN as c_int, ordinal)
        })?;
        let bus_id = c_buffer_to_string(&bus_id);
        let address: PciAddress = bus_id.parse().map_err(|e: ParsePciAddressError| {
            RuntimeError::new("hipDeviceGetPCIBusId", GENERIC_FAILURE, e.to_string())
        })?;

        let mut total: usize = 0;
        check("hipDeviceTotalMem", unsafe {
            hipDeviceTotalMem(&mut total, ordinal)
        })?;

        Ok(DeviceProperties {
            name: c_buffer_to_string(&name),
            pci_domain_id: address.domain,
            pci_bus_id: address.bus,
            pci_device_id: address.device,
            total_memory_bytes: total as u64,
        })
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle> {
        self.set_device(device)?;
        let mut stream: hipStream_t = ptr::null_mut();
        check("hipStreamCreateWithFlags", unsafe {
            hipStreamCreateWithFlags(&mut stream, hipStreamNonBlocking)
        })?;
        Ok(StreamHandle(stream as usize))
    }

    fn destroy_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()> {
        self.set_device(device)?;
        check("hipStreamDestroy", unsafe {
            hipStreamDestroy(stream.0 as hipStream_t)
        })
    }

    fn create_event(&self, device: DeviceId) -> Result<EventHandle> {
        self.set_device(device)?;
        let mut event: hipEvent_t = ptr::null_mut();
        check("hipEventCreate", unsafe { hipEventCreate(&mut event) })?;
        Ok(EventHandle(event as usize))
    }

    fn destroy_event(&self, device: DeviceId, event: EventHandle) -> Result<()> {
        self.set_device(device)?;
        check("hipEventDestroy", unsafe {
            hipEventDestroy(event.0 as hipEvent_t)
        })
    }

    fn record_event(
        &self,
        device: DeviceId,
        event: EventHandle,
        stream: StreamHandle,
    ) -> Result<()> {
        self.set_device(device)?;
        check("hipEventRecord", unsafe {
            hipEventRecord(event.0 as hipEvent_t, stream.0 as hipStream_t)
        })
    }

    fn elapsed_ms(&self, device: DeviceId, start: EventHandle, stop: EventHandle) -> Result<f32> {
        self.set_device(device)?;
        let mut ms: f32 = 0.0;
        check("hipEventElapsedTime", unsafe {
            hipEventElapsedTime(&mut ms, start.0 as hipEvent_t, stop.0 as hipEvent_t)
        })?;
        Ok(ms)
    }

    fn device_alloc(&self, device: DeviceId, bytes: usize) -> Result<MemPtr> {
        self.set_device(device)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        check("hipMalloc", unsafe { hipMalloc(&mut ptr, bytes) })?;
        Ok(MemPtr(ptr as usize))
    }

    fn device_free(&self, device: DeviceId, ptr: MemPtr) -> Result<()> {
        self.set_device(device)?;
        check("hipFree", unsafe { hipFree(ptr.0 as *mut c_void) })
    }

    fn host_alloc_pinned(&self, bytes: usize, numa_user: bool) -> Result<MemPtr> {
        let mut flags = hipHostMallocDefault;
        if numa_user {
            flags |= hipHostMallocNumaUser;
        }

        let mut ptr: *mut c_void = ptr::null_mut();
        check("hipHostMalloc", unsafe {
            hipHostMalloc(&mut ptr, bytes, flags)
        })?;
        Ok(MemPtr(ptr as usize))
    }

    fn host_free_pinned(&self, ptr: MemPtr) -> Result<()> {
        check("hipHostFree", unsafe { hipHostFree(ptr.0 as *mut c_void) })
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        let mut can_access: c_int = 0;
        check("hipDeviceCanAccessPeer", unsafe {
            hipDeviceCanAccessPeer(&mut can_access, device as c_int, peer as c_int)
        })?;
        Ok(can_access != 0)
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        self.set_device(device)?;
        let code = unsafe { hipDeviceEnablePeerAccess(peer as c_int, 0) };
        if code == hipErrorPeerAccessAlreadyEnabled {
            debug!("Peer access {} -> {} already enabled", device, peer);
            return Ok(());
        }
        check("hipDeviceEnablePeerAccess", code)
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
        self.set_device(device)?;
        let kind = match kind {
            CopyKind::HostToDevice => hipMemcpyHostToDevice,
            CopyKind::DeviceToHost => hipMemcpyDeviceToHost,
        };
        check(
            "hipMemcpyAsync",
            hipMemcpyAsync(
                dst.0 as *mut c_void,
                src.0 as *const c_void,
                bytes,
                kind,
                stream.0 as hipStream_t,
            ),
        )
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
        self.set_device(dst_device)?;
        check(
            "hipMemcpyPeerAsync",
            hipMemcpyPeerAsync(
                dst.0 as *mut c_void,
                dst_device as c_int,
                src.0 as *const c_void,
                src_device as c_int,
                bytes,
                stream.0 as hipStream_t,
            ),
        )
    }

    fn stream_synchronize(&self, device: DeviceId, stream: StreamHandle) -> Result<()> {
        self.set_device(device)?;
        check("hipStreamSynchronize", unsafe {
            hipStreamSynchronize(stream.0 as hipStream_t)
        })
    }
}
