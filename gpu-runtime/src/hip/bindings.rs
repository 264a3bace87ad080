//! HIP runtime FFI bindings
//!
//! Hand-written for the small subset of `hip_runtime_api.h` the engine uses.
//! Linking against `libamdhip64` is set up by `build.rs`.

#![allow(non_camel_case_types, non_upper_case_globals)]

use std::ffi::{c_char, c_int, c_uint, c_void};

pub type hipError_t = c_int;
pub type hipStream_t = *mut c_void;
pub type hipEvent_t = *mut c_void;
pub type hipMemcpyKind = c_int;

pub const hipSuccess: hipError_t = 0;
pub const hipErrorPeerAccessAlreadyEnabled: hipError_t = 704;

pub const hipMemcpyHostToDevice: hipMemcpyKind = 1;
pub const hipMemcpyDeviceToHost: hipMemcpyKind = 2;

pub const hipStreamNonBlocking: c_uint = 0x01;

pub const hipHostMallocDefault: c_uint = 0x0;
pub const hipHostMallocNumaUser: c_uint = 0x2000_0000;

extern "C" {
    pub fn hipGetErrorString(error: hipError_t) -> *const c_char;

    pub fn hipGetDeviceCount(count: *mut c_int) -> hipError_t;
    pub fn hipSetDevice(device: c_int) -> hipError_t;
    pub fn hipDeviceGetName(name: *mut c_char, len: c_int, device: c_int) -> hipError_t;
    pub fn hipDeviceGetPCIBusId(pci_bus_id: *mut c_char, len: c_int, device: c_int)
        -> hipError_t;
    pub fn hipDeviceTotalMem(bytes: *mut usize, device: c_int) -> hipError_t;

    pub fn hipStreamCreateWithFlags(stream: *mut hipStream_t, flags: c_uint) -> hipError_t;
    pub fn hipStreamDestroy(stream: hipStream_t) -> hipError_t;
    pub fn hipStreamSynchronize(stream: hipStream_t) -> hipError_t;

    pub fn hipEventCreate(event: *mut hipEvent_t) -> hipError_t;
    pub fn hipEventDestroy(event: hipEvent_t) -> hipError_t;
    pub fn hipEventRecord(event: hipEvent_t, stream: hipStream_t) -> hipError_t;
    pub fn hipEventElapsedTime(ms: *mut f32, start: hipEvent_t, stop: hipEvent_t) -> hipError_t;

    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> hipError_t;
    pub fn hipFree(ptr: *mut c_void) -> hipError_t;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: c_uint) -> hipError_t;
    pub fn hipHostFree(ptr: *mut c_void) -> hipError_t;

    pub fn hipDeviceCanAccessPeer(can_access: *mut c_int, device: c_int, peer: c_int)
        -> hipError_t;
    pub fn hipDeviceEnablePeerAccess(peer: c_int, flags: c_uint) -> hipError_t;

    pub fn hipMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
        kind: hipMemcpyKind,
        stream: hipStream_t,
    ) -> hipError_t;
    pub fn hipMemcpyPeerAsync(
        dst: *mut c_void,
        dst_device: c_int,
        src: *const c_void,
        src_device: c_int,
        size: usize,
        stream: hipStream_t,
    ) -> hipError_t;
}
