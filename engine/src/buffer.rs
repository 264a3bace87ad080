//! Channel-owned resources

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use hits_gpu::{DeviceId, EventHandle, GpuRuntime, MemPtr, StreamHandle};
use tracing::debug;

use crate::error::{ChannelContext, EngineError, MemoryKind};

const PAGE_SIZE: usize = 4096;

/// Plain heap memory, page aligned and pre-faulted
#[derive(Debug)]
pub struct PageableBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation, like a Box<[u8]>.
unsafe impl Send for PageableBuffer {}

impl PageableBuffer {
    /// Allocate `len` bytes, `None` when the allocator has no memory for it.
    ///
    /// Every page is written once so that placement follows the memory policy
    /// in force now, not the one in force at the first copy.
    pub fn new(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE).ok()?;
        // SAFETY: layout has a non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        // SAFETY: ptr is valid for `len` bytes of writes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };

        Some(Self { ptr, layout })
    }

    pub fn addr(&self) -> MemPtr {
        MemPtr(self.ptr.as_ptr() as usize)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PageableBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// One side of a transfer
#[derive(Debug)]
pub enum Buffer {
    Device { device: DeviceId, ptr: MemPtr },
    PinnedHost { ptr: MemPtr },
    PageableHost(PageableBuffer),
}

impl Buffer {
    pub fn addr(&self) -> MemPtr {
        match self {
            Buffer::Device { ptr, .. } | Buffer::PinnedHost { ptr } => *ptr,
            Buffer::PageableHost(buf) => buf.addr(),
        }
    }

    pub fn kind(&self) -> MemoryKind {
        match self {
            Buffer::Device { .. } => MemoryKind::Device,
            Buffer::PinnedHost { .. } => MemoryKind::PinnedHost,
            Buffer::PageableHost(_) => MemoryKind::PageableHost,
        }
    }

    pub fn is_host(&self) -> bool {
        !matches!(self, Buffer::Device { .. })
    }

    fn release(
        self,
        runtime: &dyn GpuRuntime,
        channel: usize,
        owner: DeviceId,
    ) -> Result<(), EngineError> {
        match self {
            Buffer::Device { device, ptr } => {
                runtime.device_free(device, ptr).on_channel(channel, device)
            }
            Buffer::PinnedHost { ptr } => runtime.host_free_pinned(ptr).on_channel(channel, owner),
            Buffer::PageableHost(buf) => {
                drop(buf);
                Ok(())
            }
        }
    }
}

/// Everything a ready channel owns on the runtime side
#[derive(Debug)]
pub struct ChannelResources {
    pub device: DeviceId,
    pub stream: StreamHandle,
    pub start_mark: EventHandle,
    pub stop_mark: EventHandle,
    pub source: Buffer,
    pub destination: Buffer,
}

impl ChannelResources {
    /// Release buffers, events and the stream, host buffers first
    pub fn release(self, runtime: &dyn GpuRuntime, channel: usize) -> Result<(), EngineError> {
        PendingResources::from(self).release(runtime, channel)
    }
}

/// Resources of a channel under construction.
///
/// Fields are filled as acquisitions succeed; a failed allocation releases
/// whatever was acquired so far.
#[derive(Debug)]
pub(crate) struct PendingResources {
    pub device: DeviceId,
    pub stream: Option<StreamHandle>,
    pub start_mark: Option<EventHandle>,
    pub stop_mark: Option<EventHandle>,
    pub source: Option<Buffer>,
    pub destination: Option<Buffer>,
}

impl PendingResources {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            stream: None,
            start_mark: None,
            stop_mark: None,
            source: None,
            destination: None,
        }
    }

    /// Complete resources, or the pending set back if anything is missing
    pub fn finish(self) -> Result<ChannelResources, Self> {
        match self {
            PendingResources {
                device,
                stream: Some(stream),
                start_mark: Some(start_mark),
                stop_mark: Some(stop_mark),
                source: Some(source),
                destination: Some(destination),
            } => Ok(ChannelResources {
                device,
                stream,
                start_mark,
                stop_mark,
                source,
                destination,
            }),
            incomplete => Err(incomplete),
        }
    }

    /// Release in reverse dependency order. Keeps going after a failure and
    /// returns the first one.
    pub fn release(self, runtime: &dyn GpuRuntime, channel: usize) -> Result<(), EngineError> {
        let mut first_error = None;
        let mut note = |result: Result<(), EngineError>| {
            if let Err(e) = result {
                debug!("Release failed for transfer {}: {}", channel, e);
                first_error.get_or_insert(e);
            }
        };

        let (host, device_side): (Vec<Buffer>, Vec<Buffer>) = [self.source, self.destination]
            .into_iter()
            .flatten()
            .partition(Buffer::is_host);
        for buffer in host.into_iter().chain(device_side) {
            note(buffer.release(runtime, channel, self.device));
        }

        for event in [self.start_mark, self.stop_mark].into_iter().flatten() {
            note(
                runtime
                    .destroy_event(self.device, event)
                    .on_channel(channel, self.device),
            );
        }

        if let Some(stream) = self.stream {
            note(
                runtime
                    .destroy_stream(self.device, stream)
                    .on_channel(channel, self.device),
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl From<ChannelResources> for PendingResources {
    fn from(resources: ChannelResources) -> Self {
        Self {
            device: resources.device,
            stream: Some(resources.stream),
            start_mark: Some(resources.start_mark),
            stop_mark: Some(resources.stop_mark),
            source: Some(resources.source),
            destination: Some(resources.destination),
        }
    }
}
