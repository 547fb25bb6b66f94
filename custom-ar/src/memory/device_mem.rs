use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::error::{CustomArError, Result};
use crate::memory::{BufferRef, Device};
use crate::types::{DeviceId, Element};

/// Alignment of every device allocation. Covers the 64-byte flag lines of
/// Rank Data and any element type.
pub const DEVICE_ALIGN: usize = 256;

/// An owned, zero-initialised device allocation.
///
/// Backed by host memory so that every "device" of an in-process group can
/// address it directly, which is what a peer mapping provides on real
/// hardware. Reads and writes through `copy_*` must not race with kernels on
/// a stream; synchronize the stream first.
pub struct DeviceMemory {
    device: DeviceId,
    ptr: NonNull<u8>,
    len: usize,
}

// The allocation is plain memory; cross-thread access is ordered by the
// stream and barrier protocol.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl DeviceMemory {
    /// Allocate `len` zeroed bytes on `device`.
    pub fn alloc(device: DeviceId, len: usize) -> Result<Self> {
        let layout = Self::layout(len)?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            CustomArError::InvalidArgument(format!(
                "device {device}: allocation of {len} bytes failed"
            ))
        })?;
        Ok(Self { device, ptr, len })
    }

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len.max(1), DEVICE_ALIGN)
            .map_err(|e| CustomArError::InvalidArgument(format!("bad allocation size {len}: {e}")))
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Device-space view of the whole allocation.
    pub fn as_buffer(&self) -> BufferRef<Device> {
        unsafe { BufferRef::new(self.as_u64(), self.len) }
    }

    /// Copy `src` to the start of the allocation.
    pub fn copy_from_host<T: Element>(&mut self, src: &[T]) -> Result<()> {
        let bytes = std::mem::size_of_val(src);
        if bytes > self.len {
            return Err(CustomArError::InvalidArgument(format!(
                "copy of {bytes} bytes into {} byte allocation",
                self.len
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr() as *const u8, self.ptr.as_ptr(), bytes);
        }
        Ok(())
    }

    /// Read the first `count` elements back to the host.
    pub fn copy_to_host<T: Element>(&self, count: usize) -> Result<Vec<T>> {
        let bytes = count * std::mem::size_of::<T>();
        if bytes > self.len {
            return Err(CustomArError::InvalidArgument(format!(
                "read of {bytes} bytes from {} byte allocation",
                self.len
            )));
        }
        let mut out = Vec::<T>::with_capacity(count);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr() as *mut u8, bytes);
            out.set_len(count);
        }
        Ok(out)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.len) {
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("device", &self.device)
            .field("ptr", &format_args!("0x{:x}", self.as_u64()))
            .field("len", &self.len)
            .finish()
    }
}
