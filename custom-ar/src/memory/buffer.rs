//! Typed pointer wrappers tagging the memory space an address lives in.
//!
//! Registration and reduction work on raw `u64` addresses, the same way the
//! kernels see them. Wrapping them keeps a bare integer from being passed
//! where a device buffer is expected.

use std::marker::PhantomData;

mod private {
    pub trait Sealed {}
}

/// Marker trait for memory spaces.
pub trait MemorySpace: private::Sealed {}

/// Device memory, possibly mapped from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {}
impl private::Sealed for Device {}
impl MemorySpace for Device {}

/// An address in memory space `S`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferPtr<S: MemorySpace> {
    ptr: u64,
    _space: PhantomData<S>,
}

impl<S: MemorySpace> BufferPtr<S> {
    /// # Safety
    /// The address must actually point into memory of space `S`.
    pub unsafe fn new(ptr: u64) -> Self {
        Self {
            ptr,
            _space: PhantomData,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }
}

impl<S: MemorySpace> std::fmt::Display for BufferPtr<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.ptr)
    }
}

/// A base address plus byte length in memory space `S`.
///
/// This is the "(base pointer, byte length)" description of a registered
/// buffer; ownership of the memory stays with whoever allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef<S: MemorySpace> {
    ptr: BufferPtr<S>,
    len_bytes: usize,
}

impl<S: MemorySpace> BufferRef<S> {
    /// # Safety
    /// `ptr` must point to at least `len_bytes` of valid memory in space `S`
    /// for as long as the reference is used.
    pub unsafe fn new(ptr: u64, len_bytes: usize) -> Self {
        Self {
            ptr: unsafe { BufferPtr::new(ptr) },
            len_bytes,
        }
    }

    pub fn ptr(&self) -> &BufferPtr<S> {
        &self.ptr
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.ptr.as_u64()
    }
}

impl<S: MemorySpace> std::fmt::Display for BufferRef<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferRef({}, {}B)", self.ptr, self.len_bytes)
    }
}
