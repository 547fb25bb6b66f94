//! Export/import of device memory regions between ranks sharing a host.
//!
//! A rank exports a region to obtain an [`IpcHandle`], ships the handle's
//! bytes to its peers by whatever means it likes, and each peer opens the
//! handle to obtain a [`PeerMapping`] it can read and write directly.

mod handle;
mod local;

pub use handle::{IPC_HANDLE_SIZE, IpcHandle};
pub use local::{DeviceIpc, LocalIpc};

use crate::error::Result;
use crate::memory::{BufferRef, Device};
use crate::types::DeviceId;

/// A peer's region mapped into the local address space.
///
/// Not `Clone`: every mapping is closed exactly once through
/// [`IpcTransport::close`].
#[derive(Debug, PartialEq, Eq)]
pub struct PeerMapping {
    export_id: u64,
    owner: DeviceId,
    ptr: u64,
    len: usize,
}

impl PeerMapping {
    pub(crate) fn new(export_id: u64, owner: DeviceId, ptr: u64, len: usize) -> Self {
        Self {
            export_id,
            owner,
            ptr,
            len,
        }
    }

    pub fn export_id(&self) -> u64 {
        self.export_id
    }

    /// Device that owns the underlying memory.
    pub fn owner(&self) -> DeviceId {
        self.owner
    }

    /// Locally usable base address of the mapped region.
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Platform primitive for cross-device shared memory.
///
/// Implementations are per device: `open` maps a peer's export into the
/// address space of the device the transport belongs to.
pub trait IpcTransport: Send + Sync {
    /// Device this transport maps into.
    fn device(&self) -> DeviceId;

    /// Export a local region so peers can map it.
    fn export(&self, region: BufferRef<Device>) -> Result<IpcHandle>;

    /// Withdraw an export made by this device. Existing mappings of it stop
    /// being alive; new opens fail.
    fn revoke(&self, handle: &IpcHandle) -> Result<()>;

    /// Map a peer's exported region.
    fn open(&self, handle: &IpcHandle) -> Result<PeerMapping>;

    /// Unmap a region previously returned by `open`.
    fn close(&self, mapping: PeerMapping) -> Result<()>;

    /// Whether the exporter behind a mapping is still reachable.
    fn is_alive(&self, mapping: &PeerMapping) -> bool;

    /// Number of mappings currently open on this device.
    fn open_mappings(&self) -> usize;
}
