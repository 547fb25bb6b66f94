use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CustomArError, Result};
use crate::ipc::{IpcHandle, IpcTransport, PeerMapping};
use crate::memory::{BufferRef, Device};
use crate::types::DeviceId;

#[derive(Debug)]
struct Export {
    owner: DeviceId,
    ptr: u64,
    len: usize,
    alive: bool,
    /// Open mappings of this export across all devices. A revoked export
    /// is dropped from the table once this reaches zero.
    mappings: usize,
}

#[derive(Default)]
struct Shared {
    exports: Mutex<HashMap<u64, Export>>,
    next_id: AtomicU64,
    denied: Mutex<HashSet<(DeviceId, DeviceId)>>,
    open: Mutex<HashMap<DeviceId, usize>>,
}

/// In-host IPC table shared by every device of a process group.
///
/// All devices live in one address space, so opening a handle yields the
/// exporter's own address. The table still enforces everything the real
/// primitive does: handles must name a live export, the two devices must be
/// allowed to access each other, and every open is counted until closed.
#[derive(Clone, Default)]
pub struct LocalIpc {
    shared: Arc<Shared>,
}

impl LocalIpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport view for one device.
    pub fn device(&self, device: DeviceId) -> DeviceIpc {
        DeviceIpc {
            ipc: self.clone(),
            device,
        }
    }

    /// Exports still held in the table, revoked ones with open mappings
    /// included.
    pub fn live_exports(&self) -> usize {
        self.shared
            .exports
            .lock()
            .map(|exports| exports.len())
            .unwrap_or(0)
    }

    /// Forbid mappings between two devices, in both directions.
    pub fn deny_peer_access(&self, a: DeviceId, b: DeviceId) -> Result<()> {
        let mut denied = self
            .shared
            .denied
            .lock()
            .map_err(|_| CustomArError::LockPoisoned("ipc peer access"))?;
        denied.insert((a.min(b), a.max(b)));
        Ok(())
    }

    fn can_access(&self, a: DeviceId, b: DeviceId) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        let denied = self
            .shared
            .denied
            .lock()
            .map_err(|_| CustomArError::LockPoisoned("ipc peer access"))?;
        Ok(!denied.contains(&(a.min(b), a.max(b))))
    }
}

impl std::fmt::Debug for LocalIpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIpc").finish_non_exhaustive()
    }
}

/// [`LocalIpc`] bound to one device.
#[derive(Clone, Debug)]
pub struct DeviceIpc {
    ipc: LocalIpc,
    device: DeviceId,
}

impl DeviceIpc {
    fn exports(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, Export>>> {
        self.ipc
            .shared
            .exports
            .lock()
            .map_err(|_| CustomArError::LockPoisoned("ipc exports"))
    }

    fn open_counts(&self) -> Result<std::sync::MutexGuard<'_, HashMap<DeviceId, usize>>> {
        self.ipc
            .shared
            .open
            .lock()
            .map_err(|_| CustomArError::LockPoisoned("ipc mapping counts"))
    }
}

impl IpcTransport for DeviceIpc {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn export(&self, region: BufferRef<Device>) -> Result<IpcHandle> {
        if region.ptr().is_null() {
            return Err(CustomArError::ipc("cannot export a null region"));
        }
        let id = self.ipc.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.exports()?.insert(
            id,
            Export {
                owner: self.device,
                ptr: region.as_u64(),
                len: region.len_bytes(),
                alive: true,
                mappings: 0,
            },
        );
        Ok(IpcHandle::encode(self.device, id, region.len_bytes()))
    }

    fn revoke(&self, handle: &IpcHandle) -> Result<()> {
        let mut exports = self.exports()?;
        let export = exports
            .get_mut(&handle.export_id())
            .ok_or_else(|| CustomArError::ipc(format!("unknown export {}", handle.export_id())))?;
        if export.owner != self.device {
            return Err(CustomArError::ipc(format!(
                "device {} cannot revoke export {} owned by device {}",
                self.device,
                handle.export_id(),
                export.owner
            )));
        }
        if export.mappings == 0 {
            exports.remove(&handle.export_id());
        } else {
            export.alive = false;
        }
        Ok(())
    }

    fn open(&self, handle: &IpcHandle) -> Result<PeerMapping> {
        let owner = handle.owner();
        if !self.ipc.can_access(self.device, owner)? {
            return Err(CustomArError::ipc(format!(
                "device {} cannot peer-access device {owner}",
                self.device
            )));
        }

        let (ptr, len) = {
            let mut exports = self.exports()?;
            let export = exports.get_mut(&handle.export_id()).ok_or_else(|| {
                CustomArError::ipc(format!("unknown export {}", handle.export_id()))
            })?;
            if !export.alive {
                return Err(CustomArError::ipc(format!(
                    "export {} of device {owner} was revoked",
                    handle.export_id()
                )));
            }
            if export.owner != owner || export.len != handle.len() {
                return Err(CustomArError::ipc(format!(
                    "handle does not match export {}",
                    handle.export_id()
                )));
            }
            export.mappings += 1;
            (export.ptr, export.len)
        };

        *self.open_counts()?.entry(self.device).or_insert(0) += 1;
        Ok(PeerMapping::new(handle.export_id(), owner, ptr, len))
    }

    fn close(&self, mapping: PeerMapping) -> Result<()> {
        let mut counts = self.open_counts()?;
        let count = counts.entry(self.device).or_insert(0);
        if *count == 0 {
            return Err(CustomArError::ipc(format!(
                "device {} closed export {} with no open mappings",
                self.device,
                mapping.export_id()
            )));
        }
        *count -= 1;
        drop(counts);

        let mut exports = self.exports()?;
        if let Some(export) = exports.get_mut(&mapping.export_id()) {
            export.mappings = export.mappings.saturating_sub(1);
            if !export.alive && export.mappings == 0 {
                exports.remove(&mapping.export_id());
            }
        }
        Ok(())
    }

    fn is_alive(&self, mapping: &PeerMapping) -> bool {
        self.exports()
            .map(|exports| {
                exports
                    .get(&mapping.export_id())
                    .is_some_and(|e| e.alive)
            })
            .unwrap_or(false)
    }

    fn open_mappings(&self) -> usize {
        self.open_counts()
            .map(|counts| counts.get(&self.device).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}
