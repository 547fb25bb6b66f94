use crate::error::{CustomArError, Result};
use crate::types::DeviceId;

/// Size of an encoded IPC handle, matching the fixed-size handles that
/// device runtimes hand out.
pub const IPC_HANDLE_SIZE: usize = 64;

const HANDLE_MAGIC: [u8; 4] = *b"CAIP";

/// Opaque descriptor allowing a peer to map an exported region.
///
/// ```text
/// [0..4]   magic "CAIP"
/// [4..8]   owner device: u32 LE
/// [8..16]  export id: u64 LE
/// [16..24] region length: u64 LE
/// [24..64] reserved (zero)
/// ```
///
/// Callers must treat the bytes as opaque and ship them unmodified.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcHandle([u8; IPC_HANDLE_SIZE]);

impl IpcHandle {
    pub(crate) fn encode(owner: DeviceId, export_id: u64, len: usize) -> Self {
        let mut buf = [0u8; IPC_HANDLE_SIZE];
        buf[0..4].copy_from_slice(&HANDLE_MAGIC);
        buf[4..8].copy_from_slice(&owner.to_le_bytes());
        buf[8..16].copy_from_slice(&export_id.to_le_bytes());
        buf[16..24].copy_from_slice(&(len as u64).to_le_bytes());
        Self(buf)
    }

    /// Rebuild a handle from bytes received from a peer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; IPC_HANDLE_SIZE] = bytes.try_into().map_err(|_| {
            CustomArError::ipc(format!(
                "IPC handle must be {IPC_HANDLE_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        if buf[0..4] != HANDLE_MAGIC {
            return Err(CustomArError::ipc("IPC handle has bad magic"));
        }
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.0
    }

    pub(crate) fn owner(&self) -> DeviceId {
        u32::from_le_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub(crate) fn export_id(&self) -> u64 {
        u64::from_le_bytes(self.0[8..16].try_into().unwrap_or([0; 8]))
    }

    pub(crate) fn len(&self) -> usize {
        u64::from_le_bytes(self.0[16..24].try_into().unwrap_or([0; 8])) as usize
    }
}

impl std::fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHandle")
            .field("owner", &self.owner())
            .field("export_id", &self.export_id())
            .field("len", &self.len())
            .finish()
    }
}
