//! Graph buffer IPC metadata: the blob one rank hands its peers after a
//! capture so they can map the buffers the capture references.
//!
//! Wire format (all integers little-endian):
//!
//! ```text
//! magic "CAGM" (4) | version u16 | rank u32 | world u32 | epoch u64 | count u32
//! count x ( buffer len u64 | IPC handle (64) )
//! ```
//!
//! Entries are in capture order, which is identical on every rank because
//! every rank captures the same sequence of all-reduce calls.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CustomArError, Result};
use crate::ipc::{IPC_HANDLE_SIZE, IpcHandle};
use crate::types::Rank;

const META_MAGIC: [u8; 4] = *b"CAGM";
const META_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 4 + 8 + 4;
const ENTRY_LEN: usize = 8 + IPC_HANDLE_SIZE;

/// One exported graph buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphBufferEntry {
    pub len: usize,
    pub handle: IpcHandle,
}

/// Decoded graph buffer metadata of one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphBufferMeta {
    pub rank: Rank,
    pub world_size: u32,
    /// Capture epoch the metadata belongs to. Starts at 1.
    pub epoch: u64,
    pub entries: Vec<GraphBufferEntry>,
}

impl GraphBufferMeta {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.entries.len() * ENTRY_LEN);
        buf.put_slice(&META_MAGIC);
        buf.put_u16_le(META_VERSION);
        buf.put_u32_le(self.rank);
        buf.put_u32_le(self.world_size);
        buf.put_u64_le(self.epoch);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u64_le(entry.len as u64);
            buf.put_slice(entry.handle.as_bytes());
        }
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < HEADER_LEN {
            return Err(CustomArError::MetadataDecode(format!(
                "{} bytes is shorter than the {HEADER_LEN} byte header",
                data.remaining()
            )));
        }
        let mut magic = [0u8; 4];
        data.copy_to_slice(&mut magic);
        if magic != META_MAGIC {
            return Err(CustomArError::MetadataDecode("bad magic".into()));
        }
        let version = data.get_u16_le();
        if version != META_VERSION {
            return Err(CustomArError::MetadataDecode(format!(
                "unsupported version {version}"
            )));
        }
        let rank = data.get_u32_le();
        let world_size = data.get_u32_le();
        let epoch = data.get_u64_le();
        let count = data.get_u32_le() as usize;

        if data.remaining() != count * ENTRY_LEN {
            return Err(CustomArError::MetadataDecode(format!(
                "{count} entries need {} bytes, got {}",
                count * ENTRY_LEN,
                data.remaining()
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let len = data.get_u64_le() as usize;
            let handle = IpcHandle::from_bytes(&data[..IPC_HANDLE_SIZE])?;
            data.advance(IPC_HANDLE_SIZE);
            entries.push(GraphBufferEntry { len, handle });
        }

        Ok(Self {
            rank,
            world_size,
            epoch,
            entries,
        })
    }
}
