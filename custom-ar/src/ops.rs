//! Flat, handle-based operation surface.
//!
//! Callers that cannot hold a [`CustomAllreduce`] directly (an operator
//! dispatch layer passing integers around) go through [`CustomArOps`], which
//! keeps every live communicator behind an opaque [`CommHandle`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::comm::CustomAllreduce;
use crate::config::CustomArConfig;
use crate::error::{CustomArError, Result};
use crate::ipc::{IpcHandle, IpcTransport};
use crate::memory::{BufferRef, Device};
use crate::stream::Stream;
use crate::types::{DataType, Rank};

/// Opaque communicator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommHandle(u64);

impl CommHandle {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for CommHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "comm#{}", self.0)
    }
}

/// Table of live communicators.
pub struct CustomArOps {
    config: CustomArConfig,
    comms: RwLock<HashMap<u64, Arc<CustomAllreduce>>>,
}

impl CustomArOps {
    pub fn new(config: CustomArConfig) -> Self {
        Self {
            config,
            comms: RwLock::new(HashMap::new()),
        }
    }

    /// Bytes of Rank Data each rank must allocate for `world_size` ranks.
    pub fn meta_size(world_size: usize) -> usize {
        crate::rank_data::meta_size(world_size)
    }

    /// See [`CustomAllreduce::init_custom_ar`].
    ///
    /// # Safety
    /// Same contract as [`CustomAllreduce::init_custom_ar`].
    pub unsafe fn init_custom_ar(
        &self,
        transport: Arc<dyn IpcTransport>,
        descriptors: &[IpcHandle],
        rank_data: BufferRef<Device>,
        rank: Rank,
        full_nvlink: bool,
    ) -> Result<CommHandle> {
        let comm = unsafe {
            CustomAllreduce::init_custom_ar(
                transport,
                descriptors,
                rank_data,
                rank,
                full_nvlink,
                self.config.clone(),
            )?
        };
        let id = comm.id();
        self.comms
            .write()
            .map_err(|_| CustomArError::LockPoisoned("communicator table"))?
            .insert(id, Arc::new(comm));
        Ok(CommHandle(id))
    }

    /// Live communicator behind `handle`.
    pub fn get(&self, handle: CommHandle) -> Result<Arc<CustomAllreduce>> {
        self.comms
            .read()
            .map_err(|_| CustomArError::LockPoisoned("communicator table"))?
            .get(&handle.0)
            .cloned()
            .ok_or(CustomArError::UseAfterDispose { handle: handle.0 })
    }

    pub fn register_buffer(
        &self,
        handle: CommHandle,
        buffer: BufferRef<Device>,
        descriptors: &[IpcHandle],
    ) -> Result<()> {
        self.get(handle)?.register_buffer(buffer, descriptors)
    }

    pub fn get_graph_buffer_ipc_meta(&self, handle: CommHandle) -> Result<Bytes> {
        self.get(handle)?.get_graph_buffer_ipc_meta()
    }

    pub fn register_graph_buffers<B: AsRef<[u8]>>(
        &self,
        handle: CommHandle,
        metas: &[B],
    ) -> Result<()> {
        self.get(handle)?.register_graph_buffers(metas)
    }

    /// See [`CustomAllreduce::all_reduce`].
    ///
    /// # Safety
    /// Same contract as [`CustomAllreduce::all_reduce`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn all_reduce(
        &self,
        handle: CommHandle,
        stream: &Stream,
        input: BufferRef<Device>,
        output: BufferRef<Device>,
        count: usize,
        dtype: DataType,
        scratch: Option<BufferRef<Device>>,
    ) -> Result<()> {
        let comm = self.get(handle)?;
        unsafe { comm.all_reduce(stream, input, output, count, dtype, scratch) }
    }

    /// Dispose the communicator and forget the handle. A second dispose of
    /// the same handle fails with `UseAfterDispose`.
    pub fn dispose(&self, handle: CommHandle) -> Result<()> {
        let comm = self
            .comms
            .write()
            .map_err(|_| CustomArError::LockPoisoned("communicator table"))?
            .remove(&handle.0)
            .ok_or(CustomArError::UseAfterDispose { handle: handle.0 })?;
        comm.dispose()
    }

    /// Number of live communicators.
    pub fn len(&self) -> usize {
        self.comms.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CustomArOps {
    fn default() -> Self {
        Self::new(CustomArConfig::from_env())
    }
}
