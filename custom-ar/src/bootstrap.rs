//! In-process group formation: one communicator per simulated device.

use std::sync::Arc;

use crate::comm::CustomAllreduce;
use crate::config::CustomArConfig;
use crate::error::{CustomArError, Result};
use crate::ipc::{IpcHandle, IpcTransport, LocalIpc};
use crate::memory::DeviceMemory;
use crate::rank_data::meta_size;
use crate::stream::Stream;
use crate::topology::PeerTopology;
use crate::types::{DataType, DeviceId};

/// `world_size` ranks in one process, rank `r` on device `r`.
///
/// Does the collective plumbing a real deployment does over its process
/// group: allocating Rank Data, all-gathering descriptors and graph
/// metadata, and running every rank's half of each call.
pub struct LocalGroup {
    // Field order is drop order: communicators, then streams (which drain
    // their queues), then the memory the queued work may touch.
    comms: Vec<CustomAllreduce>,
    streams: Vec<Stream>,
    rank_data: Vec<DeviceMemory>,
    rank_data_exports: Vec<IpcHandle>,
    ipc: LocalIpc,
}

impl LocalGroup {
    pub fn new(world_size: usize, full_nvlink: bool, config: CustomArConfig) -> Result<Self> {
        Self::with_ipc(LocalIpc::new(), world_size, full_nvlink, config)
    }

    /// Group whose `full_nvlink` flag is derived from a probed topology.
    ///
    /// Without full connectivity the ranks must at least form a ring
    /// `0 -> 1 -> .. -> n-1 -> 0`, which the ring strategy walks.
    pub fn from_topology(topology: &PeerTopology, config: CustomArConfig) -> Result<Self> {
        let full_nvlink = topology.is_fully_connected();
        if !full_nvlink {
            if !topology.has_ring() {
                return Err(CustomArError::initialization(format!(
                    "{} devices are neither fully connected nor linked in a ring",
                    topology.world_size()
                )));
            }
            tracing::debug!(
                world_size = topology.world_size(),
                "partial topology, using the ring path"
            );
        }
        Self::new(topology.world_size(), full_nvlink, config)
    }

    /// Group over an existing IPC table, e.g. one with denied device pairs.
    pub fn with_ipc(
        ipc: LocalIpc,
        world_size: usize,
        full_nvlink: bool,
        config: CustomArConfig,
    ) -> Result<Self> {
        let rank_data = (0..world_size)
            .map(|d| DeviceMemory::alloc(d as DeviceId, meta_size(world_size)))
            .collect::<Result<Vec<_>>>()?;
        let rank_data_exports = rank_data
            .iter()
            .enumerate()
            .map(|(d, mem)| ipc.device(d as DeviceId).export(mem.as_buffer()))
            .collect::<Result<Vec<_>>>()?;

        let mut comms = Vec::with_capacity(world_size);
        for (rank, mem) in rank_data.iter().enumerate() {
            let transport: Arc<dyn IpcTransport> = Arc::new(ipc.device(rank as DeviceId));
            // Rank Data lives in `self.rank_data`, which outlives `comms`.
            let comm = unsafe {
                CustomAllreduce::init_custom_ar(
                    transport,
                    &rank_data_exports,
                    mem.as_buffer(),
                    rank as u32,
                    full_nvlink,
                    config.clone(),
                )?
            };
            comms.push(comm);
        }
        let streams = (0..world_size)
            .map(|d| Stream::new(d as DeviceId))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(world_size, full_nvlink, "local group formed");
        Ok(Self {
            comms,
            streams,
            rank_data,
            rank_data_exports,
            ipc,
        })
    }

    pub fn world_size(&self) -> usize {
        self.comms.len()
    }

    pub fn ipc(&self) -> &LocalIpc {
        &self.ipc
    }

    pub fn comm(&self, rank: usize) -> &CustomAllreduce {
        &self.comms[rank]
    }

    pub fn comms(&self) -> &[CustomAllreduce] {
        &self.comms
    }

    pub fn stream(&self, rank: usize) -> &Stream {
        &self.streams[rank]
    }

    /// One zeroed allocation of `bytes` per rank, each on its rank's device.
    pub fn alloc(&self, bytes: usize) -> Result<Vec<DeviceMemory>> {
        (0..self.world_size())
            .map(|d| DeviceMemory::alloc(d as DeviceId, bytes))
            .collect()
    }

    /// Export `buffers[r]` on every rank and register the set everywhere.
    pub fn register(&self, buffers: &[DeviceMemory]) -> Result<()> {
        self.check_per_rank(buffers.len())?;
        let handles = buffers
            .iter()
            .enumerate()
            .map(|(d, mem)| self.ipc.device(d as DeviceId).export(mem.as_buffer()))
            .collect::<Result<Vec<_>>>()?;
        for (comm, mem) in self.comms.iter().zip(buffers) {
            comm.register_buffer(mem.as_buffer(), &handles)?;
        }
        Ok(())
    }

    /// Allocate and register a scratch buffer of `bytes` on every rank.
    pub fn register_scratch(&self, bytes: usize) -> Result<Vec<DeviceMemory>> {
        let scratch = self.alloc(bytes)?;
        self.register(&scratch)?;
        Ok(scratch)
    }

    /// All-gather every rank's graph metadata and register it everywhere.
    pub fn share_graph_buffers(&self) -> Result<()> {
        let metas = self
            .comms
            .iter()
            .map(|c| c.get_graph_buffer_ipc_meta())
            .collect::<Result<Vec<_>>>()?;
        for comm in &self.comms {
            comm.register_graph_buffers(&metas)?;
        }
        Ok(())
    }

    /// Launch the same all-reduce on every rank's stream.
    ///
    /// Every rank is checked before any is launched, so a failure on one
    /// rank never leaves the others parked at a barrier.
    ///
    /// # Safety
    /// Every buffer must outlive the launched work; synchronize before
    /// dropping or reading them.
    pub unsafe fn all_reduce(
        &self,
        inputs: &[DeviceMemory],
        outputs: &[DeviceMemory],
        count: usize,
        dtype: DataType,
        scratch: Option<&[DeviceMemory]>,
    ) -> Result<()> {
        self.check_per_rank(inputs.len())?;
        self.check_per_rank(outputs.len())?;
        if let Some(s) = scratch {
            self.check_per_rank(s.len())?;
        }
        let mut prepared = Vec::with_capacity(self.comms.len());
        for (rank, comm) in self.comms.iter().enumerate() {
            let plan = unsafe {
                comm.prepare_all_reduce(
                    &self.streams[rank],
                    inputs[rank].as_buffer(),
                    outputs[rank].as_buffer(),
                    count,
                    dtype,
                    scratch.map(|s| s[rank].as_buffer()),
                )?
            };
            prepared.push(plan);
        }
        for (rank, plan) in prepared.into_iter().enumerate() {
            if let Some(plan) = plan {
                self.comms[rank].launch(&self.streams[rank], plan)?;
            }
        }
        Ok(())
    }

    /// Wait for every rank's stream. Returns the first fault after all
    /// streams have drained.
    pub async fn synchronize(&self) -> Result<()> {
        let mut first_err = None;
        for stream in &self.streams {
            if let Err(e) = stream.synchronize().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Revoke `rank`'s Rank Data export, as its process dying would.
    pub fn simulate_peer_loss(&self, rank: usize) -> Result<()> {
        let handle = self.rank_data_exports.get(rank).ok_or_else(|| {
            CustomArError::InvalidArgument(format!("no rank {rank} in this group"))
        })?;
        tracing::debug!(rank, "simulating peer loss");
        self.ipc.device(rank as DeviceId).revoke(handle)
    }

    /// Dispose every rank's communicator. Returns the first failure.
    pub fn dispose(&self) -> Result<()> {
        let mut first_err = None;
        for comm in &self.comms {
            if let Err(e) = comm.dispose() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Peer mappings open across all devices of the group.
    pub fn open_mappings(&self) -> usize {
        (0..self.world_size())
            .map(|d| self.ipc.device(d as DeviceId).open_mappings())
            .sum()
    }

    /// Bytes of Rank Data allocated per rank.
    pub fn rank_data_len(&self) -> usize {
        self.rank_data.first().map_or(0, DeviceMemory::len)
    }

    fn check_per_rank(&self, n: usize) -> Result<()> {
        if n != self.world_size() {
            return Err(CustomArError::InvalidArgument(format!(
                "expected one buffer per rank ({}), got {n}",
                self.world_size()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("world_size", &self.world_size())
            .finish_non_exhaustive()
    }
}
