use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::barrier::{BarrierStats, FlagBarrier, PhaseBarrier};
use crate::collective::Strategy;
use crate::collective::dispatch::{Plan, Staging};
use crate::config::CustomArConfig;
use crate::error::{CustomArError, Result};
use crate::graph::{GraphBufferEntry, GraphBufferMeta};
use crate::ipc::{IpcHandle, IpcTransport, PeerMapping};
use crate::memory::{BufferRef, Device};
use crate::peers::PeerHandles;
use crate::rank_data::{MAX_RANKS, RANK_DATA_ALIGN, RankData, meta_size};
use crate::registry::{BufferTable, PendingBuffer, RegisteredBuffer};
use crate::stream::Stream;
use crate::types::{DataType, Rank};

static NEXT_COMM_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable host-side state, guarded so a communicator can be shared.
struct State {
    peers: PeerHandles,
    table: BufferTable,
    /// Epoch of the last `get_graph_buffer_ipc_meta`.
    exported_epoch: u64,
    /// Epoch of the last successful `register_graph_buffers`.
    registered_epoch: u64,
}

/// One rank's handle on a custom all-reduce group.
///
/// Topology (`full_nvlink`) and world size are fixed at creation, so the
/// strategy for a given payload never changes over the communicator's life.
pub struct CustomAllreduce {
    id: u64,
    rank: usize,
    world_size: usize,
    full_nvlink: bool,
    config: CustomArConfig,
    transport: Arc<dyn IpcTransport>,
    rank_data: RankData,
    barrier: Arc<FlagBarrier>,
    stats: Arc<BarrierStats>,
    /// Shared with every launched plan, so captured kernels stop running
    /// once the mappings they read are gone.
    disposed: Arc<AtomicBool>,
    state: Mutex<State>,
}

/// An all-reduce that passed every host-side check and only needs to be
/// enqueued. Produced by [`CustomAllreduce::prepare_all_reduce`].
pub(crate) struct PreparedAllReduce {
    plan: Plan,
    bytes: usize,
}

impl CustomAllreduce {
    /// Map every peer's Rank Data and create the communicator.
    ///
    /// `descriptors[i]` is rank `i`'s exported Rank Data region; this rank's
    /// own entry is not opened. Every rank must finish `init_custom_ar`
    /// before any rank launches an all-reduce.
    ///
    /// # Safety
    /// `rank_data` must be device memory of the transport's device, valid for
    /// its whole length until the communicator is disposed or dropped.
    pub unsafe fn init_custom_ar(
        transport: Arc<dyn IpcTransport>,
        descriptors: &[IpcHandle],
        rank_data: BufferRef<Device>,
        rank: Rank,
        full_nvlink: bool,
        config: CustomArConfig,
    ) -> Result<Self> {
        let world_size = descriptors.len();
        let rank = rank as usize;
        if world_size == 0 || world_size > MAX_RANKS {
            return Err(CustomArError::initialization(format!(
                "world size {world_size} outside 1..={MAX_RANKS}"
            )));
        }
        if rank >= world_size {
            return Err(CustomArError::initialization(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        let required = meta_size(world_size);
        if rank_data.len_bytes() < required {
            return Err(CustomArError::initialization(format!(
                "rank data is {} bytes, meta_size({world_size}) is {required}",
                rank_data.len_bytes()
            )));
        }
        if rank_data.as_u64() % RANK_DATA_ALIGN as u64 != 0 {
            return Err(CustomArError::initialization(format!(
                "rank data at {} is not {RANK_DATA_ALIGN}-byte aligned",
                rank_data.ptr()
            )));
        }

        let own = unsafe { RankData::new(rank_data.as_u64(), world_size) };
        own.reset();
        let peers = PeerHandles::open(transport.as_ref(), descriptors, rank, own)?;

        let stats = BarrierStats::new();
        let barrier = Arc::new(FlagBarrier::new(
            rank,
            peers.views().to_vec(),
            config.spin_before_yield,
            Arc::clone(&stats),
        ));
        let id = NEXT_COMM_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            id,
            rank,
            world_size,
            full_nvlink,
            device = transport.device(),
            "custom allreduce initialized"
        );

        Ok(Self {
            id,
            rank,
            world_size,
            full_nvlink,
            config,
            transport,
            rank_data: own,
            barrier,
            stats,
            disposed: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(State {
                peers,
                table: BufferTable::new(),
                exported_epoch: 0,
                registered_epoch: 0,
            }),
        })
    }

    /// Opaque process-wide identifier of this communicator.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn rank(&self) -> Rank {
        self.rank as Rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn full_nvlink(&self) -> bool {
        self.full_nvlink
    }

    pub fn config(&self) -> &CustomArConfig {
        &self.config
    }

    /// Barrier counters of this rank, updated by kernels as they run.
    pub fn barrier_stats(&self) -> Arc<BarrierStats> {
        Arc::clone(&self.stats)
    }

    /// Strategy an all-reduce of `count` elements of `dtype` would use.
    pub fn strategy_for(&self, count: usize, dtype: DataType) -> Strategy {
        Strategy::select(
            self.world_size,
            self.full_nvlink,
            count * dtype.size_in_bytes(),
            &self.config,
        )
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of buffers currently registered, directly or via graph metadata.
    pub fn registered_buffers(&self) -> Result<usize> {
        Ok(self.live_state()?.table.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CustomArError::LockPoisoned("communicator state"))
    }

    fn live_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.lock()?;
        if self.disposed.load(Ordering::Acquire) {
            return Err(CustomArError::UseAfterDispose { handle: self.id });
        }
        Ok(state)
    }

    /// Register `buffer` for use as all-reduce scratch or input outside of
    /// graph capture. `descriptors[i]` is rank `i`'s export of its copy.
    ///
    /// Registering an address again replaces the earlier registration: its
    /// peer mappings are closed and its Rank Data slot is rewritten.
    pub fn register_buffer(
        &self,
        buffer: BufferRef<Device>,
        descriptors: &[IpcHandle],
    ) -> Result<()> {
        let mut state = self.live_state()?;
        if descriptors.len() != self.world_size {
            return Err(CustomArError::InvalidArgument(format!(
                "register_buffer needs {} descriptors, got {}",
                self.world_size,
                descriptors.len()
            )));
        }
        if buffer.ptr().is_null() {
            return Err(CustomArError::InvalidArgument(
                "cannot register a null buffer".into(),
            ));
        }

        let slot = state.table.slot_for(&buffer)?;
        let mut ptrs = vec![0u64; self.world_size];
        let mut mappings = Vec::with_capacity(self.world_size - 1);
        for (peer, descriptor) in descriptors.iter().enumerate() {
            if peer == self.rank {
                ptrs[peer] = buffer.as_u64();
                continue;
            }
            match self.open_peer_buffer(peer, descriptor, buffer.len_bytes()) {
                Ok(m) => {
                    ptrs[peer] = m.ptr();
                    mappings.push((peer, m));
                }
                Err(e) => {
                    self.close_mappings(mappings);
                    state.table.release_unused_slot(slot);
                    return Err(e);
                }
            }
        }

        self.rank_data.write_slot(slot, &ptrs);
        let replaced = state.table.insert(RegisteredBuffer {
            local: buffer,
            slot,
            mappings,
        });
        if let Some(old) = replaced {
            tracing::debug!(
                rank = self.rank,
                ptr = %buffer.ptr(),
                slot,
                "buffer re-registered, previous mappings released"
            );
            self.close_mappings(old.mappings);
        } else {
            tracing::debug!(rank = self.rank, ptr = %buffer.ptr(), slot, "buffer registered");
        }
        Ok(())
    }

    fn open_peer_buffer(
        &self,
        peer: usize,
        descriptor: &IpcHandle,
        min_len: usize,
    ) -> Result<PeerMapping> {
        let mapping =
            self.transport
                .open(descriptor)
                .map_err(|e| CustomArError::PeerUnavailable {
                    rank: peer as Rank,
                    reason: e.to_string(),
                })?;
        if mapping.len() < min_len {
            let len = mapping.len();
            self.transport.close(mapping)?;
            return Err(CustomArError::InvalidArgument(format!(
                "peer {peer} buffer is {len} bytes, local buffer is {min_len}"
            )));
        }
        Ok(mapping)
    }

    fn close_mappings(&self, mappings: Vec<(usize, PeerMapping)>) {
        for (peer, m) in mappings {
            if let Err(e) = self.transport.close(m) {
                tracing::warn!(rank = self.rank, peer, error = %e, "failed to close peer mapping");
            }
        }
    }

    /// Export every buffer captured as an all-reduce input since the last
    /// graph registration and return the metadata blob for the peers.
    ///
    /// Each call starts a new capture epoch.
    pub fn get_graph_buffer_ipc_meta(&self) -> Result<Bytes> {
        let mut state = self.live_state()?;
        let pending: Vec<PendingBuffer> = state.table.pending().to_vec();

        let mut entries = Vec::with_capacity(pending.len());
        for p in &pending {
            let handle = self.transport.export(p.local)?;
            state.table.record_graph_export(handle);
            entries.push(GraphBufferEntry {
                len: p.local.len_bytes(),
                handle,
            });
        }
        state.exported_epoch += 1;

        let meta = GraphBufferMeta {
            rank: self.rank as Rank,
            world_size: self.world_size as u32,
            epoch: state.exported_epoch,
            entries,
        };
        tracing::debug!(
            rank = self.rank,
            epoch = meta.epoch,
            buffers = meta.entries.len(),
            "graph buffer metadata exported"
        );
        Ok(meta.encode())
    }

    /// Import every rank's graph metadata for the current epoch and fill the
    /// slots reserved during capture. `metas[i]` is rank `i`'s blob, this
    /// rank's own included.
    pub fn register_graph_buffers<B: AsRef<[u8]>>(&self, metas: &[B]) -> Result<()> {
        let mut state = self.live_state()?;
        if metas.len() != self.world_size {
            return Err(CustomArError::InvalidArgument(format!(
                "register_graph_buffers needs {} metadata blobs, got {}",
                self.world_size,
                metas.len()
            )));
        }

        let decoded = metas
            .iter()
            .map(|m| GraphBufferMeta::decode(m.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let expected = if state.exported_epoch > state.registered_epoch {
            state.exported_epoch
        } else {
            state.registered_epoch + 1
        };
        let pending_count = state.table.pending().len();
        for (peer, meta) in decoded.iter().enumerate() {
            if meta.epoch != expected {
                return Err(CustomArError::EpochMismatch {
                    expected,
                    actual: meta.epoch,
                });
            }
            if meta.rank as usize != peer || meta.world_size as usize != self.world_size {
                return Err(CustomArError::InvalidArgument(format!(
                    "metadata at index {peer} is from rank {} of a {}-rank world",
                    meta.rank, meta.world_size
                )));
            }
            if meta.entries.len() != pending_count {
                return Err(CustomArError::InvalidArgument(format!(
                    "rank {peer} captured {} buffers, rank {} captured {pending_count}",
                    meta.entries.len(),
                    self.rank
                )));
            }
        }

        let pending = state.table.pending().to_vec();
        let mut imported: Vec<(PendingBuffer, Vec<u64>, Vec<(usize, PeerMapping)>)> =
            Vec::with_capacity(pending.len());
        for (i, p) in pending.iter().enumerate() {
            let mut ptrs = vec![0u64; self.world_size];
            let mut mappings = Vec::with_capacity(self.world_size - 1);
            for (peer, meta) in decoded.iter().enumerate() {
                if peer == self.rank {
                    ptrs[peer] = p.local.as_u64();
                    continue;
                }
                let entry = &meta.entries[i];
                let opened = if entry.len < p.local.len_bytes() {
                    Err(CustomArError::InvalidArgument(format!(
                        "rank {peer} graph buffer {i} is {} bytes, local is {}",
                        entry.len,
                        p.local.len_bytes()
                    )))
                } else {
                    self.open_peer_buffer(peer, &entry.handle, p.local.len_bytes())
                };
                match opened {
                    Ok(m) => {
                        ptrs[peer] = m.ptr();
                        mappings.push((peer, m));
                    }
                    Err(e) => {
                        self.close_mappings(mappings);
                        for (_, _, done) in imported {
                            self.close_mappings(done);
                        }
                        return Err(e);
                    }
                }
            }
            imported.push((*p, ptrs, mappings));
        }

        let count = imported.len();
        for (p, ptrs, mappings) in imported {
            self.rank_data.write_slot(p.slot, &ptrs);
            if let Some(old) = state.table.insert(RegisteredBuffer {
                local: p.local,
                slot: p.slot,
                mappings,
            }) {
                self.close_mappings(old.mappings);
            }
        }
        state.table.take_pending();
        state.registered_epoch = expected;
        tracing::debug!(
            rank = self.rank,
            epoch = expected,
            buffers = count,
            "graph buffers registered"
        );
        Ok(())
    }

    /// Enqueue a sum all-reduce of `count` elements of `dtype` from `input`
    /// into `output` on `stream`, and return without waiting.
    ///
    /// With `scratch`, the input is staged into that registered buffer, which
    /// must be large enough for the selected strategy. Without it, `input`
    /// itself must be registered (or the stream capturing, in which case its
    /// registration is deferred to `register_graph_buffers`); only the
    /// one-shot strategy can run this way.
    ///
    /// Every rank must issue matching all-reduce calls in the same order.
    /// A caller driving several ranks should prepare all of them first with
    /// [`Self::prepare_all_reduce`], so a rank that fails its checks never
    /// leaves the others waiting at a barrier.
    ///
    /// # Safety
    /// `input`, `output` and `scratch` must stay valid until the launched
    /// work (and any graph capturing it) has finished running.
    pub unsafe fn all_reduce(
        &self,
        stream: &Stream,
        input: BufferRef<Device>,
        output: BufferRef<Device>,
        count: usize,
        dtype: DataType,
        scratch: Option<BufferRef<Device>>,
    ) -> Result<()> {
        let prepared =
            unsafe { self.prepare_all_reduce(stream, input, output, count, dtype, scratch)? };
        match prepared {
            Some(prepared) => self.launch(stream, prepared),
            None => Ok(()),
        }
    }

    /// Run every host-side check of [`Self::all_reduce`] and build the kernel
    /// plan without enqueuing anything. `None` means there is nothing to do.
    ///
    /// # Safety
    /// Same contract as [`Self::all_reduce`].
    pub(crate) unsafe fn prepare_all_reduce(
        &self,
        stream: &Stream,
        input: BufferRef<Device>,
        output: BufferRef<Device>,
        count: usize,
        dtype: DataType,
        scratch: Option<BufferRef<Device>>,
    ) -> Result<Option<PreparedAllReduce>> {
        let mut state = self.live_state()?;
        if stream.device() != self.transport.device() {
            return Err(CustomArError::InvalidArgument(format!(
                "stream of device {} used with communicator on device {}",
                stream.device(),
                self.transport.device()
            )));
        }
        let bytes = count * dtype.size_in_bytes();
        if input.len_bytes() < bytes || output.len_bytes() < bytes {
            return Err(CustomArError::InvalidArgument(format!(
                "{count} x {dtype} needs {bytes} bytes, input has {}, output has {}",
                input.len_bytes(),
                output.len_bytes()
            )));
        }
        if count == 0 {
            return Ok(None);
        }
        state.peers.check_alive(self.transport.as_ref())?;

        let strategy = self.strategy_for(count, dtype);
        let required = strategy.required_scratch(self.world_size, bytes);
        let staging = match (strategy, scratch) {
            (Strategy::Local, _) => Staging::None,
            (_, Some(scratch)) => {
                let reg = state
                    .table
                    .get(scratch.as_u64())
                    .ok_or(CustomArError::UnregisteredBuffer {
                        ptr: scratch.as_u64(),
                    })?;
                let actual = scratch.len_bytes().min(reg.local.len_bytes());
                if actual < required {
                    return Err(CustomArError::InsufficientScratch { required, actual });
                }
                self.check_mappings(reg)?;
                Staging::Scratch {
                    slot: reg.slot,
                    buffer: scratch.as_u64(),
                }
            }
            (Strategy::OneShot, None) => {
                if let Some(reg) = state.table.get(input.as_u64()) {
                    if reg.local.len_bytes() < bytes {
                        return Err(CustomArError::InsufficientScratch {
                            required: bytes,
                            actual: reg.local.len_bytes(),
                        });
                    }
                    self.check_mappings(reg)?;
                    Staging::Input { slot: reg.slot }
                } else if stream.is_capturing() {
                    let slot = state.table.pend_graph_buffer(input)?;
                    Staging::Input { slot }
                } else {
                    return Err(CustomArError::UnregisteredBuffer {
                        ptr: input.as_u64(),
                    });
                }
            }
            (_, None) => {
                return Err(CustomArError::InsufficientScratch {
                    required,
                    actual: 0,
                });
            }
        };
        drop(state);

        let barrier: Arc<dyn PhaseBarrier> = self.barrier.clone();
        let plan = Plan {
            handle: self.id,
            disposed: Arc::clone(&self.disposed),
            strategy,
            rank: self.rank,
            world_size: self.world_size,
            count,
            dtype,
            input: input.as_u64(),
            output: output.as_u64(),
            staging,
            rank_data: self.rank_data,
            barrier,
        };
        Ok(Some(PreparedAllReduce { plan, bytes }))
    }

    /// Enqueue a prepared all-reduce on `stream`.
    pub(crate) fn launch(&self, stream: &Stream, prepared: PreparedAllReduce) -> Result<()> {
        let PreparedAllReduce { plan, bytes } = prepared;
        let strategy = plan.strategy;
        // The buffer contract was accepted by `prepare_all_reduce`.
        stream.launch(unsafe { plan.into_kernel() })?;
        tracing::trace!(
            rank = self.rank,
            strategy = %strategy,
            bytes,
            capturing = stream.is_capturing(),
            "all-reduce launched"
        );
        Ok(())
    }

    fn check_mappings(&self, buffer: &RegisteredBuffer) -> Result<()> {
        for (peer, m) in &buffer.mappings {
            if !self.transport.is_alive(m) {
                return Err(CustomArError::PeerUnavailable {
                    rank: *peer as Rank,
                    reason: format!("buffer {} mapping lost", buffer.local.ptr()),
                });
            }
        }
        Ok(())
    }

    /// Release every peer mapping and graph export and invalidate the
    /// communicator. Disposing twice fails with `UseAfterDispose`.
    ///
    /// Work already launched must have finished; synchronize first. Graphs
    /// captured from this communicator fault with `UseAfterDispose` when
    /// replayed afterwards.
    pub fn dispose(&self) -> Result<()> {
        let mut state = self.live_state()?;
        self.disposed.store(true, Ordering::Release);
        let result = Self::release(self.transport.as_ref(), &mut state);
        tracing::debug!(id = self.id, rank = self.rank, "custom allreduce disposed");
        result
    }

    fn release(transport: &dyn IpcTransport, state: &mut State) -> Result<()> {
        let mut first_err = state.peers.close_all(transport).err();
        let (mappings, exports) = state.table.drain();
        for m in mappings {
            if let Err(e) = transport.close(m) {
                first_err.get_or_insert(e);
            }
        }
        for handle in &exports {
            if let Err(e) = transport.revoke(handle) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for CustomAllreduce {
    fn drop(&mut self) {
        let Self {
            id,
            state,
            transport,
            disposed,
            ..
        } = self;
        if disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(state) = state.get_mut() else {
            return;
        };
        if let Err(e) = Self::release(&**transport, state) {
            tracing::warn!(id = *id, error = %e, "release on drop failed");
        }
    }
}

impl std::fmt::Debug for CustomAllreduce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomAllreduce")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("full_nvlink", &self.full_nvlink)
            .finish()
    }
}
