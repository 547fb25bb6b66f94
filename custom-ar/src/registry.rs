//! Host-side table of buffers peers can read, keyed by local base address.

use std::collections::HashMap;

use crate::error::{CustomArError, Result};
use crate::ipc::{IpcHandle, PeerMapping};
use crate::memory::{BufferRef, Device};
use crate::rank_data::MAX_BUFFER_SLOTS;

/// A buffer registered on every rank, with this rank's mappings of the
/// peers' copies.
#[derive(Debug)]
pub(crate) struct RegisteredBuffer {
    pub local: BufferRef<Device>,
    pub slot: usize,
    /// `(peer rank, mapping)` of every peer's buffer; this rank is absent.
    pub mappings: Vec<(usize, PeerMapping)>,
}

/// A buffer first seen as an input during graph capture. It owns a slot
/// whose content stays zero until `register_graph_buffers`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingBuffer {
    pub local: BufferRef<Device>,
    pub slot: usize,
}

#[derive(Debug)]
pub(crate) struct BufferTable {
    buffers: HashMap<u64, RegisteredBuffer>,
    pending: Vec<PendingBuffer>,
    free_slots: Vec<usize>,
    /// Exports handed out by `get_graph_buffer_ipc_meta`, revoked on dispose.
    graph_exports: Vec<IpcHandle>,
}

impl BufferTable {
    pub(crate) fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            pending: Vec::new(),
            // Popped from the back, so slot 0 is handed out first.
            free_slots: (0..MAX_BUFFER_SLOTS).rev().collect(),
            graph_exports: Vec::new(),
        }
    }

    pub(crate) fn get(&self, ptr: u64) -> Option<&RegisteredBuffer> {
        self.buffers.get(&ptr)
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    fn reserve_slot(&mut self) -> Result<usize> {
        self.free_slots
            .pop()
            .ok_or(CustomArError::RankDataExhausted {
                capacity: MAX_BUFFER_SLOTS,
            })
    }

    /// Slot to use for `local`: the slot of an earlier registration or
    /// pending entry of the same address, otherwise a fresh one.
    pub(crate) fn slot_for(&mut self, local: &BufferRef<Device>) -> Result<usize> {
        if let Some(existing) = self.buffers.get(&local.as_u64()) {
            return Ok(existing.slot);
        }
        if let Some(p) = self.pending.iter().find(|p| p.local.as_u64() == local.as_u64()) {
            return Ok(p.slot);
        }
        self.reserve_slot()
    }

    /// Give back a slot from `slot_for` that ended up unused.
    pub(crate) fn release_unused_slot(&mut self, slot: usize) {
        let in_use = self.buffers.values().any(|b| b.slot == slot)
            || self.pending.iter().any(|p| p.slot == slot);
        if !in_use && !self.free_slots.contains(&slot) {
            self.free_slots.push(slot);
        }
    }

    /// Record a registration. Returns the registration it replaces, whose
    /// mappings the caller must close.
    pub(crate) fn insert(&mut self, buffer: RegisteredBuffer) -> Option<RegisteredBuffer> {
        self.buffers.insert(buffer.local.as_u64(), buffer)
    }

    /// Slot for a graph-captured input, deduplicated by address.
    pub(crate) fn pend_graph_buffer(&mut self, local: BufferRef<Device>) -> Result<usize> {
        if let Some(p) = self
            .pending
            .iter_mut()
            .find(|p| p.local.as_u64() == local.as_u64())
        {
            if local.len_bytes() > p.local.len_bytes() {
                p.local = local;
            }
            return Ok(p.slot);
        }
        let slot = self.reserve_slot()?;
        self.pending.push(PendingBuffer { local, slot });
        Ok(slot)
    }

    pub(crate) fn pending(&self) -> &[PendingBuffer] {
        &self.pending
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingBuffer> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn record_graph_export(&mut self, handle: IpcHandle) {
        self.graph_exports.push(handle);
    }

    /// Remove everything, returning the mappings to close and the exports to
    /// revoke.
    pub(crate) fn drain(&mut self) -> (Vec<PeerMapping>, Vec<IpcHandle>) {
        let mappings = self
            .buffers
            .drain()
            .flat_map(|(_, b)| b.mappings.into_iter().map(|(_, m)| m))
            .collect();
        self.pending.clear();
        (mappings, std::mem::take(&mut self.graph_exports))
    }
}
