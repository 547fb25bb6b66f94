//! Layout of the per-rank metadata region shared with every peer.
//!
//! ```text
//! [0..64)     arrive counter: u64, written only by the owning rank
//! [64..128)   depart counter: u64, written only by the owning rank
//! [128..)     buffer slots: MAX_BUFFER_SLOTS x world_size x u64
//!             slot s, entry r = locally mapped address of rank r's buffer
//! ```
//!
//! Peers only ever read a rank's region. Slot entries are written by host
//! registration calls and read by kernels at execution time, which is what
//! lets a captured kernel pick up buffers registered after the capture.

use std::sync::atomic::{AtomicU64, Ordering};

/// Largest supported world size.
pub const MAX_RANKS: usize = 8;

/// Number of buffer slots in every Rank Data region.
pub const MAX_BUFFER_SLOTS: usize = 256;

const FLAG_LINE: usize = 64;
const ARRIVE_OFFSET: usize = 0;
const DEPART_OFFSET: usize = FLAG_LINE;
const SLOTS_OFFSET: usize = 2 * FLAG_LINE;

/// Bytes of Rank Data a rank must provide for a world of `world_size` ranks.
pub const fn meta_size(world_size: usize) -> usize {
    SLOTS_OFFSET + MAX_BUFFER_SLOTS * world_size * std::mem::size_of::<u64>()
}

/// Required alignment of a Rank Data region.
pub const RANK_DATA_ALIGN: usize = FLAG_LINE;

/// View of a Rank Data region, local or peer-mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RankData {
    base: u64,
    world_size: usize,
}

impl RankData {
    /// # Safety
    /// `base` must be `RANK_DATA_ALIGN`-aligned and valid for
    /// `meta_size(world_size)` bytes for as long as the view is used.
    pub(crate) unsafe fn new(base: u64, world_size: usize) -> Self {
        Self { base, world_size }
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        unsafe { &*((self.base + offset as u64) as *const AtomicU64) }
    }

    /// Number of data-visibility phases the owner has entered.
    pub(crate) fn arrive(&self) -> &AtomicU64 {
        self.word(ARRIVE_OFFSET)
    }

    /// Number of exit fences the owner has entered.
    pub(crate) fn depart(&self) -> &AtomicU64 {
        self.word(DEPART_OFFSET)
    }

    fn slot_entry(&self, slot: usize, rank: usize) -> &AtomicU64 {
        debug_assert!(slot < MAX_BUFFER_SLOTS && rank < self.world_size);
        self.word(SLOTS_OFFSET + (slot * self.world_size + rank) * std::mem::size_of::<u64>())
    }

    /// Publish the per-rank addresses of one registered buffer.
    pub(crate) fn write_slot(&self, slot: usize, ptrs: &[u64]) {
        debug_assert_eq!(ptrs.len(), self.world_size);
        for (rank, &ptr) in ptrs.iter().enumerate() {
            self.slot_entry(slot, rank).store(ptr, Ordering::Release);
        }
    }

    /// Addresses stored in `slot`; zero entries have not been registered yet.
    pub(crate) fn read_slot(&self, slot: usize) -> Vec<u64> {
        (0..self.world_size)
            .map(|rank| self.slot_entry(slot, rank).load(Ordering::Acquire))
            .collect()
    }

    pub(crate) fn clear_slot(&self, slot: usize) {
        for rank in 0..self.world_size {
            self.slot_entry(slot, rank).store(0, Ordering::Release);
        }
    }

    /// Zero both counters and every slot.
    pub(crate) fn reset(&self) {
        self.arrive().store(0, Ordering::Release);
        self.depart().store(0, Ordering::Release);
        for slot in 0..MAX_BUFFER_SLOTS {
            self.clear_slot(slot);
        }
    }
}
