//! Device-side barriers ordering the phases of a reduction.
//!
//! The reduction kernels only see the narrow [`PhaseBarrier`] interface, so
//! they can be driven by the Rank Data flag protocol on a real communicator
//! or by [`LocalBarrier`] in tests that have no shared metadata at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

use crate::rank_data::RankData;

/// Barrier between all ranks of one communicator.
///
/// Called from device work only; a waiting rank stalls its own stream and
/// never a host thread.
pub trait PhaseBarrier: Send + Sync {
    /// Publish everything this rank wrote so far and wait until every rank
    /// has done the same for this phase.
    fn arrive_and_wait(&self);

    /// Exit fence: wait until no rank still reads this rank's memory for the
    /// current reduction. Not counted as a phase.
    fn depart_and_wait(&self);
}

/// Counters shared between a barrier and whoever observes it.
#[derive(Debug, Default)]
pub struct BarrierStats {
    phases: AtomicU64,
    fences: AtomicU64,
}

impl BarrierStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Data-visibility phases completed.
    pub fn phases(&self) -> u64 {
        self.phases.load(Ordering::Acquire)
    }

    /// Exit fences completed.
    pub fn fences(&self) -> u64 {
        self.fences.load(Ordering::Acquire)
    }

    fn record_phase(&self) {
        self.phases.fetch_add(1, Ordering::AcqRel);
    }

    fn record_fence(&self) {
        self.fences.fetch_add(1, Ordering::AcqRel);
    }
}

/// Barrier over the arrive/depart counters of every rank's Rank Data.
///
/// A rank bumps only its own counters (release) and spins until every peer's
/// counter has caught up (acquire). Counters never reset while the
/// communicator lives, so a fast rank one phase ahead is simply seen as
/// "at least there".
pub(crate) struct FlagBarrier {
    rank: usize,
    ranks: Vec<RankData>,
    spin_before_yield: u32,
    stats: Arc<BarrierStats>,
}

impl FlagBarrier {
    /// `ranks[i]` is rank `i`'s Rank Data as mapped on this device;
    /// `ranks[rank]` is the local region.
    pub(crate) fn new(
        rank: usize,
        ranks: Vec<RankData>,
        spin_before_yield: u32,
        stats: Arc<BarrierStats>,
    ) -> Self {
        Self {
            rank,
            ranks,
            spin_before_yield,
            stats,
        }
    }

    fn signal_and_wait(&self, counter: fn(&RankData) -> &AtomicU64) {
        let own = counter(&self.ranks[self.rank]);
        // Only this rank writes its counter, so load + store cannot race.
        let target = own.load(Ordering::Relaxed) + 1;
        own.store(target, Ordering::Release);

        for (peer, rd) in self.ranks.iter().enumerate() {
            if peer == self.rank {
                continue;
            }
            let flag = counter(rd);
            let mut spins = 0u32;
            while flag.load(Ordering::Acquire) < target {
                if spins < self.spin_before_yield {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl PhaseBarrier for FlagBarrier {
    fn arrive_and_wait(&self) {
        self.signal_and_wait(RankData::arrive);
        self.stats.record_phase();
    }

    fn depart_and_wait(&self) {
        self.signal_and_wait(RankData::depart);
        self.stats.record_fence();
    }
}

/// Software barrier over `std::sync::Barrier`, one instance shared by all
/// participants of an in-process test.
pub struct LocalBarrier {
    inner: Arc<Barrier>,
    stats: Arc<BarrierStats>,
}

impl LocalBarrier {
    /// One barrier per participant, all linked together. Each participant
    /// gets its own stats.
    pub fn group(world_size: usize) -> Vec<Self> {
        let inner = Arc::new(Barrier::new(world_size));
        (0..world_size)
            .map(|_| Self {
                inner: Arc::clone(&inner),
                stats: BarrierStats::new(),
            })
            .collect()
    }

    pub fn stats(&self) -> &Arc<BarrierStats> {
        &self.stats
    }
}

impl PhaseBarrier for LocalBarrier {
    fn arrive_and_wait(&self) {
        self.inner.wait();
        self.stats.record_phase();
    }

    fn depart_and_wait(&self) {
        self.inner.wait();
        self.stats.record_fence();
    }
}
