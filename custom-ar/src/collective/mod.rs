//! Reduction strategies and the kernel that drives them.
//!
//! Each strategy is a plain function over the per-rank staging addresses and
//! a [`PhaseBarrier`]; it returns the reduced payload without touching the
//! output buffer. The kernel in `dispatch` writes the output only after the
//! exit fence, so an output that aliases a peer-visible buffer is never
//! overwritten while a peer may still read it.

pub(crate) mod dispatch;
mod one_shot;
mod ring;
mod two_shot;

use crate::barrier::PhaseBarrier;
use crate::config::CustomArConfig;
use crate::types::DataType;

/// How an all-reduce moves data between ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Single rank: copy input to output.
    Local,
    /// Every rank reads every peer's full payload and sums it.
    OneShot,
    /// Reduce-scatter over segments, then gather the reduced segments.
    TwoShot,
    /// Contributions travel around the ring, one hop per phase.
    Ring,
}

impl Strategy {
    /// Pick the strategy for one call. Depends only on values fixed at
    /// communicator creation plus the payload size.
    pub fn select(
        world_size: usize,
        full_nvlink: bool,
        bytes: usize,
        config: &CustomArConfig,
    ) -> Self {
        if world_size <= 1 {
            Strategy::Local
        } else if !full_nvlink {
            Strategy::Ring
        } else if world_size == 2 || bytes <= config.one_shot_limit(world_size) {
            Strategy::OneShot
        } else {
            Strategy::TwoShot
        }
    }

    /// Data-visibility phases one reduction performs.
    pub fn barrier_phases(self, world_size: usize) -> usize {
        match self {
            Strategy::Local => 0,
            Strategy::OneShot => 1,
            Strategy::TwoShot => 2,
            Strategy::Ring => world_size.saturating_sub(1),
        }
    }

    /// Minimum staging bytes per rank for a payload of `bytes`.
    ///
    /// One-shot can read a registered input directly; the others need a
    /// registered scratch buffer of at least this size.
    pub fn required_scratch(self, world_size: usize, bytes: usize) -> usize {
        match self {
            Strategy::Local => 0,
            Strategy::OneShot => bytes,
            Strategy::TwoShot => 2 * bytes,
            Strategy::Ring => world_size * bytes,
        }
    }

    /// Byte offset inside the staging region where this rank's input goes.
    pub(crate) fn stage_offset(self, rank: usize, bytes: usize) -> usize {
        match self {
            Strategy::Ring => rank * bytes,
            _ => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Local => "local",
            Strategy::OneShot => "one-shot",
            Strategy::TwoShot => "two-shot",
            Strategy::Ring => "ring",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs of one strategy run on one rank.
pub(crate) struct ReduceArgs<'a> {
    pub rank: usize,
    pub world_size: usize,
    pub count: usize,
    pub dtype: DataType,
    /// Base of every rank's staging region, as addressable from this rank.
    pub staging: &'a [u64],
    pub barrier: &'a dyn PhaseBarrier,
}

impl ReduceArgs<'_> {
    pub(crate) fn bytes(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }
}

/// Run `strategy` and return the reduced payload.
///
/// # Safety
/// `args.staging` must hold, for every rank, an address valid for
/// `strategy.required_scratch(world, bytes)` bytes whose content was staged
/// before this rank's first barrier phase.
pub(crate) unsafe fn run(strategy: Strategy, args: &ReduceArgs<'_>) -> Vec<u8> {
    unsafe {
        match strategy {
            Strategy::Local => {
                let mut out = vec![0u8; args.bytes()];
                crate::reduce::sum_ranks(&mut out, &args.staging[..1], args.count, args.dtype);
                out
            }
            Strategy::OneShot => one_shot::run(args),
            Strategy::TwoShot => two_shot::run(args),
            Strategy::Ring => ring::run(args),
        }
    }
}

/// Element ranges that split `count` elements across `world` segments.
///
/// The first `count % world` segments get one extra element.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkLayout {
    count: usize,
    world: usize,
}

impl ChunkLayout {
    pub(crate) fn new(count: usize, world: usize) -> Self {
        Self { count, world }
    }

    /// `(first element, element count)` of segment `index`.
    pub(crate) fn segment(&self, index: usize) -> (usize, usize) {
        let base = self.count / self.world;
        let extra = self.count % self.world;
        let len = base + usize::from(index < extra);
        let start = index * base + index.min(extra);
        (start, len)
    }
}
