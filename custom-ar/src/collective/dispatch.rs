use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::barrier::PhaseBarrier;
use crate::collective::{ReduceArgs, Strategy};
use crate::error::{CustomArError, Result};
use crate::rank_data::RankData;
use crate::reduce::copy_bytes;
use crate::stream::Kernel;
use crate::types::DataType;

/// Where a kernel finds the per-rank staging addresses.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Staging {
    /// No peers; the input is reduced on its own.
    None,
    /// Rank Data slot holding every rank's registered scratch buffer. The
    /// kernel copies the input into it first. `buffer` is the local scratch
    /// address.
    Scratch { slot: usize, buffer: u64 },
    /// Rank Data slot holding every rank's registered input buffer, which
    /// peers read in place.
    Input { slot: usize },
}

/// Everything a launched all-reduce needs, fixed at launch time.
///
/// The strategy is chosen by the host once; replaying a captured plan runs
/// the same strategy with the same barrier structure. Only the slot content
/// is read at execution time, so buffers registered after a capture are
/// picked up by the replay.
pub(crate) struct Plan {
    /// Id of the launching communicator, reported once it is disposed.
    pub handle: u64,
    /// Set when the communicator is disposed or dropped. Checked before the
    /// kernel touches Rank Data or any peer mapping.
    pub disposed: Arc<AtomicBool>,
    pub strategy: Strategy,
    pub rank: usize,
    pub world_size: usize,
    pub count: usize,
    pub dtype: DataType,
    pub input: u64,
    pub output: u64,
    pub staging: Staging,
    pub rank_data: RankData,
    pub barrier: Arc<dyn PhaseBarrier>,
}

impl Plan {
    /// Wrap the plan into a re-runnable kernel.
    ///
    /// # Safety
    /// `input` and `output` must stay valid for `count` elements, and the
    /// Rank Data region and every buffer the slot names must stay mapped,
    /// for as long as the kernel (or a graph holding it) may run.
    pub(crate) unsafe fn into_kernel(self) -> Kernel {
        Arc::new(move || unsafe { self.execute() })
    }

    unsafe fn execute(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CustomArError::UseAfterDispose {
                handle: self.handle,
            });
        }
        let bytes = self.count * self.dtype.size_in_bytes();

        let (slot, buffer) = match self.staging {
            Staging::None => (None, self.input),
            Staging::Scratch { slot, buffer } => (Some(slot), buffer),
            Staging::Input { slot } => (Some(slot), self.input),
        };
        let staging = match slot {
            None => vec![self.input],
            Some(slot) => {
                let ptrs = self.rank_data.read_slot(slot);
                if ptrs.contains(&0) {
                    return Err(CustomArError::UnregisteredBuffer { ptr: buffer });
                }
                ptrs
            }
        };

        if let Staging::Scratch { .. } = self.staging {
            let dst = staging[self.rank] + self.strategy.stage_offset(self.rank, bytes) as u64;
            unsafe { copy_bytes(dst, self.input, bytes) };
        }

        let args = ReduceArgs {
            rank: self.rank,
            world_size: self.world_size,
            count: self.count,
            dtype: self.dtype,
            staging: &staging,
            barrier: self.barrier.as_ref(),
        };
        let reduced = unsafe { crate::collective::run(self.strategy, &args) };

        if self.strategy != Strategy::Local {
            self.barrier.depart_and_wait();
        }
        unsafe { copy_bytes(self.output, reduced.as_ptr() as u64, bytes) };
        tracing::trace!(
            rank = self.rank,
            strategy = %self.strategy,
            bytes,
            "all-reduce kernel done"
        );
        Ok(())
    }
}
