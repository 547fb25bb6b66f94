use crate::collective::ReduceArgs;
use crate::reduce::sum_ranks;

/// One phase: once every rank has staged its payload, each rank reads all
/// of them directly and sums the full range.
///
/// # Safety
/// See [`crate::collective::run`].
pub(super) unsafe fn run(args: &ReduceArgs<'_>) -> Vec<u8> {
    args.barrier.arrive_and_wait();
    let mut out = vec![0u8; args.bytes()];
    unsafe { sum_ranks(&mut out, args.staging, args.count, args.dtype) };
    out
}
