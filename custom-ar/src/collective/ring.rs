use crate::collective::ReduceArgs;
use crate::reduce::{copy_bytes, sum_ranks};

/// `world - 1` phases over a staging region of `world` slots of `bytes`.
///
/// Slot `r` of rank `r` starts with its own payload. At hop `s` every rank
/// copies slot `(r - s) mod world` from its ring predecessor, which filled
/// that slot one hop earlier. Only the predecessor is ever read. After the
/// last hop each rank holds every payload and sums the slots in rank order.
///
/// # Safety
/// See [`crate::collective::run`].
pub(super) unsafe fn run(args: &ReduceArgs<'_>) -> Vec<u8> {
    let world = args.world_size;
    let rank = args.rank;
    let bytes = args.bytes();
    let prev = args.staging[(rank + world - 1) % world];
    let own = args.staging[rank];
    let slot = |base: u64, index: usize| base + (index * bytes) as u64;

    for hop in 1..world {
        args.barrier.arrive_and_wait();
        let index = (rank + world - hop) % world;
        unsafe { copy_bytes(slot(own, index), slot(prev, index), bytes) };
    }

    let slots: Vec<u64> = (0..world).map(|i| slot(own, i)).collect();
    let mut out = vec![0u8; bytes];
    unsafe { sum_ranks(&mut out, &slots, args.count, args.dtype) };
    out
}
