use crate::collective::{ChunkLayout, ReduceArgs};
use crate::reduce::{copy_bytes, sum_ranks};

/// Two phases over a staging region of `2 * bytes`:
///
/// 1. Reduce-scatter: rank `r` sums segment `r` of every rank's payload and
///    writes it to segment `r` of its own upper half.
/// 2. Gather: every rank copies segment `j` from rank `j`'s upper half.
///
/// Each segment is summed by exactly one rank, in rank order, so the gathered
/// result is identical everywhere.
///
/// # Safety
/// See [`crate::collective::run`].
pub(super) unsafe fn run(args: &ReduceArgs<'_>) -> Vec<u8> {
    let esize = args.dtype.size_in_bytes();
    let bytes = args.bytes();
    let layout = ChunkLayout::new(args.count, args.world_size);

    args.barrier.arrive_and_wait();

    let (start, len) = layout.segment(args.rank);
    let seg_off = start * esize;
    let srcs: Vec<u64> = args.staging.iter().map(|&base| base + seg_off as u64).collect();
    let mut segment = vec![0u8; len * esize];
    unsafe {
        sum_ranks(&mut segment, &srcs, len, args.dtype);
        let own_upper = args.staging[args.rank] + (bytes + seg_off) as u64;
        copy_bytes(own_upper, segment.as_ptr() as u64, segment.len());
    }

    args.barrier.arrive_and_wait();

    let mut out = vec![0u8; bytes];
    for (peer, &base) in args.staging.iter().enumerate() {
        let (start, len) = layout.segment(peer);
        let off = start * esize;
        let dst = &mut out[off..off + len * esize];
        unsafe { copy_bytes(dst.as_mut_ptr() as u64, base + (bytes + off) as u64, dst.len()) };
    }
    out
}
