use custom_ar::{CustomArConfig, DataType, DeviceMemory, Element, LocalGroup, Strategy};

/// Group of `world_size` in-process ranks with default tuning.
pub fn group(world_size: usize, full_nvlink: bool) -> LocalGroup {
    LocalGroup::new(world_size, full_nvlink, CustomArConfig::default()).unwrap()
}

/// One device buffer per rank holding `f(rank, i)` for `i in 0..count`.
pub fn fill<T: Element>(
    group: &LocalGroup,
    count: usize,
    f: impl Fn(usize, usize) -> T,
) -> Vec<DeviceMemory> {
    let mut bufs = group.alloc(count * std::mem::size_of::<T>()).unwrap();
    for (rank, buf) in bufs.iter_mut().enumerate() {
        let host: Vec<T> = (0..count).map(|i| f(rank, i)).collect();
        buf.copy_from_host(&host).unwrap();
    }
    bufs
}

/// Overwrite every rank's buffer with `f(rank, i)`.
pub fn refill<T: Element>(bufs: &mut [DeviceMemory], count: usize, f: impl Fn(usize, usize) -> T) {
    for (rank, buf) in bufs.iter_mut().enumerate() {
        let host: Vec<T> = (0..count).map(|i| f(rank, i)).collect();
        buf.copy_from_host(&host).unwrap();
    }
}

pub fn read<T: Element>(bufs: &[DeviceMemory], count: usize) -> Vec<Vec<T>> {
    bufs.iter().map(|b| b.copy_to_host::<T>(count).unwrap()).collect()
}

/// Register a scratch buffer big enough for whatever strategy the group
/// picks for `count` elements of `dtype`.
pub fn scratch_for(group: &LocalGroup, count: usize, dtype: DataType) -> Vec<DeviceMemory> {
    let strategy = group.comm(0).strategy_for(count, dtype);
    let bytes = strategy.required_scratch(group.world_size(), count * dtype.size_in_bytes());
    group.register_scratch(bytes.max(1)).unwrap()
}

/// Launch one all-reduce through a registered scratch buffer and wait.
pub async fn reduce_with_scratch(
    group: &LocalGroup,
    inputs: &[DeviceMemory],
    outputs: &[DeviceMemory],
    scratch: &[DeviceMemory],
    count: usize,
    dtype: DataType,
) {
    unsafe {
        group
            .all_reduce(inputs, outputs, count, dtype, Some(scratch))
            .unwrap();
    }
    group.synchronize().await.unwrap();
}

/// Pseudo-random but reproducible f32 contribution of `rank` at `i`.
pub fn noisy(rank: usize, i: usize) -> f32 {
    let x = (i as u64).wrapping_mul(2_654_435_761) ^ (rank as u64).wrapping_mul(40_503);
    (x % 10_007) as f32 * 1.0e-3 - 5.0 + 1.0 / (i as f32 + 3.0)
}

pub fn phases(group: &LocalGroup) -> Vec<u64> {
    group.comms().iter().map(|c| c.barrier_stats().phases()).collect()
}

pub fn expected_phases(strategy: Strategy, world_size: usize) -> u64 {
    strategy.barrier_phases(world_size) as u64
}
