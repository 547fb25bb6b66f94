use custom_ar::{CustomArConfig, CustomArError, DataType, LocalGroup, PeerTopology, Strategy};

use super::helpers::{
    expected_phases, fill, group, phases, read, reduce_with_scratch, scratch_for,
};

#[tokio::test]
async fn test_ring_takes_world_minus_one_phases() {
    let g = group(4, false);
    let count = 512;
    let inputs = fill(&g, count, |r, _| r as f32);
    let outputs = g.alloc(count * 4).unwrap();
    let scratch = scratch_for(&g, count, DataType::F32);

    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;

    assert_eq!(phases(&g), vec![3; 4]);
    for comm in g.comms() {
        assert_eq!(comm.barrier_stats().fences(), 1);
    }
}

#[tokio::test]
async fn test_full_nvlink_takes_one_phase() {
    let g = group(4, true);
    let count = 512;
    assert_eq!(g.comm(0).strategy_for(count, DataType::F32), Strategy::OneShot);
    let inputs = fill(&g, count, |r, _| r as f32);
    let outputs = g.alloc(count * 4).unwrap();
    let scratch = scratch_for(&g, count, DataType::F32);

    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;

    assert_eq!(phases(&g), vec![1; 4]);
}

#[tokio::test]
async fn test_phases_accumulate_per_call() {
    for (world, full_nvlink) in [(2, false), (3, false), (8, false), (8, true)] {
        let g = group(world, full_nvlink);
        let count = 64;
        let strategy = g.comm(0).strategy_for(count, DataType::I32);
        let inputs = fill(&g, count, |_, _| 1i32);
        let outputs = g.alloc(count * 4).unwrap();
        let scratch = scratch_for(&g, count, DataType::I32);

        for _ in 0..3 {
            reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::I32).await;
        }

        let per_call = expected_phases(strategy, world);
        assert_eq!(phases(&g), vec![3 * per_call; world], "world {world}");
        for out in read::<i32>(&outputs, count) {
            assert_eq!(out, vec![world as i32; count]);
        }
    }
}

#[tokio::test]
async fn test_two_shot_takes_two_phases() {
    let config = CustomArConfig {
        one_shot_max_bytes_small_world: 1024,
        ..CustomArConfig::default()
    };
    let g = LocalGroup::new(4, true, config).unwrap();
    let count = 1000;
    assert_eq!(g.comm(0).strategy_for(count, DataType::F32), Strategy::TwoShot);
    let inputs = fill(&g, count, |r, i| (r + i) as f32);
    let outputs = g.alloc(count * 4).unwrap();
    let scratch = scratch_for(&g, count, DataType::F32);

    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;

    assert_eq!(phases(&g), vec![2; 4]);
    let expected: Vec<f32> = (0..count).map(|i| (4 * i + 6) as f32).collect();
    for out in read::<f32>(&outputs, count) {
        assert_eq!(out, expected);
    }
}

#[test]
fn test_world_of_two_always_one_shot() {
    let g = group(2, true);
    assert_eq!(
        g.comm(0).strategy_for(64 << 20, DataType::F32),
        Strategy::OneShot
    );
}

#[test]
fn test_topology_decides_connectivity() {
    let ring = PeerTopology::with_links(4, &[(0, 1), (1, 2), (2, 3), (3, 0)]).unwrap();
    let g = LocalGroup::from_topology(&ring, CustomArConfig::default()).unwrap();
    assert!(!g.comm(0).full_nvlink());
    assert_eq!(g.comm(0).strategy_for(16, DataType::F32), Strategy::Ring);

    let full = PeerTopology::from_probe(4, |_, _| Ok(true)).unwrap();
    let g = LocalGroup::from_topology(&full, CustomArConfig::default()).unwrap();
    assert!(g.comm(0).full_nvlink());
}

#[test]
fn test_topology_without_ring_rejected() {
    // Two linked pairs: no path visits every rank.
    let split = PeerTopology::with_links(4, &[(0, 1), (2, 3)]).unwrap();
    let err = LocalGroup::from_topology(&split, CustomArConfig::default()).unwrap_err();
    assert!(matches!(err, CustomArError::Initialization { .. }), "{err}");

    // Linked, but not in rank order.
    let shuffled = PeerTopology::with_links(4, &[(0, 2), (2, 1), (1, 3), (3, 0)]).unwrap();
    assert!(LocalGroup::from_topology(&shuffled, CustomArConfig::default()).is_err());
}
