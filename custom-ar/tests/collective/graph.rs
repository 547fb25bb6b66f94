use custom_ar::{CustomArError, DataType, DeviceMemory, Graph, GraphBufferMeta, LocalGroup};

use super::helpers::{fill, group, noisy, read, reduce_with_scratch, refill, scratch_for};

/// Capture one unregistered-input all-reduce per rank.
fn capture(
    g: &LocalGroup,
    inputs: &[DeviceMemory],
    outputs: &[DeviceMemory],
    count: usize,
    dtype: DataType,
) -> Vec<Graph> {
    for r in 0..g.world_size() {
        g.stream(r).begin_capture().unwrap();
    }
    unsafe { g.all_reduce(inputs, outputs, count, dtype, None).unwrap() };
    (0..g.world_size())
        .map(|r| g.stream(r).end_capture().unwrap())
        .collect()
}

fn replay(g: &LocalGroup, graphs: &[Graph]) {
    for (r, graph) in graphs.iter().enumerate() {
        graph.replay(g.stream(r)).unwrap();
    }
}

#[tokio::test]
async fn test_graph_replay_matches_eager() {
    let g = group(4, true);
    let count = 1024;
    let mut inputs = fill(&g, count, noisy);

    let eager = g.alloc(count * 4).unwrap();
    let scratch = scratch_for(&g, count, DataType::F32);
    reduce_with_scratch(&g, &inputs, &eager, &scratch, count, DataType::F32).await;

    let outputs = g.alloc(count * 4).unwrap();
    let graphs = capture(&g, &inputs, &outputs, count, DataType::F32);
    assert!(graphs.iter().all(|graph| graph.len() == 1));
    // Capture records work without running it.
    g.synchronize().await.unwrap();
    assert_eq!(read::<f32>(&outputs, count)[0], vec![0.0f32; count]);

    g.share_graph_buffers().unwrap();
    replay(&g, &graphs);
    g.synchronize().await.unwrap();

    let expected = read::<f32>(&eager, count);
    for (got, want) in read::<f32>(&outputs, count).iter().zip(&expected) {
        let got: Vec<u32> = got.iter().map(|v| v.to_bits()).collect();
        let want: Vec<u32> = want.iter().map(|v| v.to_bits()).collect();
        assert_eq!(got, want);
    }

    // Replays read whatever the captured inputs hold at the time.
    refill(&mut inputs, count, |r, _| r as f32);
    replay(&g, &graphs);
    g.synchronize().await.unwrap();
    for out in read::<f32>(&outputs, count) {
        assert_eq!(out, vec![6.0f32; count]);
    }
}

#[tokio::test]
async fn test_replay_before_registration_faults() {
    let g = group(2, true);
    let count = 64;
    let inputs = fill(&g, count, |_, _| 1i32);
    let outputs = g.alloc(count * 4).unwrap();
    let graphs = capture(&g, &inputs, &outputs, count, DataType::I32);

    replay(&g, &graphs);
    let err = g.synchronize().await.unwrap_err();
    assert!(
        matches!(err, CustomArError::UnregisteredBuffer { ptr } if ptr == inputs[0].as_u64()),
        "{err}"
    );

    // The fault was reported; registering and replaying again recovers.
    g.share_graph_buffers().unwrap();
    replay(&g, &graphs);
    g.synchronize().await.unwrap();
    for out in read::<i32>(&outputs, count) {
        assert_eq!(out, vec![2; count]);
    }
}

#[test]
fn test_stale_metadata_rejected() {
    let g = group(2, true);
    let first: Vec<_> = g
        .comms()
        .iter()
        .map(|c| c.get_graph_buffer_ipc_meta().unwrap())
        .collect();
    for comm in g.comms() {
        comm.register_graph_buffers(&first).unwrap();
    }

    // Registering the same blobs again.
    let err = g.comm(0).register_graph_buffers(&first).unwrap_err();
    assert!(matches!(
        err,
        CustomArError::EpochMismatch {
            expected: 2,
            actual: 1
        }
    ));

    // Rank 0 exports twice; only its latest epoch is accepted.
    let second: Vec<_> = g
        .comms()
        .iter()
        .map(|c| c.get_graph_buffer_ipc_meta().unwrap())
        .collect();
    g.comm(0).get_graph_buffer_ipc_meta().unwrap();
    let err = g.comm(0).register_graph_buffers(&second).unwrap_err();
    assert!(matches!(
        err,
        CustomArError::EpochMismatch {
            expected: 3,
            actual: 2
        }
    ));
    g.comm(1).register_graph_buffers(&second).unwrap();
}

#[test]
fn test_duplicate_capture_input_exported_once() {
    let g = group(2, true);
    let count = 32;
    let inputs = fill(&g, count, |_, _| 1.0f32);
    let outputs = g.alloc(count * 4).unwrap();

    for r in 0..2 {
        g.stream(r).begin_capture().unwrap();
    }
    for _ in 0..3 {
        unsafe {
            g.all_reduce(&inputs, &outputs, count, DataType::F32, None)
                .unwrap()
        };
    }
    let graphs: Vec<Graph> = (0..2).map(|r| g.stream(r).end_capture().unwrap()).collect();
    assert_eq!(graphs[0].len(), 3);

    let blob = g.comm(0).get_graph_buffer_ipc_meta().unwrap();
    let meta = GraphBufferMeta::decode(&blob).unwrap();
    assert_eq!(meta.rank, 0);
    assert_eq!(meta.world_size, 2);
    assert_eq!(meta.entries.len(), 1);
    assert_eq!(meta.entries[0].len, count * 4);
}

#[tokio::test]
async fn test_graph_buffers_released_on_dispose() {
    let g = group(3, true);
    let count = 128;
    let inputs = fill(&g, count, |r, i| (r * i) as f32);
    let outputs = g.alloc(count * 4).unwrap();
    let graphs = capture(&g, &inputs, &outputs, count, DataType::F32);
    g.share_graph_buffers().unwrap();
    replay(&g, &graphs);
    g.synchronize().await.unwrap();

    assert_eq!(g.open_mappings(), 2 * 3 * 2);
    for comm in g.comms() {
        assert_eq!(comm.registered_buffers().unwrap(), 1);
    }

    drop(graphs);
    g.dispose().unwrap();
    assert_eq!(g.open_mappings(), 0);
}

#[tokio::test]
async fn test_replay_after_dispose_faults() {
    let g = group(2, true);
    let count = 64;
    let inputs = fill(&g, count, |_, _| 3i32);
    let outputs = g.alloc(count * 4).unwrap();
    let graphs = capture(&g, &inputs, &outputs, count, DataType::I32);
    g.share_graph_buffers().unwrap();
    g.dispose().unwrap();
    assert_eq!(g.open_mappings(), 0);

    replay(&g, &graphs);
    let err = g.synchronize().await.unwrap_err();
    assert!(
        matches!(err, CustomArError::UseAfterDispose { handle } if handle == g.comm(0).id()),
        "{err}"
    );
    for out in read::<i32>(&outputs, count) {
        assert_eq!(out, vec![0; count]);
    }
}
