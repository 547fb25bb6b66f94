use std::time::Duration;

use custom_ar::{CustomArError, DataType, IpcTransport, Strategy};

use super::helpers::{fill, group, read};

#[tokio::test]
async fn test_undersized_scratch_leaves_output_untouched() {
    let g = group(4, false);
    let count = 256;
    let bytes = count * 4;
    assert_eq!(g.comm(0).strategy_for(count, DataType::F32), Strategy::Ring);
    let inputs = fill(&g, count, |_, _| 1.0f32);
    let outputs = fill(&g, count, |_, _| -7.0f32);
    // Ring stages every rank's contribution: it needs 4 * bytes.
    let scratch = g.register_scratch(bytes).unwrap();

    let err = unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::F32, Some(&scratch))
            .unwrap_err()
    };
    assert!(
        matches!(
            err,
            CustomArError::InsufficientScratch { required, actual }
                if required == 4 * bytes && actual == bytes
        ),
        "{err}"
    );

    g.synchronize().await.unwrap();
    for out in read::<f32>(&outputs, count) {
        assert_eq!(out, vec![-7.0f32; count]);
    }
}

#[tokio::test]
async fn test_ring_without_scratch() {
    let g = group(3, false);
    let count = 32;
    let inputs = fill(&g, count, |_, _| 1u32);
    let outputs = g.alloc(count * 4).unwrap();
    g.register(&inputs).unwrap();

    let err = unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::U32, None)
            .unwrap_err()
    };
    assert!(matches!(
        err,
        CustomArError::InsufficientScratch { required, actual: 0 } if required == 3 * count * 4
    ));
}

#[test]
fn test_unregistered_scratch() {
    let g = group(2, true);
    let count = 16;
    let inputs = fill(&g, count, |_, _| 1.0f32);
    let outputs = g.alloc(count * 4).unwrap();
    let scratch = g.alloc(count * 4).unwrap();

    let err = unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::F32, Some(&scratch))
            .unwrap_err()
    };
    assert!(
        matches!(err, CustomArError::UnregisteredBuffer { ptr } if ptr == scratch[0].as_u64())
    );
}

#[test]
fn test_unregistered_input_outside_capture() {
    let g = group(2, true);
    let count = 16;
    let inputs = fill(&g, count, |_, _| 1.0f32);
    let outputs = g.alloc(count * 4).unwrap();

    let err = unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::F32, None)
            .unwrap_err()
    };
    assert!(
        matches!(err, CustomArError::UnregisteredBuffer { ptr } if ptr == inputs[0].as_u64())
    );
    assert!(!err.is_fatal());
}

#[test]
fn test_undersized_buffers_rejected() {
    let g = group(2, true);
    let inputs = fill(&g, 8, |_, _| 1.0f32);
    let outputs = g.alloc(8 * 4).unwrap();
    let scratch = g.register_scratch(64).unwrap();

    let err = unsafe {
        g.all_reduce(&inputs, &outputs, 16, DataType::F32, Some(&scratch))
            .unwrap_err()
    };
    assert!(matches!(err, CustomArError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_peer_loss_is_fatal() {
    let g = group(3, true);
    let count = 64;
    let inputs = fill(&g, count, |_, _| 1.0f32);
    let outputs = g.alloc(count * 4).unwrap();
    let scratch = g.register_scratch(count * 4).unwrap();

    g.simulate_peer_loss(1).unwrap();
    let err = unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::F32, Some(&scratch))
            .unwrap_err()
    };
    assert!(matches!(err, CustomArError::PeerUnavailable { rank: 1, .. }), "{err}");
    assert!(err.is_fatal());

    g.synchronize().await.unwrap();
    g.dispose().unwrap();
    assert_eq!(g.open_mappings(), 0);
}

#[tokio::test]
async fn test_first_rank_loss_launches_nothing() {
    let g = group(3, true);
    let count = 64;
    let inputs = fill(&g, count, |_, _| 1.0f32);
    let outputs = fill(&g, count, |_, _| -1.0f32);
    let scratch = g.register_scratch(count * 4).unwrap();

    // Rank 0 does not map its own export, so only its peers notice.
    g.simulate_peer_loss(0).unwrap();
    let err = unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::F32, Some(&scratch))
            .unwrap_err()
    };
    assert!(matches!(err, CustomArError::PeerUnavailable { rank: 0, .. }), "{err}");
    assert!(err.is_fatal());

    // No rank was left waiting on the others.
    tokio::time::timeout(Duration::from_secs(5), g.synchronize())
        .await
        .expect("a rank launched without its peers")
        .unwrap();
    for out in read::<f32>(&outputs, count) {
        assert_eq!(out, vec![-1.0f32; count]);
    }
    g.dispose().unwrap();
    assert_eq!(g.open_mappings(), 0);
}

#[test]
fn test_register_with_lost_peer() {
    let g = group(2, true);
    let bufs = g.alloc(128).unwrap();
    let handles = vec![
        g.ipc().device(0).export(bufs[0].as_buffer()).unwrap(),
        g.ipc().device(1).export(bufs[1].as_buffer()).unwrap(),
    ];
    g.ipc().device(1).revoke(&handles[1]).unwrap();

    let err = g.comm(0).register_buffer(bufs[0].as_buffer(), &handles).unwrap_err();
    assert!(matches!(err, CustomArError::PeerUnavailable { rank: 1, .. }));
    assert_eq!(g.comm(0).registered_buffers().unwrap(), 0);
}
