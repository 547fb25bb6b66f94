use custom_ar::{DataType, Strategy};
use half::{bf16, f16};

use super::helpers::{fill, group, noisy, read, reduce_with_scratch, refill, scratch_for};

#[tokio::test]
async fn test_all_ones_full_nvlink() {
    for world in [2, 3, 4, 8] {
        let g = group(world, true);
        let count = 1000;
        let inputs = fill(&g, count, |_, _| 1.0f32);
        let outputs = g.alloc(count * 4).unwrap();
        let scratch = scratch_for(&g, count, DataType::F32);

        reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;

        for (rank, out) in read::<f32>(&outputs, count).into_iter().enumerate() {
            assert_eq!(out, vec![world as f32; count], "world {world} rank {rank}");
        }
    }
}

#[tokio::test]
async fn test_all_ones_ring() {
    let g = group(4, false);
    let count = 333;
    assert_eq!(g.comm(0).strategy_for(count, DataType::F32), Strategy::Ring);
    let inputs = fill(&g, count, |_, _| 1.0f32);
    let outputs = g.alloc(count * 4).unwrap();
    let scratch = scratch_for(&g, count, DataType::F32);

    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;

    for out in read::<f32>(&outputs, count) {
        assert_eq!(out, vec![4.0f32; count]);
    }
}

#[tokio::test]
async fn test_two_shot_large_payload() {
    let g = group(4, true);
    // 800 KB, above the 512 KiB one-shot limit for four ranks.
    let count = 200_000;
    assert_eq!(g.comm(0).strategy_for(count, DataType::F32), Strategy::TwoShot);
    let inputs = fill(&g, count, |r, i| ((i % 7) + r) as f32);
    let outputs = g.alloc(count * 4).unwrap();
    let scratch = scratch_for(&g, count, DataType::F32);

    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;

    let expected: Vec<f32> = (0..count).map(|i| (4 * (i % 7) + 6) as f32).collect();
    for out in read::<f32>(&outputs, count) {
        assert_eq!(out, expected);
    }
}

#[tokio::test]
async fn test_ranks_agree_bitwise() {
    for full_nvlink in [true, false] {
        let g = group(5, full_nvlink);
        let count = 4099;
        let inputs = fill(&g, count, noisy);
        let outputs = g.alloc(count * 4).unwrap();
        let scratch = scratch_for(&g, count, DataType::F32);

        reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;

        let results = read::<f32>(&outputs, count);
        let reference: Vec<u32> = results[0].iter().map(|v| v.to_bits()).collect();
        for out in &results[1..] {
            let bits: Vec<u32> = out.iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits, reference);
        }
        // Rank-order fold, computed on the host.
        let host: Vec<f32> = (0..count)
            .map(|i| (1..5).fold(noisy(0, i), |acc, r| acc + noisy(r, i)))
            .collect();
        assert_eq!(results[0], host);
    }
}

#[tokio::test]
async fn test_repeated_runs_are_bit_identical() {
    let g = group(4, true);
    let count = 2048;
    let inputs = fill(&g, count, noisy);
    let scratch = scratch_for(&g, count, DataType::F32);

    let mut first: Option<Vec<Vec<u32>>> = None;
    for _ in 0..5 {
        let outputs = g.alloc(count * 4).unwrap();
        reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F32).await;
        let bits: Vec<Vec<u32>> = read::<f32>(&outputs, count)
            .into_iter()
            .map(|v| v.into_iter().map(f32::to_bits).collect())
            .collect();
        match &first {
            None => first = Some(bits),
            Some(reference) => assert_eq!(&bits, reference),
        }
    }
}

#[tokio::test]
async fn test_in_place() {
    let g = group(3, true);
    let count = 64;
    let data = fill(&g, count, |r, i| (r * 10 + i) as i32);
    let scratch = scratch_for(&g, count, DataType::I32);

    reduce_with_scratch(&g, &data, &data, &scratch, count, DataType::I32).await;

    let expected: Vec<i32> = (0..count).map(|i| (30 + 3 * i) as i32).collect();
    for out in read::<i32>(&data, count) {
        assert_eq!(out, expected);
    }
}

#[tokio::test]
async fn test_registered_input_without_scratch() {
    let g = group(4, true);
    let count = 256;
    let inputs = fill(&g, count, |r, _| (r + 1) as f32);
    let outputs = g.alloc(count * 4).unwrap();
    g.register(&inputs).unwrap();

    unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::F32, None)
            .unwrap();
    }
    g.synchronize().await.unwrap();

    for out in read::<f32>(&outputs, count) {
        assert_eq!(out, vec![10.0f32; count]);
    }
}

#[tokio::test]
async fn test_back_to_back_calls_reuse_scratch() {
    let g = group(4, false);
    let count = 100;
    let inputs = fill(&g, count, |r, _| r as u32);
    let outputs: Vec<_> = (0..3).map(|_| g.alloc(count * 4).unwrap()).collect();
    let scratch = scratch_for(&g, count, DataType::U32);

    // Queued without synchronizing in between; every call stages into the
    // same scratch buffers.
    for out in &outputs {
        unsafe {
            g.all_reduce(&inputs, out, count, DataType::U32, Some(&scratch))
                .unwrap();
        }
    }
    g.synchronize().await.unwrap();

    for out in &outputs {
        for values in read::<u32>(out, count) {
            assert_eq!(values, vec![6u32; count]);
        }
    }
}

#[tokio::test]
async fn test_new_input_contents_after_sync() {
    let g = group(2, true);
    let count = 8;
    let mut inputs = fill(&g, count, |_, _| 1i64);
    let outputs = g.alloc(count * 8).unwrap();
    let scratch = scratch_for(&g, count, DataType::I64);

    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::I64).await;
    assert_eq!(read::<i64>(&outputs, count)[1], vec![2; count]);

    refill(&mut inputs, count, |r, i| (r * 100 + i) as i64);
    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::I64).await;
    let expected: Vec<i64> = (0..count).map(|i| 100 + 2 * i as i64).collect();
    assert_eq!(read::<i64>(&outputs, count)[0], expected);
}

#[tokio::test]
async fn test_half_precision() {
    let g = group(4, true);
    let count = 128;

    let inputs = fill(&g, count, |r, _| f16::from_f32(0.5 * (r + 1) as f32));
    let outputs = g.alloc(count * 2).unwrap();
    let scratch = scratch_for(&g, count, DataType::F16);
    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::F16).await;
    for out in read::<f16>(&outputs, count) {
        assert!(out.iter().all(|v| v.to_f32() == 5.0));
    }

    let inputs = fill(&g, count, |_, _| bf16::from_f32(2.0));
    let outputs = g.alloc(count * 2).unwrap();
    let scratch = scratch_for(&g, count, DataType::BF16);
    reduce_with_scratch(&g, &inputs, &outputs, &scratch, count, DataType::BF16).await;
    for out in read::<bf16>(&outputs, count) {
        assert!(out.iter().all(|v| v.to_f32() == 8.0));
    }
}

#[tokio::test]
async fn test_single_rank_copies() {
    let g = group(1, true);
    let count = 16;
    let inputs = fill(&g, count, |_, i| i as f64);
    let outputs = g.alloc(count * 8).unwrap();

    unsafe {
        g.all_reduce(&inputs, &outputs, count, DataType::F64, None)
            .unwrap();
    }
    g.synchronize().await.unwrap();

    let expected: Vec<f64> = (0..count).map(|i| i as f64).collect();
    assert_eq!(read::<f64>(&outputs, count)[0], expected);
}
