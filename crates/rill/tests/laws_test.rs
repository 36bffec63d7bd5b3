//! Algebraic laws of the operator library.

use rill::combinators::{batch, filter, map, materialize, scan, take, Notification};
use rill::{Flow, FlowError, FlowStream};

fn sample_input() -> Vec<i32> {
    vec![3, 1, 4, 1, 5, 9, 2, 6]
}

#[tokio::test]
async fn test_identity_law() {
    let out = Flow::<i32, i32>::identity()
        .to_list(FlowStream::from_iter(sample_input()))
        .await
        .unwrap();
    assert_eq!(out, sample_input());
}

#[tokio::test]
async fn test_identity_preserves_failure_ending() {
    let err = Flow::<i32, i32>::identity()
        .to_list(FlowStream::from_results(vec![
            Ok(1),
            Err(FlowError::execution("boom")),
        ]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");
}

#[tokio::test]
async fn test_map_fusion() {
    let f = |x: i32| x + 3;
    let g = |x: i32| x * 2;
    let composed = map(f) >> map(g);
    let fused = map(move |x: i32| g(f(x)));
    assert_eq!(
        composed
            .to_list(FlowStream::from_iter(sample_input()))
            .await
            .unwrap(),
        fused
            .to_list(FlowStream::from_iter(sample_input()))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_filter_composition() {
    let p = |x: &i32| x % 2 == 0;
    let q = |x: &i32| *x > 2;
    let chained = filter(p) >> filter(q);
    let conjoined = filter(move |x: &i32| p(x) && q(x));
    assert_eq!(
        chained
            .to_list(FlowStream::from_iter(sample_input()))
            .await
            .unwrap(),
        conjoined
            .to_list(FlowStream::from_iter(sample_input()))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_take_idempotence() {
    for (n, m) in [(2usize, 5usize), (5, 2), (3, 3), (0, 4)] {
        let stacked = take::<i32>(n) >> take::<i32>(m);
        let single = take::<i32>(n.min(m));
        assert_eq!(
            stacked
                .to_list(FlowStream::from_iter(sample_input()))
                .await
                .unwrap(),
            single
                .to_list(FlowStream::from_iter(sample_input()))
                .await
                .unwrap(),
            "take({n}) >> take({m})"
        );
    }
}

#[tokio::test]
async fn test_materialize_law_for_successful_streams() {
    for len in 0..4usize {
        let input: Vec<i32> = (0..len as i32).collect();
        let out = materialize()
            .to_list(FlowStream::from_iter(input.clone()))
            .await
            .unwrap();
        assert_eq!(out.len(), len + 1);
        for (i, notification) in out.iter().take(len).enumerate() {
            assert_eq!(*notification, Notification::OnNext(input[i]));
        }
        assert_eq!(out[len], Notification::OnComplete);
    }
}

#[tokio::test]
async fn test_scan_emits_every_prefix_fold() {
    let input = sample_input();
    let out = scan(|acc: i32, x: i32| acc + x, 10)
        .to_list(FlowStream::from_iter(input.clone()))
        .await
        .unwrap();
    assert_eq!(out.len(), input.len() + 1);
    for (k, value) in out.iter().enumerate() {
        let expected: i32 = 10 + input[..k].iter().sum::<i32>();
        assert_eq!(*value, expected, "prefix of length {k}");
    }
}

#[tokio::test]
async fn test_batch_conservation() {
    for size in 1..=4usize {
        let out = batch(size)
            .unwrap()
            .to_list(FlowStream::from_iter(sample_input()))
            .await
            .unwrap();
        let flattened: Vec<i32> = out.iter().flatten().copied().collect();
        assert_eq!(flattened, sample_input(), "batch({size}) conserves items");
        for non_final in &out[..out.len() - 1] {
            assert_eq!(non_final.len(), size);
        }
    }
}
