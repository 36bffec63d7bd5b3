//! End-to-end pipelines across layers: sources, composition, terminals,
//! registry and observability working together.

use std::sync::{Arc, Mutex};

use rill::combinators::{
    batch, collect, filter, flat_map, guard, map, materialize, range, scan, trace, Notification,
    TraceEvent,
};
use rill::observability::{instrument, PerformanceMonitor};
use rill::registry::FlowRegistry;
use rill::{Flow, FlowError, FlowStream};

#[tokio::test]
async fn test_range_map_filter_collect() {
    let pipeline =
        range::<()>(0, 5, 1).unwrap() >> map(|x: i64| x * 2) >> filter(|x: &i64| x % 4 == 0) >> collect();
    let out = pipeline.to_list(FlowStream::once(())).await.unwrap();
    assert_eq!(out, vec![vec![0, 4, 8]]);
}

#[tokio::test]
async fn test_iterable_scan_running_sum() {
    let pipeline = Flow::<(), i32>::from_iterable(vec![1, 2, 3]) >> scan(|a: i32, b: i32| a + b, 0);
    let out = pipeline.to_list(FlowStream::once(())).await.unwrap();
    assert_eq!(out, vec![0, 1, 3, 6]);
}

#[tokio::test]
async fn test_iterable_batch() {
    let pipeline = Flow::<(), i32>::from_iterable(vec![1, 2, 3, 4, 5]) >> batch(2).unwrap();
    let out = pipeline.to_list(FlowStream::once(())).await.unwrap();
    assert_eq!(out, vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn test_iterable_flat_map_chars() {
    let pipeline = Flow::<(), &str>::from_iterable(vec!["ab", "cd"])
        >> flat_map(|s: &str| FlowStream::from_iter(s.chars().collect::<Vec<_>>()));
    let out = pipeline.to_list(FlowStream::once(())).await.unwrap();
    assert_eq!(out, vec!['a', 'b', 'c', 'd']);
}

#[tokio::test]
async fn test_guard_raises_validation_with_offending_item() {
    let pipeline = Flow::<(), i32>::from_iterable(vec![1, 2, -1, 3]) >> guard(|x: &i32| *x > 0, "neg");
    let err = pipeline.to_list(FlowStream::once(())).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert_eq!(err.to_string(), "neg: -1");
}

#[tokio::test]
async fn test_materialize_failing_source() {
    let source: FlowStream<i32> = FlowStream::from_results(vec![
        Ok(10),
        Ok(20),
        Err(FlowError::execution("boom")),
    ]);
    let out = materialize().to_list(source).await.unwrap();
    assert_eq!(
        out,
        vec![
            Notification::OnNext(10),
            Notification::OnNext(20),
            Notification::OnError(FlowError::execution("boom")),
        ]
    );
}

#[tokio::test]
async fn test_registered_pipeline_roundtrip() {
    let registry = FlowRegistry::new();
    let pipeline = map(|x: i32| x + 1) >> filter(|x: &i32| x % 2 == 1);
    registry.register("odd_successors", pipeline, Some("arith"));

    let found = registry
        .get::<i32, i32>("odd_successors")
        .expect("registered flow");
    let out = found
        .to_list(FlowStream::from_iter(vec![0, 1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(out, vec![1, 3]);
    assert_eq!(registry.list(Some("arith")), vec!["odd_successors"]);
}

#[tokio::test]
async fn test_instrumented_and_traced_pipeline() {
    let monitor = Arc::new(PerformanceMonitor::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let pipeline = instrument(
        map(|x: i32| x * x).named("squares"),
        monitor.clone(),
    ) >> trace(move |event: TraceEvent<'_, i32>| {
        sink.lock().unwrap().push(event.name().to_string());
    });

    let out = pipeline
        .to_list(FlowStream::from_iter(vec![1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(out, vec![1, 4, 9]);

    let summary = monitor.summary();
    assert_eq!(summary["squares"].total_items, 3);
    assert_eq!(
        *events.lock().unwrap(),
        vec!["stream_start", "item", "item", "item", "stream_end"]
    );
}

#[tokio::test]
async fn test_emitter_bridge_from_background_task() {
    let flow: Flow<(), i32> = Flow::from_emitter(|emitter| {
        tokio::spawn(async move {
            for i in 0..3 {
                emitter.emit(i * 10);
                tokio::task::yield_now().await;
            }
        });
    });
    let out = flow.to_list(FlowStream::once(())).await.unwrap();
    assert_eq!(out, vec![0, 10, 20]);
}

#[tokio::test]
async fn test_preview_closes_deep_pipeline() {
    let pipeline = range::<()>(0, 1_000_000, 1).unwrap() >> map(|x: i64| x + 1);
    let out = pipeline.preview(FlowStream::once(()), 5).await.unwrap();
    assert_eq!(out, vec![1, 2, 3, 4, 5]);
}
