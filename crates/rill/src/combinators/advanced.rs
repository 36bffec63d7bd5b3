//! Fan-out and fan-in: racing, parallel execution, merging, zipping.
//!
//! Every operator here that starts concurrent work follows the same
//! cancellation discipline: sub-work is either structured (owned futures
//! that die with the operator) or spawned through the stream's scope and
//! cancelled-and-awaited on every exit path.

use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::runtime::{StreamScope, FAN_IN_CAPACITY};
use crate::stream::{FlowStream, SingleUse};

/// Drain one application of `flow` over a single item into a list.
async fn collect_outputs<I, O>(flow: &Flow<I, O>, item: I) -> Result<Vec<O>, FlowError>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let mut sub = flow.apply(FlowStream::once(item));
    let mut outputs = Vec::new();
    while let Some(out) = sub.next().await {
        outputs.push(out?);
    }
    Ok(outputs)
}

/// First result of one application of `flow` over a single item.
async fn first_output<I, O>(flow: &Flow<I, O>, item: I) -> Result<O, FlowError>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let mut sub = flow.apply(FlowStream::once(item));
    match sub.next().await {
        Some(Ok(out)) => Ok(out),
        Some(Err(e)) => Err(e),
        None => Err(FlowError::execution("flow produced no result").with_flow("race")),
    }
}

/// For each input item, run every flow concurrently over a single-item
/// stream and yield the first successful first-result; the losers are
/// cancelled on the spot. If every racer fails, the stream fails with an
/// execution error.
pub fn race<I, O>(flows: Vec<Flow<I, O>>) -> Flow<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    let flows = Arc::new(flows);
    let name = format!("race({} flows)", flows.len());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let flows = flows.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                if flows.is_empty() {
                    continue;
                }
                let mut racers: FuturesUnordered<_> = flows
                    .iter()
                    .map(|flow| {
                        let flow = flow.clone();
                        let item = item.clone();
                        async move { first_output(&flow, item).await }
                    })
                    .collect();
                let mut winner: Option<O> = None;
                while let Some(result) = racers.next().await {
                    if let Ok(out) = result {
                        winner = Some(out);
                        break;
                    }
                }
                // Dropping the set cancels the losers before the next item.
                drop(racers);
                match winner {
                    Some(out) => yield out,
                    None => {
                        Err(FlowError::execution("all racing flows failed")
                            .with_flow("race"))?;
                    }
                }
            }
        })
    })
}

/// For each input item, run every flow to completion concurrently and yield
/// the concatenation of their outputs as a single list, in flow order. Any
/// failure propagates as an execution error and cancels the remaining runs.
pub fn parallel<I, O>(flows: Vec<Flow<I, O>>) -> Flow<I, Vec<O>>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    let flows = Arc::new(flows);
    let name = format!("parallel({} flows)", flows.len());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let flows = flows.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let runs = flows.iter().map(|flow| {
                    let flow = flow.clone();
                    let item = item.clone();
                    async move { collect_outputs(&flow, item).await }
                });
                match futures::future::try_join_all(runs).await {
                    Ok(results) => {
                        yield results.into_iter().flatten().collect::<Vec<_>>();
                    }
                    Err(e) => {
                        Err(FlowError::execution(format!(
                            "parallel execution failed: {e}"
                        ))
                        .with_flow("parallel"))?;
                    }
                }
            }
        })
    })
}

/// Like [`parallel`], but a failing flow simply contributes nothing; the
/// operator itself never fails.
pub fn parallel_successful<I, O>(flows: Vec<Flow<I, O>>) -> Flow<I, Vec<O>>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    let flows = Arc::new(flows);
    let name = format!("parallel_successful({} flows)", flows.len());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let flows = flows.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let runs = flows.iter().map(|flow| {
                    let flow = flow.clone();
                    let item = item.clone();
                    async move { collect_outputs(&flow, item).await }
                });
                let results = futures::future::join_all(runs).await;
                let mut combined = Vec::new();
                for result in results {
                    match result {
                        Ok(outputs) => combined.extend(outputs),
                        Err(e) => {
                            tracing::debug!(kind = e.kind(), "dropping failed branch: {e}");
                        }
                    }
                }
                yield combined;
            }
        })
    })
}

/// Queue-based fan-in: one worker per source stream pushes into a bounded
/// channel; the output yields in completion order. Closing the channel is
/// the completion sentinel. The first error cancels the remaining workers,
/// waits for them to settle, then propagates.
fn fan_in<T: Send + 'static>(streams: Vec<FlowStream<T>>, scope: StreamScope) -> FlowStream<T> {
    let worker_scope = scope.clone();
    FlowStream::new_in(scope, try_stream! {
        let (tx, mut rx) = mpsc::channel::<Result<T, FlowError>>(FAN_IN_CAPACITY);
        let mut workers = Vec::new();
        for mut source in streams {
            let tx = tx.clone();
            workers.push(worker_scope.spawn(async move {
                while let Some(result) = source.next().await {
                    let failed = result.is_err();
                    if tx.send(result).await.is_err() || failed {
                        break;
                    }
                }
            }));
        }
        drop(tx);
        let mut failure: Option<FlowError> = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(item) => yield item,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        match failure {
            Some(e) => {
                for worker in workers {
                    worker.cancel().await;
                }
                Err(e)?;
            }
            None => {
                // All senders are gone; joining surfaces worker panics.
                for worker in workers {
                    worker.join().await?;
                }
            }
        }
    })
}

/// Drain the input into a buffer, replay it into every flow concurrently,
/// and interleave their outputs in completion order. The first error
/// observed wins: remaining work is cancelled and the error propagates.
pub fn merge<I, O>(flows: Vec<Flow<I, O>>) -> Flow<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    let flows = Arc::new(flows);
    let name = format!("merge({} flows)", flows.len());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let flows = flows.clone();
        let scope = input.scope().clone();
        let fan_scope = scope.clone();
        FlowStream::new_in(scope, try_stream! {
            let mut items = Vec::new();
            while let Some(item) = input.next().await {
                items.push(item?);
            }
            if !items.is_empty() {
                let sources: Vec<FlowStream<O>> = flows
                    .iter()
                    .map(|flow| flow.apply(FlowStream::from_iter(items.clone())))
                    .collect();
                let mut merged = fan_in(sources, fan_scope.clone());
                while let Some(out) = merged.next().await {
                    yield out?;
                }
            }
        })
    })
}

/// [`merge`] for flows sharing one item type; kept for call sites where the
/// symmetric name reads better.
pub fn merge_flows<T>(flows: Vec<Flow<T, T>>) -> Flow<T, T>
where
    T: Clone + Send + 'static,
{
    merge(flows)
}

/// Fan-in over raw streams: yields from all of them concurrently, in
/// completion order, with the cancel-on-drop discipline of [`merge`].
pub fn merge_async_generators<T>(streams: Vec<FlowStream<T>>) -> FlowStream<T>
where
    T: Send + 'static,
{
    fan_in(streams, StreamScope::new())
}

/// Pair items positionally with `other`. Ends when either side ends;
/// whatever remains on the longer side is discarded. The other stream is
/// consumed by the first application; later applications fail with a misuse
/// error.
pub fn zip<T, U>(other: FlowStream<U>) -> Flow<T, (T, U)>
where
    T: Send + 'static,
    U: Send + 'static,
{
    let other = Arc::new(SingleUse::new(other));
    Flow::new("zip", move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        let Some(mut other) = other.take() else {
            return FlowStream::failed(
                FlowError::misuse("zip stream already consumed").with_flow("zip"),
            );
        };
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                match other.next().await {
                    Some(Ok(paired)) => yield (item, paired),
                    Some(Err(e)) => Err(e)?,
                    None => break,
                }
            }
        })
    })
}

/// On each primary item, emit `(item, latest-from-other)`. Nothing is
/// emitted until `other` has produced its first value; afterwards the other
/// side is tracked concurrently and its errors end the tracking quietly.
/// Single-use in `other`, like [`zip`].
pub fn combine_latest<T, U>(other: FlowStream<U>) -> Flow<T, (T, U)>
where
    T: Send + 'static,
    U: Clone + Send + 'static,
{
    let other = Arc::new(SingleUse::new(other));
    Flow::new("combine_latest", move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        let Some(mut other) = other.take() else {
            return FlowStream::failed(
                FlowError::misuse("combine_latest stream already consumed")
                    .with_flow("combine_latest"),
            );
        };
        FlowStream::new_in(scope, try_stream! {
            match other.next().await {
                Some(Ok(first)) => {
                    let mut latest = first;
                    let mut other_done = false;
                    let mut failure: Option<FlowError> = None;
                    let mut done = false;
                    while !done {
                        tokio::select! {
                            item = input.next() => match item {
                                Some(Ok(v)) => yield (v, latest.clone()),
                                Some(Err(e)) => failure = Some(e),
                                None => done = true,
                            },
                            update = other.next(), if !other_done => match update {
                                Some(Ok(v)) => latest = v,
                                Some(Err(e)) => {
                                    tracing::debug!(
                                        kind = e.kind(),
                                        "combine_latest side stream failed: {e}"
                                    );
                                    other_done = true;
                                }
                                None => other_done = true,
                            },
                        }
                        if let Some(e) = failure.take() {
                            Err(e)?;
                        }
                    }
                }
                Some(Err(e)) => Err(e)?,
                None => {}
            }
        })
    })
}

/// Yield every item of each source stream in order; each stream is drained
/// to completion before the next begins. Ignores its input. Single-use.
pub fn chain_streams<I, T>(streams: Vec<FlowStream<T>>) -> Flow<I, T>
where
    I: Send + 'static,
    T: Send + 'static,
{
    let count = streams.len();
    let streams = Arc::new(SingleUse::new(streams));
    Flow::new(
        format!("chain({count} streams)"),
        move |input: FlowStream<I>| {
            let scope = input.scope().clone();
            drop(input);
            let Some(streams) = streams.take() else {
                return FlowStream::failed(
                    FlowError::misuse("chained streams already consumed").with_flow("chain"),
                );
            };
            FlowStream::new_in(scope, try_stream! {
                for mut source in streams {
                    while let Some(item) = source.next().await {
                        yield item?;
                    }
                }
            })
        },
    )
}

/// Flat-map where the mapper also receives the original input. The current
/// item is passed as both arguments: context plumbing through a pipeline
/// would need a richer stream item type, so the original input is
/// approximated by the item itself.
pub fn flat_map_with_context<I, O, F>(f: F) -> Flow<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: Fn(I, I) -> FlowStream<O> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Flow::new("flat_map_with_context", move |mut input: FlowStream<I>| {
        let f = f.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let mut sub = f(item.clone(), item);
                while let Some(out) = sub.next().await {
                    yield out?;
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::basic::map;
    use std::time::Duration;

    fn slow_value(ms: u64, value: i32) -> Flow<i32, i32> {
        Flow::from_async_fn(move |_| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            value
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_first_success_wins() {
        let flow = race(vec![slow_value(100, 1), slow_value(10, 2)]);
        let out = flow.to_list(FlowStream::from_iter(vec![0])).await.unwrap();
        assert_eq!(out, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_skips_failed_racers() {
        let failing: Flow<i32, i32> =
            Flow::from_try_fn(|_| Err(FlowError::execution("nope")));
        let flow = race(vec![failing, slow_value(50, 7)]);
        let out = flow.to_list(FlowStream::from_iter(vec![0])).await.unwrap();
        assert_eq!(out, vec![7]);
    }

    #[tokio::test]
    async fn test_race_all_failed() {
        let failing = || Flow::<i32, i32>::from_try_fn(|_| Err(FlowError::execution("nope")));
        let flow = race(vec![failing(), failing()]);
        let err = flow
            .to_list(FlowStream::from_iter(vec![0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(err.to_string().contains("all racing flows failed"));
    }

    #[tokio::test]
    async fn test_parallel_concatenates_in_flow_order() {
        let flow = parallel(vec![map(|x: i32| x + 1), map(|x: i32| x * 10)]);
        let out = flow
            .to_list(FlowStream::from_iter(vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(out, vec![vec![2, 10], vec![3, 20]]);
    }

    #[tokio::test]
    async fn test_parallel_propagates_failure() {
        let failing: Flow<i32, i32> =
            Flow::from_try_fn(|_| Err(FlowError::validation("bad")));
        let flow = parallel(vec![map(|x: i32| x), failing]);
        let err = flow
            .to_list(FlowStream::from_iter(vec![1]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(err.to_string().contains("parallel execution failed"));
    }

    #[tokio::test]
    async fn test_parallel_successful_drops_failures() {
        let failing: Flow<i32, i32> =
            Flow::from_try_fn(|_| Err(FlowError::execution("bad")));
        let flow = parallel_successful(vec![map(|x: i32| x + 1), failing]);
        let out = flow.to_list(FlowStream::from_iter(vec![1])).await.unwrap();
        assert_eq!(out, vec![vec![2]]);
    }

    #[tokio::test]
    async fn test_merge_yields_everything() {
        let flow = merge(vec![map(|x: i32| x), map(|x: i32| x * 10)]);
        let mut out = flow
            .to_list(FlowStream::from_iter(vec![1, 2]))
            .await
            .unwrap();
        out.sort();
        assert_eq!(out, vec![1, 2, 10, 20]);
    }

    #[tokio::test]
    async fn test_merge_empty_input() {
        let flow = merge(vec![map(|x: i32| x)]);
        let out = flow.to_list(FlowStream::empty()).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_merge_propagates_first_error() {
        let failing: Flow<i32, i32> =
            Flow::from_try_fn(|_| Err(FlowError::execution("boom")));
        let flow = merge(vec![failing]);
        let err = flow
            .to_list(FlowStream::from_iter(vec![1]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_merge_async_generators_interleaves_all_items() {
        let merged = merge_async_generators(vec![
            FlowStream::from_iter(vec![1, 2]),
            FlowStream::from_iter(vec![3]),
        ]);
        let mut out: Vec<i32> = merged.map(|r| r.unwrap()).collect::<Vec<_>>().await;
        out.sort();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_zip_stops_at_shorter_side() {
        let flow = zip(FlowStream::from_iter(vec!["a", "b"]));
        let out = flow
            .to_list(FlowStream::from_iter(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(out, vec![(1, "a"), (2, "b")]);
    }

    #[tokio::test]
    async fn test_zip_second_application_is_misuse() {
        let flow = zip::<i32, i32>(FlowStream::from_iter(vec![1]));
        flow.to_list(FlowStream::from_iter(vec![1])).await.unwrap();
        let err = flow
            .to_list(FlowStream::from_iter(vec![1]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "misuse");
    }

    #[tokio::test(start_paused = true)]
    async fn test_combine_latest_tracks_other_side() {
        use async_stream::stream;
        let other: FlowStream<&str> = FlowStream::new(stream! {
            yield Ok("first");
            tokio::time::sleep(Duration::from_millis(50)).await;
            yield Ok("second");
        });
        let primary: FlowStream<i32> = FlowStream::new(stream! {
            tokio::time::sleep(Duration::from_millis(10)).await;
            yield Ok(1);
            tokio::time::sleep(Duration::from_millis(100)).await;
            yield Ok(2);
        });
        let flow = combine_latest(other);
        let out = flow.to_list(primary).await.unwrap();
        assert_eq!(out, vec![(1, "first"), (2, "second")]);
    }

    #[tokio::test]
    async fn test_combine_latest_waits_for_first_other_value() {
        let other: FlowStream<i32> = FlowStream::empty();
        let flow = combine_latest(other);
        let out = flow
            .to_list(FlowStream::from_iter(vec![1, 2]))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_chain_streams_in_order() {
        let flow = chain_streams::<(), i32>(vec![
            FlowStream::from_iter(vec![1, 2]),
            FlowStream::from_iter(vec![3]),
        ]);
        let out = flow.to_list(FlowStream::once(())).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_flat_map_with_context_passes_item_twice() {
        let flow = flat_map_with_context(|item: i32, context: i32| {
            FlowStream::from_iter(vec![item, context])
        });
        let out = flow.to_list(FlowStream::from_iter(vec![5])).await.unwrap();
        assert_eq!(out, vec![5, 5]);
    }
}
