//! Core operators: map, filter, compose and the other one-pass essentials.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::stream::FlowStream;

/// Pipe a stream through each flow in order, returning the final stream.
/// Equivalent to composing the flows and applying them to `initial`.
pub fn run_fold<T>(initial: FlowStream<T>, steps: &[Flow<T, T>]) -> FlowStream<T>
where
    T: Send + 'static,
{
    let mut current = initial;
    for step in steps {
        current = step.apply(current);
    }
    current
}

/// Compose two flows; the output of `first` feeds `second`.
pub fn compose<A, B, C>(first: Flow<A, B>, second: Flow<B, C>) -> Flow<A, C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    first.pipe(second)
}

/// Pass each item through unchanged.
pub fn identity<T: Send + 'static>() -> Flow<T, T> {
    Flow::identity()
}

pub fn map<I, O, F>(f: F) -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Flow::new("map", move |mut input: FlowStream<I>| {
        let f = f.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                yield f(item?);
            }
        })
    })
}

pub fn filter<T, F>(predicate: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    Flow::new("filter", move |mut input: FlowStream<T>| {
        let predicate = predicate.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                if predicate(&item) {
                    yield item;
                }
            }
        })
    })
}

/// Map each item to a stream and drain the sub-streams to completion, one at
/// a time, in input order.
pub fn flat_map<I, O, F>(f: F) -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> FlowStream<O> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Flow::new("flat_map", move |mut input: FlowStream<I>| {
        let f = f.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let mut sub = f(item?);
                while let Some(out) = sub.next().await {
                    yield out?;
                }
            }
        })
    })
}

/// Flatten a stream of streams.
pub fn flatten<T: Send + 'static>() -> Flow<FlowStream<T>, T> {
    Flow::new("flatten", move |mut input: FlowStream<FlowStream<T>>| {
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(sub) = input.next().await {
                let mut sub = sub?;
                while let Some(out) = sub.next().await {
                    yield out?;
                }
            }
        })
    })
}

/// Yield at most the first `n` items, then close the upstream stream.
pub fn take<T: Send + 'static>(n: usize) -> Flow<T, T> {
    Flow::new(format!("take({n})"), move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut count = 0;
            while count < n {
                match input.next().await {
                    Some(item) => {
                        yield item?;
                        count += 1;
                    }
                    None => break,
                }
            }
            input.close().await;
        })
    })
}

/// Discard the first `n` items.
pub fn skip<T: Send + 'static>(n: usize) -> Flow<T, T> {
    Flow::new(format!("skip({n})"), move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut skipped = 0;
            while let Some(item) = input.next().await {
                let item = item?;
                if skipped < n {
                    skipped += 1;
                    continue;
                }
                yield item;
            }
        })
    })
}

/// Behave as identity while `predicate` holds; fail with a validation error
/// on the first offending item, which is not yielded.
pub fn guard<T, F>(predicate: F, message: impl Into<String>) -> Flow<T, T>
where
    T: std::fmt::Debug + Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    let message: Arc<str> = Arc::from(message.into());
    Flow::new("guard", move |mut input: FlowStream<T>| {
        let predicate = predicate.clone();
        let message = message.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                if !predicate(&item) {
                    Err(FlowError::validation(format!("{message}: {item:?}")).with_flow("guard"))?;
                }
                yield item;
            }
        })
    })
}

/// Yield items up to and including the first for which `predicate` holds,
/// then close the upstream stream.
pub fn until<T, F>(predicate: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    Flow::new("until", move |mut input: FlowStream<T>| {
        let predicate = predicate.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let done = predicate(&item);
                yield item;
                if done {
                    break;
                }
            }
            input.close().await;
        })
    })
}

/// Yield exactly one item: the list of all upstream items.
pub fn collect<T: Send + 'static>() -> Flow<T, Vec<T>> {
    Flow::new("collect", move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut items = Vec::new();
            while let Some(item) = input.next().await {
                items.push(item?);
            }
            yield items;
        })
    })
}

/// Pass items through unchanged.
///
/// Placeholder for multi-subscriber fan-out: a real broadcast primitive
/// would hand each subscriber its own cursor over a shared upstream. Until
/// one exists, a stream still has exactly one consumer and `share` changes
/// nothing.
pub fn share<T: Send + 'static>() -> Flow<T, T> {
    Flow::new("share", |input| input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_map_is_order_preserving() {
        let out = map(|x: i32| x * 2)
            .to_list(FlowStream::from_iter(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(out, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_filter_drops_items() {
        let out = filter(|x: &i32| x % 2 == 0)
            .to_list(FlowStream::from_iter(0..6))
            .await
            .unwrap();
        assert_eq!(out, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_flat_map_chars() {
        let out = flat_map(|s: &str| FlowStream::from_iter(s.chars().collect::<Vec<_>>()))
            .to_list(FlowStream::from_iter(vec!["ab", "cd"]))
            .await
            .unwrap();
        assert_eq!(out, vec!['a', 'b', 'c', 'd']);
    }

    #[tokio::test]
    async fn test_flatten_streams() {
        let nested = FlowStream::from_iter(vec![
            FlowStream::from_iter(vec![1, 2]),
            FlowStream::from_iter(vec![3]),
        ]);
        let out = flatten().to_list(nested).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_take_and_skip() {
        let out = take(2)
            .to_list(FlowStream::from_iter(vec![1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2]);

        let out = skip(2)
            .to_list(FlowStream::from_iter(vec![1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(out, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_take_zero() {
        let out = take(0)
            .to_list(FlowStream::from_iter(vec![1, 2]))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_guard_fails_on_offending_item() {
        let flow = guard(|x: &i32| *x > 0, "neg");
        let err = flow
            .to_list(FlowStream::from_iter(vec![1, 2, -1, 3]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "neg: -1");
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_until_includes_matching_item() {
        let out = until(|x: &i32| *x == 3)
            .to_list(FlowStream::from_iter(vec![1, 2, 3, 4, 5]))
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_collect_yields_single_list() {
        let out = collect()
            .to_list(FlowStream::from_iter(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_run_fold_applies_steps_in_order() {
        let steps = vec![map(|x: i32| x + 1), map(|x: i32| x * 2)];
        let out = run_fold(FlowStream::from_iter(vec![1, 2]), &steps)
            .collect::<Vec<_>>()
            .await;
        let out: Result<Vec<_>, _> = out.into_iter().collect();
        assert_eq!(out.unwrap(), vec![4, 6]);
    }

    #[tokio::test]
    async fn test_share_passes_through() {
        let out = share()
            .to_list(FlowStream::from_iter(vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2]);
    }
}
