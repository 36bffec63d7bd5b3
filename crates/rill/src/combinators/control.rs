//! Conditional routing, retries, recovery and the circuit breaker.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use tokio::time::Instant;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::stream::FlowStream;

/// Route each item through `then_flow` when the predicate holds, through
/// `else_flow` otherwise, or drop it if there is no else branch. The chosen
/// flow runs over a single-item stream and all of its outputs are yielded.
pub fn if_then<I, O, P>(
    predicate: P,
    then_flow: Flow<I, O>,
    else_flow: Option<Flow<I, O>>,
) -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Fn(&I) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    let name = match &else_flow {
        Some(e) => format!("if_then({}, {})", then_flow.name(), e.name()),
        None => format!("if_then({})", then_flow.name()),
    };
    Flow::new(name, move |mut input: FlowStream<I>| {
        let predicate = predicate.clone();
        let then_flow = then_flow.clone();
        let else_flow = else_flow.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let chosen = if predicate(&item) {
                    Some(&then_flow)
                } else {
                    else_flow.as_ref()
                };
                if let Some(flow) = chosen {
                    let mut sub = flow.apply(FlowStream::once(item));
                    while let Some(out) = sub.next().await {
                        yield out?;
                    }
                }
            }
        })
    })
}

/// Multi-way [`if_then`]: the selector picks a case flow per item; items
/// with no matching case and no default are dropped.
pub fn switch<I, O, K, S>(
    selector: S,
    cases: HashMap<K, Flow<I, O>>,
    default: Option<Flow<I, O>>,
) -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    K: Eq + Hash + Send + Sync + 'static,
    S: Fn(&I) -> K + Send + Sync + 'static,
{
    let selector = Arc::new(selector);
    let cases = Arc::new(cases);
    let name = format!("switch({} cases)", cases.len());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let selector = selector.clone();
        let cases = cases.clone();
        let default = default.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let key = selector(&item);
                if let Some(flow) = cases.get(&key).or(default.as_ref()) {
                    let mut sub = flow.apply(FlowStream::once(item));
                    while let Some(out) = sub.next().await {
                        yield out?;
                    }
                }
            }
        })
    })
}

/// Partition the input into two groups, then run the true group through
/// `true_flow` followed by the false group through `false_flow`. Buffers the
/// whole input, so it requires bounded streams.
pub fn branch<I, O, P>(
    predicate: P,
    true_flow: Flow<I, O>,
    false_flow: Option<Flow<I, O>>,
) -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Fn(&I) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    let name = format!("branch({})", true_flow.name());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let predicate = predicate.clone();
        let true_flow = true_flow.clone();
        let false_flow = false_flow.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut true_items = Vec::new();
            let mut false_items = Vec::new();
            while let Some(item) = input.next().await {
                let item = item?;
                if predicate(&item) {
                    true_items.push(item);
                } else {
                    false_items.push(item);
                }
            }
            if !true_items.is_empty() {
                let mut sub = true_flow.apply(FlowStream::from_iter(true_items));
                while let Some(out) = sub.next().await {
                    yield out?;
                }
            }
            if let Some(false_flow) = &false_flow {
                if !false_items.is_empty() {
                    let mut sub = false_flow.apply(FlowStream::from_iter(false_items));
                    while let Some(out) = sub.next().await {
                        yield out?;
                    }
                }
            }
        })
    })
}

/// Run each item through `flow`, retrying a failed attempt up to `retries`
/// times with a linear backoff of `0.1 * attempt` seconds. A failed attempt
/// yields nothing; when every attempt fails, the stream fails with an
/// execution error wrapping the last cause.
pub fn retry<I, O>(retries: u32, flow: Flow<I, O>) -> Flow<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    let name = format!("retry({retries}, {})", flow.name());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let flow = flow.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let mut delivered: Option<Vec<O>> = None;
                let mut last_error: Option<FlowError> = None;
                for attempt in 0..=retries {
                    match collect_attempt(&flow, item.clone()).await {
                        Ok(outputs) => {
                            delivered = Some(outputs);
                            break;
                        }
                        Err(e) => {
                            last_error = Some(e);
                            if attempt < retries {
                                let backoff =
                                    Duration::from_millis(100 * (u64::from(attempt) + 1));
                                tokio::time::sleep(backoff).await;
                            }
                        }
                    }
                }
                match delivered {
                    Some(outputs) => {
                        for out in outputs {
                            yield out;
                        }
                    }
                    None => {
                        let cause = last_error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "flow produced no attempt".to_string());
                        Err(FlowError::execution(format!(
                            "failed after {retries} retries: {cause}"
                        ))
                        .with_flow("retry"))?;
                    }
                }
            }
        })
    })
}

/// Buffer one attempt of `flow` over a single item so that a failure mid-way
/// yields nothing at all.
async fn collect_attempt<I, O>(flow: &Flow<I, O>, item: I) -> Result<Vec<O>, FlowError>
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

/// On upstream failure, ask `handler` for a fallback value, yield it in
/// place of the failed item, and end the stream. The handler receives the
/// error and the last item seen before it, if any.
pub fn recover<T, H, Fut>(handler: H) -> Flow<T, T>
where
    T: Clone + Send + 'static,
    H: Fn(FlowError, Option<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let handler = Arc::new(handler);
    Flow::new("recover", move |mut input: FlowStream<T>| {
        let handler = handler.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut last_seen: Option<T> = None;
            while let Some(item) = input.next().await {
                match item {
                    Ok(v) => {
                        last_seen = Some(v.clone());
                        yield v;
                    }
                    Err(e) => {
                        let fallback = handler(e, last_seen.take()).await;
                        yield fallback;
                        break;
                    }
                }
            }
        })
    })
}

/// Swallow per-item failures and keep pulling. The suppressed error is
/// logged at debug level. Note that streams produced by the combinators end
/// after a failure; continuation is observable with sources that keep
/// producing past an error, such as [`FlowStream::from_results`].
pub fn catch_and_continue<T: Send + 'static>() -> Flow<T, T> {
    catch_and_continue_with(|e: &FlowError| {
        tracing::debug!(kind = e.kind(), "suppressed stream error: {e}");
    })
    .named("catch_and_continue")
}

/// [`catch_and_continue`] with a caller-supplied handler per failure.
pub fn catch_and_continue_with<T, H>(handler: H) -> Flow<T, T>
where
    T: Send + 'static,
    H: Fn(&FlowError) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    Flow::new("catch_and_continue", move |mut input: FlowStream<T>| {
        let handler = handler.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                match item {
                    Ok(v) => yield v,
                    Err(e) => handler(&e),
                }
            }
        })
    })
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Track consecutive upstream failures; once `threshold` is reached, reject
/// items with an execution error until `recovery` has elapsed since the last
/// failure. The first item allowed through after the recovery window closes
/// the circuit again. Breaker state is shared across every application of
/// the returned flow, so failures accumulate over repeated runs.
pub fn circuit_breaker<T: Send + 'static>(threshold: u32, recovery: Duration) -> Flow<T, T> {
    let state: Arc<Mutex<BreakerState>> = Arc::new(Mutex::new(BreakerState::default()));
    let name = format!("circuit_breaker({threshold}, {recovery:?})");
    Flow::new(name, move |mut input: FlowStream<T>| {
        let state = state.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                match item {
                    Ok(v) => {
                        let rejected = {
                            let mut st = state
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            if st.consecutive_failures >= threshold {
                                let still_open = st
                                    .last_failure
                                    .map(|t| t.elapsed() < recovery)
                                    .unwrap_or(false);
                                if still_open {
                                    true
                                } else {
                                    // Recovery window passed; this success
                                    // closes the circuit.
                                    st.consecutive_failures = 0;
                                    st.last_failure = None;
                                    false
                                }
                            } else {
                                st.consecutive_failures = 0;
                                false
                            }
                        };
                        if rejected {
                            Err(FlowError::execution(format!(
                                "circuit breaker open (threshold: {threshold})"
                            ))
                            .with_flow("circuit_breaker"))?;
                        }
                        yield v;
                    }
                    Err(e) => {
                        {
                            let mut st = state
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            st.consecutive_failures += 1;
                            st.last_failure = Some(Instant::now());
                        }
                        Err(e)?;
                    }
                }
            }
        })
    })
}

/// Pass items through, firing a synchronous side effect before each yield.
pub fn tap<T, F>(side_effect: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    let side_effect = Arc::new(side_effect);
    Flow::new("tap", move |mut input: FlowStream<T>| {
        let side_effect = side_effect.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                side_effect(&item);
                yield item;
            }
        })
    })
}

/// [`tap`] with an awaited side effect.
pub fn tap_async<T, F, Fut>(side_effect: F) -> Flow<T, T>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let side_effect = Arc::new(side_effect);
    Flow::new("tap_async", move |mut input: FlowStream<T>| {
        let side_effect = side_effect.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                side_effect(item.clone()).await;
                yield item;
            }
        })
    })
}

/// Pass items through, firing a synchronous side effect after each yield.
pub fn then<T, F>(side_effect: F) -> Flow<T, T>
where
    T: Clone + Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    let side_effect = Arc::new(side_effect);
    Flow::new("then", move |mut input: FlowStream<T>| {
        let side_effect = side_effect.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let copy = item.clone();
                yield item;
                side_effect(&copy);
            }
        })
    })
}

/// [`then`] with an awaited side effect.
pub fn then_async<T, F, Fut>(side_effect: F) -> Flow<T, T>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let side_effect = Arc::new(side_effect);
    Flow::new("then_async", move |mut input: FlowStream<T>| {
        let side_effect = side_effect.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                let copy = item.clone();
                yield item;
                side_effect(copy).await;
            }
        })
    })
}

/// Apply `transform` to items for as long as `condition` holds; stop at the
/// first item where it does not, closing the upstream stream.
pub fn while_condition<I, O, P>(condition: P, transform: Flow<I, O>) -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Fn(&I) -> bool + Send + Sync + 'static,
{
    let condition = Arc::new(condition);
    let name = format!("while({})", transform.name());
    Flow::new(name, move |mut input: FlowStream<I>| {
        let condition = condition.clone();
        let transform = transform.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                if !condition(&item) {
                    break;
                }
                let mut sub = transform.apply(FlowStream::once(item));
                while let Some(out) = sub.next().await {
                    yield out?;
                }
            }
            input.close().await;
        })
    })
}

/// Buffer the input, then run each flow over the full buffered copy in
/// sequence, concatenating their outputs.
pub fn chain_flows<T>(flows: Vec<Flow<T, T>>) -> Flow<T, T>
where
    T: Clone + Send + 'static,
{
    let flows = Arc::new(flows);
    let name = format!("chain_flows({} flows)", flows.len());
    Flow::new(name, move |mut input: FlowStream<T>| {
        let flows = flows.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut items = Vec::new();
            while let Some(item) = input.next().await {
                items.push(item?);
            }
            for flow in flows.iter() {
                let mut sub = flow.apply(FlowStream::from_iter(items.clone()));
                while let Some(out) = sub.next().await {
                    yield out?;
                }
            }
        })
    })
}
