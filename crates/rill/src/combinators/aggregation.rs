//! Aggregation operators: batching, windowing, scanning, grouping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_stream::try_stream;
use futures::future::BoxFuture;
use futures::StreamExt;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::stream::{FlowStream, SingleUse};

/// Group items into lists of `size`; the final list may be short and is
/// emitted on upstream completion. No partial batch is ever dropped.
pub fn batch<T: Send + 'static>(size: usize) -> Result<Flow<T, Vec<T>>, FlowError> {
    if size == 0 {
        return Err(FlowError::configuration("batch size must be positive").with_flow("batch"));
    }
    Ok(Flow::new(
        format!("batch({size})"),
        move |mut input: FlowStream<T>| {
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut batch = Vec::new();
                while let Some(item) = input.next().await {
                    batch.push(item?);
                    if batch.len() >= size {
                        yield std::mem::take(&mut batch);
                    }
                }
                if !batch.is_empty() {
                    yield batch;
                }
            })
        },
    ))
}

/// Alias of [`batch`] that reads better when the lists are chunks of work.
pub fn chunk<T: Send + 'static>(size: usize) -> Result<Flow<T, Vec<T>>, FlowError> {
    Ok(batch(size)?.named(format!("chunk({size})")))
}

/// Sliding windows of `size` items, emitted every `step` arrivals once the
/// window is first full.
pub fn window<T>(size: usize, step: usize) -> Result<Flow<T, Vec<T>>, FlowError>
where
    T: Clone + Send + 'static,
{
    if size == 0 || step == 0 {
        return Err(
            FlowError::configuration("window size and step must be positive").with_flow("window"),
        );
    }
    Ok(Flow::new(
        format!("window({size}, step={step})"),
        move |mut input: FlowStream<T>| {
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut window: VecDeque<T> = VecDeque::with_capacity(size);
                let mut seen = 0usize;
                while let Some(item) = input.next().await {
                    if window.len() == size {
                        window.pop_front();
                    }
                    window.push_back(item?);
                    seen += 1;
                    if window.len() == size && (seen - size) % step == 0 {
                        yield window.iter().cloned().collect::<Vec<_>>();
                    }
                }
            })
        },
    ))
}

/// Running accumulation that emits every intermediate value, starting with
/// `initial` itself.
pub fn scan<I, O, F>(f: F, initial: O) -> Flow<I, O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
    F: Fn(O, I) -> O + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Flow::new("scan", move |mut input: FlowStream<I>| {
        let f = f.clone();
        let initial = initial.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut acc = initial;
            yield acc.clone();
            while let Some(item) = input.next().await {
                acc = f(acc, item?);
                yield acc.clone();
            }
        })
    })
}

/// Collect the entire stream, then emit one `(key, items)` pair per distinct
/// key, in first-seen key order. Requires bounded input.
pub fn group_by<T, K, F>(key_fn: F) -> Flow<T, (K, Vec<T>)>
where
    T: Send + 'static,
    K: Clone + Eq + Hash + Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    let key_fn = Arc::new(key_fn);
    Flow::new("group_by", move |mut input: FlowStream<T>| {
        let key_fn = key_fn.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut order: Vec<(K, Vec<T>)> = Vec::new();
            let mut index: HashMap<K, usize> = HashMap::new();
            while let Some(item) = input.next().await {
                let item = item?;
                let key = key_fn(&item);
                match index.get(&key) {
                    Some(&i) => order[i].1.push(item),
                    None => {
                        index.insert(key.clone(), order.len());
                        order.push((key, vec![item]));
                    }
                }
            }
            for group in order {
                yield group;
            }
        })
    })
}

/// Yield an item only the first time its value is seen. The seen-set grows
/// without bound; bounding it is the caller's responsibility.
pub fn distinct<T>() -> Flow<T, T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    distinct_by(|item: &T| item.clone()).named("distinct")
}

/// Yield an item only the first time its key is seen.
pub fn distinct_by<T, K, F>(key_fn: F) -> Flow<T, T>
where
    T: Send + 'static,
    K: Eq + Hash + Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    let key_fn = Arc::new(key_fn);
    Flow::new("distinct_by", move |mut input: FlowStream<T>| {
        let key_fn = key_fn.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut seen = HashSet::new();
            while let Some(item) = input.next().await {
                let item = item?;
                if seen.insert(key_fn(&item)) {
                    yield item;
                }
            }
        })
    })
}

/// Consecutive overlapping pairs `(previous, current)`; the first item alone
/// produces nothing.
pub fn pairwise<T>() -> Flow<T, (T, T)>
where
    T: Clone + Send + 'static,
{
    Flow::new("pairwise", move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut previous: Option<T> = None;
            while let Some(item) = input.next().await {
                let item = item?;
                if let Some(prev) = previous.replace(item.clone()) {
                    yield (prev, item);
                }
            }
        })
    })
}

/// Per-key cache: on a repeated key, re-emit the first-seen value for that
/// key instead of the new arrival.
pub fn memoize<T, K, F>(key_fn: F) -> Flow<T, T>
where
    T: Clone + Send + 'static,
    K: Eq + Hash + Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    let key_fn = Arc::new(key_fn);
    Flow::new("memoize", move |mut input: FlowStream<T>| {
        let key_fn = key_fn.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut cache: HashMap<K, T> = HashMap::new();
            while let Some(item) = input.next().await {
                let item = item?;
                let key = key_fn(&item);
                match cache.get(&key) {
                    Some(cached) => yield cached.clone(),
                    None => {
                        cache.insert(key, item.clone());
                        yield item;
                    }
                }
            }
        })
    })
}

/// Accumulate items until `trigger` emits, then emit the buffered list and
/// clear it. Whatever remains when the input completes is emitted as a final
/// list. The trigger stream is consumed by the first application; a second
/// application fails with a misuse error.
pub fn buffer<T, U>(trigger: FlowStream<U>) -> Flow<T, Vec<T>>
where
    T: Send + 'static,
    U: Send + 'static,
{
    let trigger = Arc::new(SingleUse::new(trigger));
    Flow::new("buffer", move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        let Some(mut trigger) = trigger.take() else {
            return FlowStream::failed(
                FlowError::misuse("buffer trigger stream already consumed").with_flow("buffer"),
            );
        };
        FlowStream::new_in(scope, try_stream! {
            let mut buf: Vec<T> = Vec::new();
            let mut trigger_done = false;
            let mut failure: Option<FlowError> = None;
            loop {
                let input_done = tokio::select! {
                    item = input.next() => match item {
                        Some(Ok(v)) => {
                            buf.push(v);
                            false
                        }
                        Some(Err(e)) => {
                            failure = Some(e);
                            false
                        }
                        None => true,
                    },
                    fired = trigger.next(), if !trigger_done => {
                        match fired {
                            Some(Ok(_)) => {
                                if !buf.is_empty() {
                                    yield std::mem::take(&mut buf);
                                }
                            }
                            Some(Err(_)) | None => trigger_done = true,
                        }
                        false
                    }
                };
                if let Some(e) = failure.take() {
                    Err(e)?;
                }
                if input_done {
                    break;
                }
            }
            if !buf.is_empty() {
                yield buf;
            }
        })
    })
}

/// Breadth-first recursive expansion: yield each item, then feed it to
/// `expander` and enqueue the results one level deeper, up to `max_depth`.
pub fn expand<T, F>(expander: F, max_depth: usize) -> Flow<T, T>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> FlowStream<T> + Send + Sync + 'static,
{
    let expander = Arc::new(expander);
    Flow::new(
        format!("expand(depth={max_depth})"),
        move |mut input: FlowStream<T>| {
            let expander = expander.clone();
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut queue: VecDeque<(T, usize)> = VecDeque::new();
                while let Some(item) = input.next().await {
                    queue.push_back((item?, 0));
                }
                while let Some((item, depth)) = queue.pop_front() {
                    let seed = (depth < max_depth).then(|| item.clone());
                    yield item;
                    if let Some(seed) = seed {
                        let mut expanded = expander(seed);
                        while let Some(out) = expanded.next().await {
                            queue.push_back((out?, depth + 1));
                        }
                    }
                }
            })
        },
    )
}

/// Run `f` exactly once when the stream ends, whether it completed, failed,
/// or was closed early.
pub fn finalize<T, F>(f: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: Fn() + Send + Sync + 'static,
{
    let f: Arc<dyn Fn() + Send + Sync> = Arc::new(f);
    Flow::new("finalize", move |mut input: FlowStream<T>| {
        let f = f.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let _guard = FinalizeGuard { f: Some(f) };
            while let Some(item) = input.next().await {
                yield item?;
            }
        })
    })
}

/// Async variant of [`finalize`]. On completion or failure the finalizer is
/// awaited in place; if the stream is dropped early instead, the finalizer
/// is spawned onto the runtime as a detached task.
pub fn finalize_async<T, F, Fut>(f: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let f: Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync> =
        Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) });
    Flow::new("finalize_async", move |mut input: FlowStream<T>| {
        let f = f.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut guard = AsyncFinalizeGuard { f: Some(f) };
            loop {
                match input.next().await {
                    Some(Ok(item)) => yield item,
                    Some(Err(e)) => {
                        if let Some(f) = guard.f.take() {
                            f().await;
                        }
                        Err(e)?;
                    }
                    None => break,
                }
            }
            if let Some(f) = guard.f.take() {
                f().await;
            }
        })
    })
}

struct FinalizeGuard {
    f: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

struct AsyncFinalizeGuard {
    f: Option<Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>>,
}

impl Drop for AsyncFinalizeGuard {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(f());
                }
                Err(_) => tracing::debug!("async finalizer dropped outside a runtime"),
            }
        }
    }
}
