//! The flow value: an immutable, composable stream-to-stream transformation.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Shr;
use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::FlowError;
use crate::stream::FlowStream;

/// An immutable stream transformation from `I` items to `O` items.
///
/// Constructing a flow never starts work; all work happens when the flow is
/// applied to a concrete input stream, and each application is independent.
/// Flows are cheap to clone and freely shareable. Composition is available
/// both through the `>>` operator and through the fluent methods.
pub struct Flow<I, O> {
    name: Arc<str>,
    metadata: Arc<HashMap<String, Value>>,
    transform: Arc<dyn Fn(FlowStream<I>) -> FlowStream<O> + Send + Sync>,
}

impl<I, O> Clone for Flow<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            transform: self.transform.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for Flow<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl<I, O> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Build a flow from a stream transform.
    pub fn new<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(FlowStream<I>) -> FlowStream<O> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            metadata: Arc::new(HashMap::new()),
            transform: Arc::new(transform),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Rename the flow; the transform is untouched.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    /// Attach a metadata entry, visible to observability tooling and to
    /// registry search. Metadata never affects execution.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        let mut map = (*self.metadata).clone();
        map.insert(key.into(), value);
        self.metadata = Arc::new(map);
        self
    }

    /// Apply the flow to an input stream, taking ownership of it and
    /// returning a fresh output stream. No work happens until the output
    /// stream is polled.
    pub fn apply(&self, input: FlowStream<I>) -> FlowStream<O> {
        (self.transform)(input)
    }

    /// Pipe this flow into `next`.
    pub fn pipe<O2>(self, next: Flow<O, O2>) -> Flow<I, O2>
    where
        O2: Send + 'static,
    {
        let name = format!("{} ∘ {}", self.name, next.name);
        Flow::new(name, move |input| next.apply(self.apply(input)))
    }

    pub fn map<O2, F>(self, f: F) -> Flow<I, O2>
    where
        O2: Send + 'static,
        F: Fn(O) -> O2 + Send + Sync + 'static,
    {
        let name = format!("{}.map", self.name);
        let f = Arc::new(f);
        Flow::new(name, move |input| {
            let mut inner = self.apply(input);
            let f = f.clone();
            let scope = inner.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = inner.next().await {
                    yield f(item?);
                }
            })
        })
    }

    pub fn filter<F>(self, predicate: F) -> Flow<I, O>
    where
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        let name = format!("{}.filter", self.name);
        let predicate = Arc::new(predicate);
        Flow::new(name, move |input| {
            let mut inner = self.apply(input);
            let predicate = predicate.clone();
            let scope = inner.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = inner.next().await {
                    let item = item?;
                    if predicate(&item) {
                        yield item;
                    }
                }
            })
        })
    }

    pub fn flat_map<O2, F>(self, f: F) -> Flow<I, O2>
    where
        O2: Send + 'static,
        F: Fn(O) -> FlowStream<O2> + Send + Sync + 'static,
    {
        let name = format!("{}.flat_map", self.name);
        let f = Arc::new(f);
        Flow::new(name, move |input| {
            let mut inner = self.apply(input);
            let f = f.clone();
            let scope = inner.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = inner.next().await {
                    let mut sub = f(item?);
                    while let Some(out) = sub.next().await {
                        yield out?;
                    }
                }
            })
        })
    }

    /// Group outputs into lists of `size`; the final list may be short.
    pub fn batch(self, size: usize) -> Result<Flow<I, Vec<O>>, FlowError> {
        if size == 0 {
            return Err(FlowError::configuration("batch size must be positive")
                .with_flow(self.name()));
        }
        let name = format!("{}.batch({size})", self.name);
        Ok(Flow::new(name, move |input| {
            let mut inner = self.apply(input);
            let scope = inner.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut batch = Vec::new();
                while let Some(item) = inner.next().await {
                    batch.push(item?);
                    if batch.len() >= size {
                        yield std::mem::take(&mut batch);
                    }
                }
                if !batch.is_empty() {
                    yield batch;
                }
            })
        }))
    }

    /// Yield `default` if the flow produced nothing at all.
    pub fn with_fallback(self, default: O) -> Flow<I, O>
    where
        O: Clone + Sync,
    {
        let name = format!("{}.with_fallback", self.name);
        Flow::new(name, move |input| {
            let mut inner = self.apply(input);
            let default = default.clone();
            let scope = inner.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut yielded_any = false;
                while let Some(item) = inner.next().await {
                    yielded_any = true;
                    yield item?;
                }
                if !yielded_any {
                    yield default;
                }
            })
        })
    }

    /// Drain the flow's output into a list, closing the stream on both
    /// normal and error exit.
    pub async fn to_list(&self, input: FlowStream<I>) -> Result<Vec<O>, FlowError> {
        let mut out = self.apply(input);
        let mut items = Vec::new();
        let result = loop {
            match out.next().await {
                Some(Ok(item)) => items.push(item),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        out.close().await;
        result.map(|()| items)
    }

    /// Drain the flow's output, applying a side effect to each item.
    pub async fn for_each<F, Fut>(&self, input: FlowStream<I>, mut f: F) -> Result<(), FlowError>
    where
        F: FnMut(O) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut out = self.apply(input);
        let result = loop {
            match out.next().await {
                Some(Ok(item)) => f(item).await,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        out.close().await;
        result
    }

    /// Collect at most `limit` items, closing the stream even on early exit.
    pub async fn preview(&self, input: FlowStream<I>, limit: usize) -> Result<Vec<O>, FlowError> {
        let mut out = self.apply(input);
        let mut items = Vec::new();
        let result = loop {
            if items.len() >= limit {
                break Ok(());
            }
            match out.next().await {
                Some(Ok(item)) => items.push(item),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        out.close().await;
        result.map(|()| items)
    }

    /// Lift a synchronous function into a per-item flow.
    pub fn from_sync_fn<F>(f: F) -> Self
    where
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Flow::new("from_sync_fn", move |mut input: FlowStream<I>| {
            let f = f.clone();
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = input.next().await {
                    yield f(item?);
                }
            })
        })
    }

    /// Lift a fallible synchronous function; an `Err` fails the stream.
    pub fn from_try_fn<F>(f: F) -> Self
    where
        F: Fn(I) -> Result<O, FlowError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Flow::new("from_try_fn", move |mut input: FlowStream<I>| {
            let f = f.clone();
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = input.next().await {
                    yield f(item?)?;
                }
            })
        })
    }

    /// Lift an async function, awaited once per item.
    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let f = Arc::new(f);
        Flow::new("from_async_fn", move |mut input: FlowStream<I>| {
            let f = f.clone();
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = input.next().await {
                    yield f(item?).await;
                }
            })
        })
    }

    /// Lift a fallible async function, awaited once per item.
    pub fn from_async_try_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        let f = Arc::new(f);
        Flow::new("from_async_try_fn", move |mut input: FlowStream<I>| {
            let f = f.clone();
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = input.next().await {
                    yield f(item?).await?;
                }
            })
        })
    }

    /// Lift a function that yields a stream per item; sub-streams are
    /// drained to completion in input order, one at a time.
    pub fn from_event_fn<F>(f: F) -> Self
    where
        F: Fn(I) -> FlowStream<O> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Flow::new("from_event_fn", move |mut input: FlowStream<I>| {
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

    /// A source flow that replays a buffered sequence, ignoring its input.
    pub fn from_iterable(items: impl IntoIterator<Item = O>) -> Self
    where
        O: Clone + Sync,
    {
        let items: Arc<Vec<O>> = Arc::new(items.into_iter().collect());
        Flow::new("from_iterable", move |input: FlowStream<I>| {
            let items = items.clone();
            let scope = input.scope().clone();
            drop(input);
            FlowStream::new_in(scope, try_stream! {
                for item in items.iter() {
                    yield item.clone();
                }
            })
        })
    }

    /// Bridge a push-based source. Each application hands the registrar a
    /// fresh [`Emitter`]; the stream yields whatever is emitted and ends when
    /// every emitter handle has been dropped. The channel is bounded at 1024
    /// items: on overflow the newest item is dropped and a warning logged.
    pub fn from_emitter<F>(register: F) -> Self
    where
        F: Fn(Emitter<O>) + Send + Sync + 'static,
    {
        let register = Arc::new(register);
        Flow::new("from_emitter", move |input: FlowStream<I>| {
            let register = register.clone();
            let scope = input.scope().clone();
            drop(input);
            FlowStream::new_in(scope, try_stream! {
                let (tx, mut rx) = mpsc::channel(EMITTER_CAPACITY);
                register(Emitter { tx });
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            })
        })
    }

    /// A source flow that yields `value` exactly once, ignoring its input.
    pub fn pure(value: O) -> Self
    where
        O: Clone + Sync,
    {
        Flow::new("pure", move |input: FlowStream<I>| {
            let value = value.clone();
            let scope = input.scope().clone();
            drop(input);
            FlowStream::new_in(scope, try_stream! {
                yield value;
            })
        })
    }
}

impl<T: Send + 'static> Flow<T, T> {
    /// The do-nothing flow: output equals input.
    pub fn identity() -> Self {
        Flow::new("identity", |input| input)
    }
}

const EMITTER_CAPACITY: usize = 1024;

/// Push handle handed to the registrar of [`Flow::from_emitter`].
pub struct Emitter<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Emitter<T> {
    /// Push a value into the bridged stream. Never blocks: if the consumer
    /// has fallen 1024 items behind, the value is dropped and a warning
    /// logged.
    pub fn emit(&self, value: T) {
        if self.tx.try_send(value).is_err() {
            tracing::warn!("emitter overflow: dropping item");
        }
    }
}

/// Pipe composition: `a >> b` feeds a's output stream into b.
impl<I, M, O> Shr<Flow<M, O>> for Flow<I, M>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    type Output = Flow<I, O>;

    fn shr(self, rhs: Flow<M, O>) -> Flow<I, O> {
        self.pipe(rhs)
    }
}
