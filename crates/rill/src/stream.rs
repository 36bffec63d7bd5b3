//! The stream primitive: a lazy, pull-driven, single-consumer sequence.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::FlowError;
use crate::runtime::StreamScope;

/// A lazy asynchronous sequence of `Result` items with explicit close.
///
/// A `FlowStream` is consumed destructively by exactly one consumer: it is
/// not restartable and not shareable. `None` from [`StreamExt::next`] is
/// end-of-stream; after that, further polls keep returning `None`. Streams
/// built by the combinators terminate after yielding an `Err` item; streams
/// built from raw results (see [`FlowStream::from_results`]) may keep
/// producing, which is what lets `catch_and_continue` proceed past a failure.
///
/// Every stream carries the [`StreamScope`] of its pipeline application.
/// [`FlowStream::close`] drops the producer chain, which cancels the
/// background work spawned for it, and waits for those tasks to settle;
/// merely dropping the stream aborts outstanding background tasks without
/// waiting for them.
pub struct FlowStream<T> {
    inner: Option<BoxStream<'static, Result<T, FlowError>>>,
    scope: StreamScope,
}

impl<T: Send + 'static> FlowStream<T> {
    /// Wrap a raw stream in a fresh cancellation scope.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, FlowError>> + Send + 'static,
    {
        Self::new_in(StreamScope::new(), stream)
    }

    /// Wrap a raw stream in an existing scope. Operators use this to keep
    /// one scope per pipeline application: the output stream of an operator
    /// lives in the same scope as its input.
    pub fn new_in<S>(scope: StreamScope, stream: S) -> Self
    where
        S: Stream<Item = Result<T, FlowError>> + Send + 'static,
    {
        Self {
            inner: Some(stream.boxed()),
            scope,
        }
    }

    /// A stream that yields exactly one item then ends. Used pervasively by
    /// the per-item sub-pipelines of race, parallel, retry and friends.
    pub fn once(item: T) -> Self {
        Self::new(stream::once(async move { Ok(item) }))
    }

    /// Replay a buffered sequence in order.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(stream::iter(items.into_iter().map(Ok)))
    }

    /// Replay raw results in order, including non-terminal `Err` items.
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<T, FlowError>>,
        I::IntoIter: Send + 'static,
    {
        Self::new(stream::iter(results))
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// A stream that fails immediately.
    pub fn failed(error: FlowError) -> Self {
        Self::new(stream::once(async move { Err(error) }))
    }

    pub fn scope(&self) -> &StreamScope {
        &self.scope
    }

    /// Close the stream: release the producer chain, which aborts the
    /// background work spawned for it, then wait for those tasks to settle.
    /// Idempotent, and legal mid-iteration. The scope's cancellation token
    /// is left alone: the scope is shared along the pipeline, and an
    /// operator closing its upstream must not tear down work the operators
    /// downstream of it will still spawn.
    pub async fn close(&mut self) {
        self.inner = None;
        self.scope.settle().await;
    }
}

impl<T> Stream for FlowStream<T> {
    type Item = Result<T, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            None => Poll::Ready(None),
            Some(inner) => match inner.as_mut().poll_next(cx) {
                Poll::Ready(None) => {
                    // Release the producer chain as soon as the stream ends.
                    this.inner = None;
                    Poll::Ready(None)
                }
                other => other,
            },
        }
    }
}

impl<T> std::fmt::Debug for FlowStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStream")
            .field("ended", &self.inner.is_none())
            .finish()
    }
}

/// One-shot slot for operators built around a single-use input stream
/// (`zip`, `combine_latest`, `buffer`, `chain_streams`). The first
/// application takes the stream; later applications find the slot empty and
/// must surface a misuse error.
pub(crate) struct SingleUse<T> {
    slot: std::sync::Mutex<Option<T>>,
}

impl<T> SingleUse<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            slot: std::sync::Mutex::new(Some(value)),
        }
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
