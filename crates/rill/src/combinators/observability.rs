//! Pass-through operators that expose what a stream is doing: logging,
//! tracing, metrics counters, inspection and materialization.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use tracing::Level;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::stream::FlowStream;

/// A reified stream event, produced by [`materialize`].
///
/// A materialized stream carries exactly one terminal notification: either
/// `OnComplete` after a successful run or `OnError` after a failure, never
/// both.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    OnNext(T),
    OnError(FlowError),
    OnComplete,
}

/// Event handed to the tracer callback of [`trace`].
#[derive(Debug)]
pub enum TraceEvent<'a, T> {
    StreamStart,
    Item(&'a T),
    Error(&'a FlowError),
    StreamEnd,
}

impl<T> TraceEvent<'_, T> {
    /// Stable event name, part of the tracing contract.
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::StreamStart => "stream_start",
            TraceEvent::Item(_) => "item",
            TraceEvent::Error(_) => "error",
            TraceEvent::StreamEnd => "stream_end",
        }
    }
}

/// Context handed to the inspector callback of [`inspect`] for each item.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectContext {
    /// Zero-based index of the item.
    pub item_index: usize,
    /// Time since the stream started.
    pub elapsed: Duration,
    /// One-based position of the item.
    pub stream_position: usize,
}

/// Pass items through, logging each one via `tracing` at the given level.
pub fn log<T>(name: impl Into<String>, prefix: impl Into<String>, level: Level) -> Flow<T, T>
where
    T: std::fmt::Debug + Send + 'static,
{
    let name: Arc<str> = Arc::from(name.into());
    let prefix: Arc<str> = Arc::from(prefix.into());
    let flow_name = format!("log({name})");
    let meta_prefix = prefix.to_string();
    let meta_level = level.to_string();
    Flow::new(flow_name, move |mut input: FlowStream<T>| {
        let name = name.clone();
        let prefix = prefix.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                if level == Level::ERROR {
                    tracing::error!(flow = %name, "{prefix}{item:?}");
                } else if level == Level::WARN {
                    tracing::warn!(flow = %name, "{prefix}{item:?}");
                } else if level == Level::INFO {
                    tracing::info!(flow = %name, "{prefix}{item:?}");
                } else if level == Level::DEBUG {
                    tracing::debug!(flow = %name, "{prefix}{item:?}");
                } else {
                    tracing::trace!(flow = %name, "{prefix}{item:?}");
                }
                yield item;
            }
        })
    })
    .with_metadata("prefix", serde_json::Value::String(meta_prefix))
    .with_metadata("level", serde_json::Value::String(meta_level))
}

/// Pass items through, reporting the stream's lifecycle to `tracer`:
/// `stream_start` once, `item` per item, `error` on failure, and
/// `stream_end` at the end of both successful and failed runs.
pub fn trace<T, F>(tracer: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: for<'a> Fn(TraceEvent<'a, T>) + Send + Sync + 'static,
{
    let tracer = Arc::new(tracer);
    Flow::new("trace", move |mut input: FlowStream<T>| {
        let tracer = tracer.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            tracer(TraceEvent::StreamStart);
            while let Some(item) = input.next().await {
                match item {
                    Ok(v) => {
                        tracer(TraceEvent::Item(&v));
                        yield v;
                    }
                    Err(e) => {
                        tracer(TraceEvent::Error(&e));
                        tracer(TraceEvent::StreamEnd);
                        Err(e)?;
                    }
                }
            }
            tracer(TraceEvent::StreamEnd);
        })
    })
}

/// Pass items through, bumping named counters: `stream.started`,
/// `stream.item`, `stream.error`, `stream.completed` and a final
/// `stream.total_items.N`.
pub fn metrics<T, F>(counter: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: Fn(&str) + Send + Sync + 'static,
{
    let counter = Arc::new(counter);
    Flow::new("metrics", move |mut input: FlowStream<T>| {
        let counter = counter.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            counter("stream.started");
            let mut total = 0usize;
            while let Some(item) = input.next().await {
                match item {
                    Ok(v) => {
                        counter("stream.item");
                        total += 1;
                        yield v;
                    }
                    Err(e) => {
                        counter("stream.error");
                        counter("stream.completed");
                        counter(&format!("stream.total_items.{total}"));
                        Err(e)?;
                    }
                }
            }
            counter("stream.completed");
            counter(&format!("stream.total_items.{total}"));
        })
    })
}

/// Pass items through, calling `inspector` with each item and its position
/// in the stream.
pub fn inspect<T, F>(inspector: F) -> Flow<T, T>
where
    T: Send + 'static,
    F: Fn(&T, &InspectContext) + Send + Sync + 'static,
{
    let inspector = Arc::new(inspector);
    Flow::new("inspect", move |mut input: FlowStream<T>| {
        let inspector = inspector.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let started = tokio::time::Instant::now();
            let mut index = 0usize;
            while let Some(item) = input.next().await {
                let item = item?;
                let context = InspectContext {
                    item_index: index,
                    elapsed: started.elapsed(),
                    stream_position: index + 1,
                };
                inspector(&item, &context);
                yield item;
                index += 1;
            }
        })
    })
}

/// Reify the stream's events as [`Notification`] values: every item becomes
/// `OnNext`, then exactly one terminal notification follows — `OnComplete`
/// on success or `OnError` on failure.
pub fn materialize<T: Send + 'static>() -> Flow<T, Notification<T>> {
    Flow::new("materialize", move |mut input: FlowStream<T>| {
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut failed = false;
            while let Some(item) = input.next().await {
                match item {
                    Ok(v) => yield Notification::OnNext(v),
                    Err(e) => {
                        yield Notification::OnError(e);
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                yield Notification::OnComplete;
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_trace_event_protocol_on_success() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let flow = trace(move |event: TraceEvent<'_, i32>| {
            sink.lock().unwrap().push(event.name().to_string());
        });
        flow.to_list(FlowStream::from_iter(vec![1, 2])).await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["stream_start", "item", "item", "stream_end"]
        );
    }

    #[tokio::test]
    async fn test_trace_event_protocol_on_failure() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let flow = trace(move |event: TraceEvent<'_, i32>| {
            sink.lock().unwrap().push(event.name().to_string());
        });
        let result = flow
            .to_list(FlowStream::from_results(vec![
                Ok(1),
                Err(FlowError::execution("boom")),
            ]))
            .await;
        assert!(result.is_err());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["stream_start", "item", "error", "stream_end"]
        );
    }

    #[tokio::test]
    async fn test_metrics_counter_protocol() {
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = counts.clone();
        let flow = metrics(move |name: &str| {
            sink.lock().unwrap().push(name.to_string());
        });
        flow.to_list(FlowStream::from_iter(vec![10, 20, 30]))
            .await
            .unwrap();
        assert_eq!(
            *counts.lock().unwrap(),
            vec![
                "stream.started",
                "stream.item",
                "stream.item",
                "stream.item",
                "stream.completed",
                "stream.total_items.3"
            ]
        );
    }

    #[tokio::test]
    async fn test_inspect_context_positions() {
        let contexts = Arc::new(Mutex::new(Vec::new()));
        let sink = contexts.clone();
        let flow = inspect(move |item: &i32, context: &InspectContext| {
            sink.lock()
                .unwrap()
                .push((*item, context.item_index, context.stream_position));
        });
        flow.to_list(FlowStream::from_iter(vec![5, 6])).await.unwrap();
        assert_eq!(*contexts.lock().unwrap(), vec![(5, 0, 1), (6, 1, 2)]);
    }

    #[tokio::test]
    async fn test_materialize_success() {
        let out = materialize()
            .to_list(FlowStream::from_iter(vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![
                Notification::OnNext(1),
                Notification::OnNext(2),
                Notification::OnComplete
            ]
        );
    }

    #[tokio::test]
    async fn test_materialize_failure_has_no_oncomplete() {
        let boom = FlowError::execution("boom");
        let out = materialize()
            .to_list(FlowStream::from_results(vec![
                Ok(10),
                Ok(20),
                Err(boom.clone()),
            ]))
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![
                Notification::OnNext(10),
                Notification::OnNext(20),
                Notification::OnError(boom)
            ]
        );
    }

    #[tokio::test]
    async fn test_log_passes_items_through() {
        let flow = log("numbers", "n=", Level::DEBUG);
        let out = flow
            .to_list(FlowStream::from_iter(vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2]);
        assert_eq!(
            flow.metadata()["level"],
            serde_json::Value::String("DEBUG".to_string())
        );
    }
}
