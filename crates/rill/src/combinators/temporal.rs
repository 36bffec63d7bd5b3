//! Time-based operators. All timing goes through `tokio::time`, so the
//! paused test clock drives these deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use tokio::time::Instant;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::stream::FlowStream;

/// Debounce behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceMode {
    /// Emit the first item immediately, suppress the rest until the interval
    /// has elapsed since the last emission. Classic button-click debouncing.
    LeadingEdge,
    /// Emit the most recent item once the stream has been quiet for the
    /// interval; the timer resets on every arrival. Search-as-you-type.
    TrailingEdge,
}

/// Sleep `duration` before yielding each item. Order-preserving.
pub fn delay<T: Send + 'static>(duration: Duration) -> Flow<T, T> {
    Flow::new(
        format!("delay({duration:?})"),
        move |mut input: FlowStream<T>| {
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = input.next().await {
                    let item = item?;
                    tokio::time::sleep(duration).await;
                    yield item;
                }
            })
        },
    )
}

/// Cap throughput at `rate_per_second` items per second, sleeping as needed.
/// The pacing state is shared by every application of the returned flow.
pub fn throttle<T: Send + 'static>(rate_per_second: f64) -> Result<Flow<T, T>, FlowError> {
    if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
        return Err(
            FlowError::configuration("throttle rate must be positive").with_flow("throttle"),
        );
    }
    let min_interval = Duration::from_secs_f64(1.0 / rate_per_second);
    let last_yield: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    Ok(Flow::new(
        format!("throttle({rate_per_second}/s)"),
        move |mut input: FlowStream<T>| {
            let last_yield = last_yield.clone();
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                while let Some(item) = input.next().await {
                    let item = item?;
                    let wait = {
                        let last = last_yield
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        last.map(|t| min_interval.saturating_sub(t.elapsed()))
                            .unwrap_or(Duration::ZERO)
                    };
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    *last_yield
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
                    yield item;
                }
            })
        },
    ))
}

/// Debounce the stream with the given quiet interval and mode.
pub fn debounce<T: Send + 'static>(quiet: Duration, mode: DebounceMode) -> Flow<T, T> {
    match mode {
        DebounceMode::LeadingEdge => debounce_leading(quiet),
        DebounceMode::TrailingEdge => debounce_trailing(quiet),
    }
}

fn debounce_leading<T: Send + 'static>(quiet: Duration) -> Flow<T, T> {
    Flow::new(
        format!("debounce_leading({quiet:?})"),
        move |mut input: FlowStream<T>| {
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut last_emit: Option<Instant> = None;
                while let Some(item) = input.next().await {
                    let item = item?;
                    let open = last_emit.map(|t| t.elapsed() >= quiet).unwrap_or(true);
                    if open {
                        last_emit = Some(Instant::now());
                        yield item;
                    }
                }
            })
        },
    )
}

fn debounce_trailing<T: Send + 'static>(quiet: Duration) -> Flow<T, T> {
    Flow::new(
        format!("debounce_trailing({quiet:?})"),
        move |mut input: FlowStream<T>| {
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut pending: Option<T> = None;
                let mut failure: Option<FlowError> = None;
                let mut done = false;
                while !done {
                    match pending.take() {
                        None => match input.next().await {
                            Some(Ok(item)) => pending = Some(item),
                            Some(Err(e)) => failure = Some(e),
                            None => done = true,
                        },
                        Some(current) => {
                            // The sleep re-arms on every arrival, so it fires
                            // only after a full quiet interval.
                            tokio::select! {
                                item = input.next() => match item {
                                    Some(Ok(newer)) => pending = Some(newer),
                                    Some(Err(e)) => failure = Some(e),
                                    None => {
                                        pending = Some(current);
                                        done = true;
                                    }
                                },
                                _ = tokio::time::sleep(quiet) => {
                                    yield current;
                                }
                            }
                        }
                    }
                    if let Some(e) = failure.take() {
                        Err(e)?;
                    }
                }
                // Final pending item is emitted on upstream completion.
                if let Some(last) = pending {
                    yield last;
                }
            })
        },
    )
}

/// Every `interval`, emit the most recent item if one has arrived since the
/// last sample. Nothing is emitted for a quiet interval.
pub fn sample<T>(interval: Duration) -> Result<Flow<T, T>, FlowError>
where
    T: Clone + Send + 'static,
{
    if interval.is_zero() {
        return Err(
            FlowError::configuration("sample interval must be positive").with_flow("sample"),
        );
    }
    Ok(Flow::new(
        format!("sample({interval:?})"),
        move |mut input: FlowStream<T>| {
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                let mut latest: Option<T> = None;
                let mut fresh = false;
                let mut failure: Option<FlowError> = None;
                let mut done = false;
                let mut ticker =
                    tokio::time::interval_at(Instant::now() + interval, interval);
                while !done {
                    tokio::select! {
                        item = input.next() => match item {
                            Some(Ok(v)) => {
                                latest = Some(v);
                                fresh = true;
                            }
                            Some(Err(e)) => failure = Some(e),
                            None => done = true,
                        },
                        _ = ticker.tick() => {
                            if fresh {
                                if let Some(v) = latest.clone() {
                                    yield v;
                                }
                                fresh = false;
                            }
                        }
                    }
                    if let Some(e) = failure.take() {
                        Err(e)?;
                    }
                }
            })
        },
    ))
}

/// Bound the wait for each next item. The stream as a whole may run longer
/// than `limit` as long as it keeps producing.
pub fn timeout<T: Send + 'static>(limit: Duration) -> Flow<T, T> {
    Flow::new(
        format!("timeout({limit:?})"),
        move |mut input: FlowStream<T>| {
            let scope = input.scope().clone();
            FlowStream::new_in(scope, try_stream! {
                loop {
                    match tokio::time::timeout(limit, input.next()).await {
                        Ok(Some(item)) => yield item?,
                        Ok(None) => break,
                        Err(_) => {
                            Err(FlowError::timeout(format!(
                                "no item arrived within {limit:?}"
                            ))
                            .with_flow("timeout"))?;
                        }
                    }
                }
            })
        },
    )
}
