//! Cooperative runtime plumbing shared by the combinators.
//!
//! The engine leans on tokio for scheduling: timed waits are
//! `tokio::time::timeout`, sleeps are `tokio::time::sleep`, monotonic time is
//! `tokio::time::Instant` (so the paused test clock governs every temporal
//! operator), fan-in queues are bounded `tokio::sync::mpsc` channels, and
//! "first of many" waits are `futures::stream::FuturesUnordered`. What this
//! module adds is the cancellation scope every stream carries: a
//! [`CancellationToken`] plus a [`TaskTracker`] so that closing a stream can
//! cancel its background work and wait for it to settle.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::FlowError;

/// Capacity of the bounded fan-in channels used by the merge combinators.
/// Producers block (cooperatively) once the consumer falls this far behind.
pub(crate) const FAN_IN_CAPACITY: usize = 16;

/// Cancellation scope of one pipeline application.
///
/// Operators propagate the scope from their input stream to their output
/// stream and spawn background work through it. Closing the outermost stream
/// cancels the token and waits on the tracker, so no background task outlives
/// the stream that spawned it.
#[derive(Debug, Clone)]
pub struct StreamScope {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl StreamScope {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Spawn a background task under this scope. The task is woken with a
    /// cancellation signal when the scope shuts down, and the returned handle
    /// aborts it if dropped first.
    pub fn spawn<F>(&self, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fut => {}
            }
        });
        TaskHandle {
            handle: Some(handle),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every tracked task to settle. Tasks are expected to have
    /// been cancelled already, either through the token or by aborting
    /// their handles.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Cancel the scope and wait for every tracked task to settle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.settle().await;
    }
}

impl Default for StreamScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Abort-on-drop handle to a background task spawned through a scope.
pub struct TaskHandle {
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Wait for the task to finish. A panic inside the task surfaces as an
    /// execution error rather than unwinding into the consumer.
    pub async fn join(mut self) -> Result<(), FlowError> {
        let handle = self.handle.take();
        match handle {
            Some(h) => h.await.map_err(join_failure),
            None => Ok(()),
        }
    }

    /// Request cancellation and wait for the task to settle. Cancellation of
    /// an already-finished task is a no-op; the cancellation outcome itself
    /// never surfaces to the caller.
    pub async fn cancel(mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
            match h.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::debug!("background task ended abnormally: {e}"),
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(h) = &self.handle {
            h.abort();
        }
    }
}

fn join_failure(e: tokio::task::JoinError) -> FlowError {
    if e.is_panic() {
        FlowError::execution(format!("background task panicked: {e}"))
    } else {
        FlowError::execution("background task was cancelled".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_cancels_and_settles() {
        let scope = StreamScope::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let _handle = scope.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });
        scope.shutdown().await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_silent() {
        let scope = StreamScope::new();
        let handle = scope.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        scope.cancel();
        scope.cancel();
        handle.cancel().await;
    }

    #[tokio::test]
    async fn test_join_completed_task() {
        let scope = StreamScope::new();
        let handle = scope.spawn(async {});
        assert!(handle.join().await.is_ok());
    }
}
