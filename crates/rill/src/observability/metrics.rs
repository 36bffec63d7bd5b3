//! Per-flow execution metrics: counters collected while a flow runs, kept
//! by a monitor that can summarise and export them as JSON.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::flow::Flow;
use crate::stream::FlowStream;

/// Metrics for one execution of a flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowMetrics {
    pub flow: String,
    pub started_at: DateTime<Utc>,
    pub items_processed: u64,
    pub items_yielded: u64,
    pub error_count: u64,
    /// Set when the execution finishes.
    pub duration_ms: Option<f64>,
    #[serde(skip)]
    started: Instant,
}

impl FlowMetrics {
    fn new(flow: &str) -> Self {
        Self {
            flow: flow.to_string(),
            started_at: Utc::now(),
            items_processed: 0,
            items_yielded: 0,
            error_count: 0,
            duration_ms: None,
            started: Instant::now(),
        }
    }

    /// Duration so far, or the final duration once finished.
    pub fn elapsed_ms(&self) -> f64 {
        self.duration_ms
            .unwrap_or_else(|| self.started.elapsed().as_secs_f64() * 1000.0)
    }

    /// Items processed per second over the execution.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed_ms() / 1000.0;
        if secs == 0.0 {
            0.0
        } else {
            self.items_processed as f64 / secs
        }
    }

    /// Ratio of items yielded to items processed.
    pub fn yield_rate(&self) -> f64 {
        if self.items_processed == 0 {
            0.0
        } else {
            self.items_yielded as f64 / self.items_processed as f64
        }
    }
}

/// Aggregate over the finished executions of one flow.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FlowSummary {
    pub runs: u64,
    pub total_items: u64,
    pub total_errors: u64,
    pub avg_duration_ms: f64,
}

#[derive(Default)]
struct MonitorInner {
    active: HashMap<String, FlowMetrics>,
    completed: Vec<FlowMetrics>,
}

/// Collects [`FlowMetrics`] across executions. Prefer an injected instance;
/// [`global`] is the quick-start singleton.
#[derive(Default)]
pub struct PerformanceMonitor {
    inner: Mutex<MonitorInner>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new execution record, returning its id.
    pub fn start(&self, flow: &str) -> String {
        let id = format!("{flow}-{}", uuid::Uuid::new_v4());
        self.lock().active.insert(id.clone(), FlowMetrics::new(flow));
        id
    }

    pub fn record_item_processed(&self, id: &str) {
        if let Some(metrics) = self.lock().active.get_mut(id) {
            metrics.items_processed += 1;
        }
    }

    pub fn record_item_yielded(&self, id: &str) {
        if let Some(metrics) = self.lock().active.get_mut(id) {
            metrics.items_yielded += 1;
        }
    }

    pub fn record_error(&self, id: &str) {
        if let Some(metrics) = self.lock().active.get_mut(id) {
            metrics.error_count += 1;
        }
    }

    /// Close an execution record and return the final metrics.
    pub fn finish(&self, id: &str) -> Option<FlowMetrics> {
        let mut inner = self.lock();
        let mut metrics = inner.active.remove(id)?;
        metrics.duration_ms = Some(metrics.started.elapsed().as_secs_f64() * 1000.0);
        inner.completed.push(metrics.clone());
        Some(metrics)
    }

    /// Aggregates per flow name over finished executions.
    pub fn summary(&self) -> HashMap<String, FlowSummary> {
        let inner = self.lock();
        let mut summary: HashMap<String, FlowSummary> = HashMap::new();
        for metrics in &inner.completed {
            let entry = summary.entry(metrics.flow.clone()).or_insert(FlowSummary {
                runs: 0,
                total_items: 0,
                total_errors: 0,
                avg_duration_ms: 0.0,
            });
            // Incremental mean keeps a single pass over the records.
            entry.avg_duration_ms = (entry.avg_duration_ms * entry.runs as f64
                + metrics.duration_ms.unwrap_or(0.0))
                / (entry.runs + 1) as f64;
            entry.runs += 1;
            entry.total_items += metrics.items_processed;
            entry.total_errors += metrics.error_count;
        }
        summary
    }

    /// Snapshot of every record, finished and active, as JSON.
    pub fn export_json(&self) -> Value {
        let inner = self.lock();
        serde_json::json!({
            "completed": inner.completed,
            "active": inner.active.values().collect::<Vec<_>>(),
        })
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.active.clear();
        inner.completed.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

static GLOBAL: Lazy<Arc<PerformanceMonitor>> = Lazy::new(|| Arc::new(PerformanceMonitor::new()));

/// The default process-wide monitor.
pub fn global() -> Arc<PerformanceMonitor> {
    GLOBAL.clone()
}

/// Wire a flow's executions into `monitor`: each application opens a record,
/// counts items in and out plus errors, and closes the record when the
/// stream ends either way.
pub fn instrument<I, O>(flow: Flow<I, O>, monitor: Arc<PerformanceMonitor>) -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    use async_stream::try_stream;
    use futures::StreamExt;

    let flow_name = flow.name().to_string();
    let name = format!("monitored({flow_name})");
    Flow::new(name, move |mut input: FlowStream<I>| {
        let id = monitor.start(&flow_name);
        let scope = input.scope().clone();

        let monitor_in = monitor.clone();
        let id_in = id.clone();
        let counted: FlowStream<I> = FlowStream::new_in(scope.clone(), try_stream! {
            while let Some(item) = input.next().await {
                let item = item?;
                monitor_in.record_item_processed(&id_in);
                yield item;
            }
        });

        let mut out = flow.apply(counted);
        let monitor = monitor.clone();
        FlowStream::new_in(scope, try_stream! {
            loop {
                match out.next().await {
                    Some(Ok(item)) => {
                        monitor.record_item_yielded(&id);
                        yield item;
                    }
                    Some(Err(e)) => {
                        monitor.record_error(&id);
                        monitor.finish(&id);
                        Err(e)?;
                    }
                    None => break,
                }
            }
            monitor.finish(&id);
        })
    })
}
