//! Observability infrastructure around the hook signatures the combinators
//! expose: a performance monitor for per-flow metrics and a breakpoint set
//! for item-level notifications. Both come as injectable instances with a
//! process-wide default.

pub mod debug;
pub mod metrics;

pub use debug::{watch, BreakContext, FlowBreakpoints};
pub use metrics::{instrument, FlowMetrics, FlowSummary, PerformanceMonitor};
