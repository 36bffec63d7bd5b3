//! The operator library, grouped by category. Everything here is a free
//! function that returns a [`Flow`](crate::flow::Flow); flows close over
//! their configuration and do no work until applied to a stream.

pub mod advanced;
pub mod aggregation;
pub mod basic;
pub mod control;
pub mod observability;
pub mod sources;
pub mod temporal;

pub use advanced::{
    chain_streams, combine_latest, flat_map_with_context, merge, merge_async_generators,
    merge_flows, parallel, parallel_successful, race, zip,
};
pub use aggregation::{
    batch, buffer, chunk, distinct, distinct_by, expand, finalize, finalize_async, group_by,
    memoize, pairwise, scan, window,
};
pub use basic::{
    collect, compose, filter, flat_map, flatten, guard, identity, map, run_fold, share, skip,
    take, until,
};
pub use control::{
    branch, catch_and_continue, catch_and_continue_with, chain_flows, circuit_breaker, if_then,
    recover, retry, switch, tap, tap_async, then, then_async, while_condition,
};
pub use observability::{
    inspect, log, materialize, metrics, trace, InspectContext, Notification, TraceEvent,
};
pub use sources::{empty, range, repeat, start_with};
pub use temporal::{debounce, delay, sample, throttle, timeout, DebounceMode};
