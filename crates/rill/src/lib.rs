//! rill — a functional reactive stream-processing engine.
//!
//! Pipelines are built by composing [`Flow`] values: small, reusable,
//! immutable stream transformations. Execution is pull-driven and
//! cooperatively concurrent on tokio; nothing runs until a flow is applied
//! to a [`FlowStream`] and the result is drained.
//!
//! ```
//! use rill::combinators::{filter, map, range};
//! use rill::FlowStream;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pipeline = range::<()>(0, 5, 1).unwrap() >> map(|x| x * 2) >> filter(|x: &i64| x % 4 == 0);
//! let out = pipeline.to_list(FlowStream::once(())).await.unwrap();
//! assert_eq!(out, vec![0, 4, 8]);
//! # }
//! ```

pub mod combinators;
pub mod error;
pub mod flow;
pub mod observability;
pub mod registry;
pub mod runtime;
pub mod stream;

pub use combinators::{InspectContext, Notification, TraceEvent};
pub use error::FlowError;
pub use flow::{Emitter, Flow};
pub use runtime::{StreamScope, TaskHandle};
pub use stream::FlowStream;
