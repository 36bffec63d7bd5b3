//! Source flows: they ignore their input stream and produce values from
//! internal state.

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::stream::FlowStream;

/// Yield the arithmetic progression from `start` towards `stop` by `step`.
/// A negative step counts down. A zero step is a configuration error.
pub fn range<I: Send + 'static>(start: i64, stop: i64, step: i64) -> Result<Flow<I, i64>, FlowError> {
    if step == 0 {
        return Err(FlowError::configuration("range step must be non-zero").with_flow("range"));
    }
    Ok(Flow::new(
        format!("range({start}, {stop}, {step})"),
        move |input: FlowStream<I>| {
            let scope = input.scope().clone();
            drop(input);
            FlowStream::new_in(scope, try_stream! {
                let mut current = start;
                while (step > 0 && current < stop) || (step < 0 && current > stop) {
                    yield current;
                    current += step;
                }
            })
        },
    ))
}

/// Yield `value` exactly `times` times, or forever when `times` is `None`.
pub fn repeat<I, T>(value: T, times: Option<u64>) -> Flow<I, T>
where
    I: Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    let name = match times {
        Some(n) => format!("repeat({n})"),
        None => "repeat(∞)".to_string(),
    };
    Flow::new(name, move |input: FlowStream<I>| {
        let value = value.clone();
        let scope = input.scope().clone();
        drop(input);
        FlowStream::new_in(scope, try_stream! {
            match times {
                Some(n) => {
                    for _ in 0..n {
                        yield value.clone();
                    }
                }
                None => loop {
                    yield value.clone();
                },
            }
        })
    })
}

/// Yield nothing.
pub fn empty<I, O>() -> Flow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    Flow::new("empty", |input: FlowStream<I>| {
        let scope = input.scope().clone();
        drop(input);
        FlowStream::new_in(scope, futures::stream::empty())
    })
}

/// Prepend literal items before forwarding the input stream.
pub fn start_with<T>(items: Vec<T>) -> Flow<T, T>
where
    T: Clone + Send + Sync + 'static,
{
    let name = format!("start_with({} items)", items.len());
    Flow::new(name, move |mut input: FlowStream<T>| {
        let items = items.clone();
        let scope = input.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            for item in items {
                yield item;
            }
            while let Some(item) = input.next().await {
                yield item?;
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::basic::take;

    #[tokio::test]
    async fn test_range_ascending() {
        let flow = range::<()>(0, 5, 1).unwrap();
        let out = flow.to_list(FlowStream::once(())).await.unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_range_descending_and_stepped() {
        let flow = range::<()>(10, 0, -3).unwrap();
        let out = flow.to_list(FlowStream::once(())).await.unwrap();
        assert_eq!(out, vec![10, 7, 4, 1]);
    }

    #[tokio::test]
    async fn test_range_zero_step_is_configuration_error() {
        assert_eq!(range::<()>(0, 5, 0).unwrap_err().kind(), "configuration");
    }

    #[tokio::test]
    async fn test_repeat_finite() {
        let flow = repeat::<(), _>("x", Some(3));
        let out = flow.to_list(FlowStream::once(())).await.unwrap();
        assert_eq!(out, vec!["x", "x", "x"]);
    }

    #[tokio::test]
    async fn test_repeat_forever_with_take() {
        let flow = repeat::<(), _>(7, None).pipe(take(4));
        let out = flow.to_list(FlowStream::once(())).await.unwrap();
        assert_eq!(out, vec![7, 7, 7, 7]);
    }

    #[tokio::test]
    async fn test_empty_yields_nothing() {
        let flow = empty::<(), i32>();
        let out = flow.to_list(FlowStream::once(())).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_start_with_prepends() {
        let flow = start_with(vec![0, 1]);
        let out = flow
            .to_list(FlowStream::from_iter(vec![2, 3]))
            .await
            .unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
    }
}
