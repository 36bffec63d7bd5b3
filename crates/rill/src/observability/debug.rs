//! Named conditional breakpoints over stream items. Breakpoints only
//! notify — there is no interactive pause; the hook decides what a break
//! means (log it, push it somewhere, flip a flag for a debugger UI).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;

use crate::flow::Flow;
use crate::stream::FlowStream;

/// Position information handed to break conditions and hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakContext {
    pub flow: String,
    pub item_index: usize,
}

type Condition = Arc<dyn Fn(&Value, &BreakContext) -> bool + Send + Sync>;
type Hook = Arc<dyn Fn(&str, &BreakContext, &Value) + Send + Sync>;

struct BreakInner {
    conditions: HashMap<String, Condition>,
    hook: Hook,
}

/// A set of named break conditions plus the notification hook they fire.
pub struct FlowBreakpoints {
    inner: Mutex<BreakInner>,
}

impl FlowBreakpoints {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakInner {
                conditions: HashMap::new(),
                hook: Arc::new(|name, context, item| {
                    tracing::warn!(
                        breakpoint = name,
                        flow = %context.flow,
                        index = context.item_index,
                        "breakpoint hit: {item}"
                    );
                }),
            }),
        }
    }

    /// Install or replace a named break condition.
    pub fn set<F>(&self, name: &str, condition: F)
    where
        F: Fn(&Value, &BreakContext) -> bool + Send + Sync + 'static,
    {
        self.lock().conditions.insert(name.to_string(), Arc::new(condition));
    }

    /// Remove a breakpoint; returns whether it existed.
    pub fn clear(&self, name: &str) -> bool {
        self.lock().conditions.remove(name).is_some()
    }

    /// Replace the notification hook.
    pub fn on_break<F>(&self, hook: F)
    where
        F: Fn(&str, &BreakContext, &Value) + Send + Sync + 'static,
    {
        self.lock().hook = Arc::new(hook);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().conditions.keys().cloned().collect();
        names.sort();
        names
    }

    fn evaluate(&self, item: &Value, context: &BreakContext) {
        let (matched, hook) = {
            let inner = self.lock();
            let matched: Vec<String> = inner
                .conditions
                .iter()
                .filter(|(_, condition)| condition(item, context))
                .map(|(name, _)| name.clone())
                .collect();
            (matched, inner.hook.clone())
        };
        for name in matched {
            hook(&name, context, item);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FlowBreakpoints {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Lazy<Arc<FlowBreakpoints>> = Lazy::new(|| Arc::new(FlowBreakpoints::new()));

/// The default process-wide breakpoint set.
pub fn global() -> Arc<FlowBreakpoints> {
    GLOBAL.clone()
}

/// Evaluate `breakpoints` against every item a flow yields. Items that fail
/// to serialize are skipped with a debug log rather than breaking the
/// stream.
pub fn watch<I, O>(flow: Flow<I, O>, breakpoints: Arc<FlowBreakpoints>) -> Flow<I, O>
where
    I: Send + 'static,
    O: Serialize + Send + 'static,
{
    use async_stream::try_stream;
    use futures::StreamExt;

    let flow_name = flow.name().to_string();
    let name = format!("watch({flow_name})");
    Flow::new(name, move |input: FlowStream<I>| {
        let breakpoints = breakpoints.clone();
        let flow_name = flow_name.clone();
        let mut out = flow.apply(input);
        let scope = out.scope().clone();
        FlowStream::new_in(scope, try_stream! {
            let mut index = 0usize;
            while let Some(item) = out.next().await {
                let item = item?;
                match serde_json::to_value(&item) {
                    Ok(value) => {
                        let context = BreakContext {
                            flow: flow_name.clone(),
                            item_index: index,
                        };
                        breakpoints.evaluate(&value, &context);
                    }
                    Err(e) => tracing::debug!("breakpoint item not serializable: {e}"),
                }
                index += 1;
                yield item;
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::basic::map;

    #[tokio::test]
    async fn test_breakpoint_fires_on_condition() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let breakpoints = Arc::new(FlowBreakpoints::new());
        breakpoints.set("negatives", |item, _context| {
            item.as_i64().map(|v| v < 0).unwrap_or(false)
        });
        let sink = hits.clone();
        breakpoints.on_break(move |name, context, item| {
            sink.lock()
                .unwrap()
                .push((name.to_string(), context.item_index, item.clone()));
        });

        let flow = watch(map(|x: i32| -x).named("negate"), breakpoints.clone());
        let out = flow
            .to_list(FlowStream::from_iter(vec![1, -2, 3]))
            .await
            .unwrap();
        assert_eq!(out, vec![-1, 2, -3]);

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "negatives");
        assert_eq!(hits[0].1, 0);
        assert_eq!(hits[1].1, 2);
    }

    #[tokio::test]
    async fn test_clear_and_names() {
        let breakpoints = FlowBreakpoints::new();
        breakpoints.set("a", |_, _| true);
        breakpoints.set("b", |_, _| false);
        assert_eq!(breakpoints.names(), vec!["a", "b"]);
        assert!(breakpoints.clear("a"));
        assert!(!breakpoints.clear("a"));
        assert_eq!(breakpoints.names(), vec!["b"]);
    }
}
