//! Process-wide registry of named flows for discovery and reuse.
//!
//! Entries are metadata: registering a flow never affects its execution.
//! Flows are stored type-erased and recovered by downcasting, so `get` asks
//! for the item types back and returns `None` on a type mismatch as well as
//! on an unknown name. Prefer an injected [`FlowRegistry`] instance; the
//! [`global`] singleton exists for quick-start use.

use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;

use crate::flow::Flow;

struct Entry {
    flow: Box<dyn Any + Send + Sync>,
    flow_name: String,
    metadata: HashMap<String, Value>,
}

/// Serializable summary of a registered flow.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FlowInfo {
    pub name: String,
    pub flow_name: String,
    pub metadata: HashMap<String, Value>,
    pub categories: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    flows: HashMap<String, Entry>,
    categories: HashMap<String, Vec<String>>,
}

/// Named flows, optionally grouped by category.
#[derive(Default)]
pub struct FlowRegistry {
    inner: RwLock<RegistryInner>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the flow registered under `name`.
    pub fn register<I, O>(&self, name: &str, flow: Flow<I, O>, category: Option<&str>)
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let mut inner = self.write();
        inner.flows.insert(
            name.to_string(),
            Entry {
                flow_name: flow.name().to_string(),
                metadata: flow.metadata().clone(),
                flow: Box::new(flow),
            },
        );
        if let Some(category) = category {
            let names = inner.categories.entry(category.to_string()).or_default();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    /// Look up a flow by name. Absent names and type mismatches both yield
    /// `None`.
    pub fn get<I, O>(&self, name: &str) -> Option<Flow<I, O>>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let inner = self.read();
        inner
            .flows
            .get(name)
            .and_then(|entry| entry.flow.downcast_ref::<Flow<I, O>>())
            .cloned()
    }

    /// Case-insensitive substring search over registered names, flow names
    /// and metadata values.
    pub fn search(&self, query: &str) -> Vec<String> {
        let query = query.to_lowercase();
        let inner = self.read();
        let mut matches: Vec<String> = inner
            .flows
            .iter()
            .filter(|(name, entry)| {
                name.to_lowercase().contains(&query)
                    || entry.flow_name.to_lowercase().contains(&query)
                    || entry.metadata.iter().any(|(key, value)| {
                        key.to_lowercase().contains(&query)
                            || value.to_string().to_lowercase().contains(&query)
                    })
            })
            .map(|(name, _)| name.clone())
            .collect();
        matches.sort();
        matches
    }

    /// Registered names, optionally restricted to one category.
    pub fn list(&self, category: Option<&str>) -> Vec<String> {
        let inner = self.read();
        match category {
            Some(category) => inner.categories.get(category).cloned().unwrap_or_default(),
            None => {
                let mut names: Vec<String> = inner.flows.keys().cloned().collect();
                names.sort();
                names
            }
        }
    }

    pub fn categories(&self) -> Vec<String> {
        let inner = self.read();
        let mut categories: Vec<String> = inner.categories.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Drop a flow from the registry and every category index. Returns
    /// whether the name was present.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.write();
        let removed = inner.flows.remove(name).is_some();
        if removed {
            for names in inner.categories.values_mut() {
                names.retain(|n| n != name);
            }
        }
        removed
    }

    /// Clear one category (and its flows), or everything.
    pub fn clear(&self, category: Option<&str>) {
        let mut inner = self.write();
        match category {
            Some(category) => {
                if let Some(names) = inner.categories.remove(category) {
                    for name in names {
                        inner.flows.remove(&name);
                    }
                }
            }
            None => {
                inner.flows.clear();
                inner.categories.clear();
            }
        }
    }

    /// Summary of one registered flow, or `None` if absent.
    pub fn info(&self, name: &str) -> Option<FlowInfo> {
        let inner = self.read();
        let entry = inner.flows.get(name)?;
        let categories = inner
            .categories
            .iter()
            .filter(|(_, names)| names.iter().any(|n| n == name))
            .map(|(category, _)| category.clone())
            .collect();
        Some(FlowInfo {
            name: name.to_string(),
            flow_name: entry.flow_name.clone(),
            metadata: entry.metadata.clone(),
            categories,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

static GLOBAL: Lazy<FlowRegistry> = Lazy::new(FlowRegistry::new);

/// The default process-wide registry.
pub fn global() -> &'static FlowRegistry {
    &GLOBAL
}
