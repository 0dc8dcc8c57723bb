//! Globals marshaling for the sandbox.
//!
//! The host builds a tree of values and functions to inject into the
//! snippet's global scope. Functions cannot cross into the isolate, so the
//! marshaler registers each one under its dotted path in a
//! [`FunctionRegistry`] and substitutes a `{"__fnToken": path}` sentinel in
//! the transmitted payload; the bootstrap script inside the isolate turns
//! sentinels back into proxy functions that call through the op bridge.
//!
//! The tree is owned, so cyclic graphs are unrepresentable; the marshal
//! step never needs cycle detection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Value, json};

/// Sentinel key recognized by the bootstrap script.
pub const FN_TOKEN_KEY: &str = "__fnToken";

type HostFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// An async host function callable from sandboxed code.
#[derive(Clone)]
pub struct HostFunction(Arc<HostFn>);

impl HostFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostFunction")
    }
}

/// One node of the injected globals tree.
#[derive(Debug, Clone)]
pub enum GlobalValue {
    /// Plain JSON, transmitted by value.
    Value(Value),
    Array(Vec<GlobalValue>),
    Object(BTreeMap<String, GlobalValue>),
    Function(HostFunction),
}

impl GlobalValue {
    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, GlobalValue)>,
        K: Into<String>,
    {
        Self::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        Self::Function(HostFunction::new(f))
    }
}

impl From<Value> for GlobalValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// The top-level globals mapping injected into a snippet.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    root: BTreeMap<String, GlobalValue>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: GlobalValue) -> &mut Self {
        self.root.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

/// Registry of host functions keyed by their dotted path.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, HostFunction>,
}

impl FunctionRegistry {
    pub fn get(&self, fn_id: &str) -> Option<HostFunction> {
        self.functions.get(fn_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Walk the globals tree, registering functions and producing the JSON
/// payload with sentinels in their place.
pub fn marshal(globals: &Globals) -> (Value, FunctionRegistry) {
    let mut registry = FunctionRegistry::default();
    let mut payload = serde_json::Map::new();
    for (name, value) in &globals.root {
        payload.insert(name.clone(), marshal_value(value, name, &mut registry));
    }
    (Value::Object(payload), registry)
}

fn marshal_value(value: &GlobalValue, path: &str, registry: &mut FunctionRegistry) -> Value {
    match value {
        GlobalValue::Value(v) => v.clone(),
        GlobalValue::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| marshal_value(item, &format!("{path}.{i}"), registry))
                .collect(),
        ),
        GlobalValue::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, child)| {
                    (
                        key.clone(),
                        marshal_value(child, &format!("{path}.{key}"), registry),
                    )
                })
                .collect(),
        ),
        GlobalValue::Function(f) => {
            registry.functions.insert(path.to_string(), f.clone());
            json!({ FN_TOKEN_KEY: path })
        }
    }
}
