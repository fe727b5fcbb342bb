//! Host-implemented builtins.
//!
//! A policy module refers to builtins by numeric id; the module's `builtins`
//! export maps names to ids. Handlers are registered here by name and resolved
//! per instance, so the same table serves any module.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// A builtin implementation: JSON arguments in, JSON result out.
pub type BuiltinHandler = Arc<dyn Fn(&[Value]) -> Result<Value, BuiltinError> + Send + Sync>;

/// Builtin failures. The guest sees the not-implemented sentinel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuiltinError {
    /// Wrong number of arguments.
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },

    /// An argument had the wrong type or value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handler could not produce a result.
    #[error("{0}")]
    Failed(String),
}

/// Builtin handlers by name.
#[derive(Clone, Default)]
pub struct BuiltinTable {
    handlers: HashMap<String, BuiltinHandler>,
}

impl BuiltinTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with `trace` and `time.now_ns` registered.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register("trace", trace);
        table.register("time.now_ns", now_ns);
        table
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value, BuiltinError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Handler registered under `name`.
    pub fn get(&self, name: &str) -> Option<&BuiltinHandler> {
        self.handlers.get(name)
    }

    /// Returns `true` if `name` has a handler.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for BuiltinTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinTable")
            .field("names", &self.names())
            .finish()
    }
}

fn trace(args: &[Value]) -> Result<Value, BuiltinError> {
    let [Value::String(note)] = args else {
        return Err(match args.len() {
            1 => BuiltinError::InvalidArgument("trace note must be a string".into()),
            got => BuiltinError::Arity { expected: 1, got },
        });
    };
    info!(builtin = "trace", "{}", note);
    Ok(Value::Bool(true))
}

fn now_ns(args: &[Value]) -> Result<Value, BuiltinError> {
    if !args.is_empty() {
        return Err(BuiltinError::Arity {
            expected: 0,
            got: args.len(),
        });
    }
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BuiltinError::Failed(e.to_string()))?;
    let nanos = u64::try_from(elapsed.as_nanos())
        .map_err(|_| BuiltinError::Failed("clock out of range".into()))?;
    Ok(Value::from(nanos))
}
