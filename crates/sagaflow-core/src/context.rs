//! Shared workflow context with versioned key-value storage.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use uuid::Uuid;

/// Reserved context keys written by the engine.
///
/// User code may read these freely but should treat their values as opaque.
pub mod keys {
    /// Unique identifier of the context, equal to [`WorkflowContext::context_id`](super::WorkflowContext::context_id).
    pub const WORKFLOW_ID: &str = "workflow_id";
    /// Identifier of a single execution, refreshed by `reset`.
    pub const EXECUTION_ID: &str = "execution_id";
    /// Human-readable workflow name.
    pub const WORKFLOW_NAME: &str = "workflow_name";
    /// Result of the most recent step that produced a non-null value.
    pub const LAST_RESULT: &str = "last_result";
    /// Result of the last non-null step; returned by `execute`.
    pub const FINAL_RESULT: &str = "final_result";
    /// Prefix for per-step result keys derived from sanitised step names.
    pub const STEP_RESULT_PREFIX: &str = "step_result_";
    /// Current element of a for-each combinator.
    pub const CURRENT_ITEM: &str = "current_item";
    /// Index of the current for-each element.
    pub const ITEM_INDEX: &str = "item_index";
    /// Failure message of a failed execution.
    pub const ERROR_CONTEXT: &str = "error_context";
    /// RFC 3339 timestamp of context creation.
    pub const START_TIME: &str = "start_time";
    /// Reserved for metrics payloads.
    pub const METRICS_DATA: &str = "metrics_data";
}

/// Shared state for a single workflow execution.
///
/// The context is a concurrency-safe string-to-[`Value`] map with an
/// append-only execution trace, a version counter that increases on every
/// data mutation, and per-step bookkeeping (results, errors, executed ids).
/// It is shared behind an [`Arc`](std::sync::Arc) between the engine, step
/// actions and parallel branches; internal synchronisation serialises
/// concurrent mutation, but callers must not assume read-modify-write
/// atomicity across branches.
///
/// # Examples
///
/// ```
/// use sagaflow_core::WorkflowContext;
/// use serde_json::json;
///
/// let ctx = WorkflowContext::new();
/// ctx.put("user_id", 123);
/// ctx.put("name", "Alice");
///
/// assert_eq!(ctx.get("user_id"), Some(json!(123)));
/// assert_eq!(ctx.get_or("missing", json!("default")), json!("default"));
/// ```
pub struct WorkflowContext {
    data: RwLock<HashMap<String, Value>>,
    trace: Mutex<Vec<String>>,
    version: AtomicU64,
    step_results: RwLock<HashMap<String, Value>>,
    step_errors: RwLock<HashMap<String, String>>,
    executed_step_ids: RwLock<HashSet<String>>,
    context_id: String,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("context_id", &self.context_id)
            .field("version", &self.version.load(Ordering::SeqCst))
            .field("keys", &self.keys())
            .finish()
    }
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowContext {
    /// Creates a new context seeded with its own id and start time.
    pub fn new() -> Self {
        let context_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let mut data = HashMap::new();
        data.insert(keys::WORKFLOW_ID.to_string(), Value::String(context_id.clone()));
        data.insert(
            keys::START_TIME.to_string(),
            Value::String(created_at.to_rfc3339()),
        );
        Self {
            data: RwLock::new(data),
            trace: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            step_results: RwLock::new(HashMap::new()),
            step_errors: RwLock::new(HashMap::new()),
            executed_step_ids: RwLock::new(HashSet::new()),
            context_id,
            created_at,
        }
    }

    /// Creates a context pre-populated with the given entries.
    pub fn with_initial(initial: HashMap<String, Value>) -> Self {
        let ctx = Self::new();
        ctx.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(initial);
        ctx
    }

    /// Returns a clone of the value for the given key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns the value for the given key, or `default` if absent.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Stores a value, replacing any previous entry and bumping the version.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes a value and bumps the version.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.version.fetch_add(1, Ordering::SeqCst);
        removed
    }

    /// Returns `true` if the context contains the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Returns all keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Removes all data, trace entries and step bookkeeping.
    pub fn clear(&self) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.step_results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.step_errors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.executed_step_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Appends a timestamped message to the execution trace.
    pub fn trace(&self, message: impl Into<String>) {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), message.into()));
    }

    /// Returns a copy of the execution trace.
    pub fn get_trace(&self) -> Vec<String> {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns a deep copy of the data map, decoupled from later mutation.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the unique context identifier.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Returns the context creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the current version. Strictly increases across mutations.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Records a successful step result and marks the step as executed.
    pub fn record_step_result(&self, step_id: &str, result: Value) {
        self.step_results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step_id.to_string(), result);
        self.executed_step_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step_id.to_string());
    }

    /// Records the last error message produced by a step.
    pub fn record_step_error(&self, step_id: &str, error: impl fmt::Display) {
        self.step_errors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step_id.to_string(), error.to_string());
    }

    /// Returns the recorded result for a step id.
    pub fn step_result(&self, step_id: &str) -> Option<Value> {
        self.step_results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_id)
            .cloned()
    }

    /// Returns the recorded error message for a step id.
    pub fn step_error(&self, step_id: &str) -> Option<String> {
        self.step_errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_id)
            .cloned()
    }

    /// Returns `true` if a result was recorded for the step id.
    pub fn is_step_executed(&self, step_id: &str) -> bool {
        self.executed_step_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(step_id)
    }

    /// Returns the ids of all executed steps.
    pub fn executed_step_ids(&self) -> HashSet<String> {
        self.executed_step_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns all recorded step results keyed by step id.
    pub fn all_step_results(&self) -> HashMap<String, Value> {
        self.step_results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
