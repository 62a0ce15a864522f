//! Immutable step descriptors for the workflow queue.

use crate::context::WorkflowContext;
use crate::error::StepError;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default configuration values for steps and compensation.
pub mod defaults {
    use std::time::Duration;

    /// Retries applied to a step action after its first failed attempt.
    pub const MAX_RETRIES: u32 = 3;
    /// Sleep between retry attempts.
    pub const RETRY_DELAY: Duration = Duration::from_millis(1000);
    /// Upper bound on a single async step attempt.
    pub const STEP_TIMEOUT: Duration = Duration::from_secs(300);
    /// Upper bound on awaiting all async compensations of a sweep.
    pub const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(60);
    /// Retries applied to a compensation after its first failed attempt.
    pub const MAX_COMPENSATION_RETRIES: u32 = 1;
}

/// Synchronous step action.
pub type SyncAction = Arc<dyn Fn() -> Result<Value, StepError> + Send + Sync>;
/// Synchronous compensation, receiving the step's recorded result.
pub type SyncCompensation = Arc<dyn Fn(Value) -> Result<(), StepError> + Send + Sync>;
/// Asynchronous step action, given shared access to the context.
pub type AsyncAction =
    Arc<dyn Fn(Arc<WorkflowContext>) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;
/// Asynchronous compensation, receiving the step's recorded result.
pub type AsyncCompensation =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

fn normalize_timeout(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// A synchronous workflow step.
///
/// Immutable after build. The action runs on the calling task; typed
/// results are converted to [`Value`] through [`Serialize`], so a
/// unit-returning action yields [`Value::Null`] and is not recorded as a
/// step result.
///
/// # Examples
///
/// ```
/// use sagaflow_core::SyncStep;
/// use std::time::Duration;
///
/// let step = SyncStep::builder("Persist user", || Ok("user-42"))
///     .compensation(|user| {
///         println!("deleting {user}");
///         Ok(())
///     })
///     .max_retries(2)
///     .retry_delay(Duration::from_millis(50))
///     .critical()
///     .build();
///
/// assert_eq!(step.name(), "Persist user");
/// assert!(step.is_critical());
/// ```
#[derive(Clone)]
pub struct SyncStep {
    id: String,
    name: String,
    action: SyncAction,
    compensation: Option<SyncCompensation>,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Option<Duration>,
    critical: bool,
    idempotent: bool,
    metadata: HashMap<String, Value>,
}

impl SyncStep {
    /// Creates a builder for a synchronous step.
    pub fn builder<F, T>(name: impl Into<String>, action: F) -> SyncStepBuilder
    where
        F: Fn() -> Result<T, StepError> + Send + Sync + 'static,
        T: Serialize,
    {
        let action: SyncAction =
            Arc::new(move || action().and_then(|v| serde_json::to_value(v).map_err(Into::into)));
        SyncStepBuilder {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            action,
            compensation: None,
            max_retries: defaults::MAX_RETRIES,
            retry_delay: defaults::RETRY_DELAY,
            timeout: Some(defaults::STEP_TIMEOUT),
            critical: false,
            idempotent: false,
            metadata: HashMap::new(),
        }
    }

    /// Returns the step identifier, unique within a workflow instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the human-readable step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the step action.
    pub fn action(&self) -> &SyncAction {
        &self.action
    }

    /// Returns the compensation, if one was declared.
    pub fn compensation(&self) -> Option<&SyncCompensation> {
        self.compensation.as_ref()
    }

    /// Returns the maximum retry count.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the sleep between retry attempts.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Returns the per-step timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns `true` if a failure of this step aborts the workflow
    /// immediately, regardless of retries.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Returns `true` if the step may be skipped by an idempotency checker.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Returns the free-form metadata attached at build time.
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }
}

impl fmt::Debug for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("critical", &self.critical)
            .field("idempotent", &self.idempotent)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

/// Builder for [`SyncStep`].
pub struct SyncStepBuilder {
    id: String,
    name: String,
    action: SyncAction,
    compensation: Option<SyncCompensation>,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Option<Duration>,
    critical: bool,
    idempotent: bool,
    metadata: HashMap<String, Value>,
}

impl SyncStepBuilder {
    /// Overrides the generated step identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Declares a compensation invoked with the step's recorded result
    /// when the workflow rolls back.
    pub fn compensation<C>(mut self, compensation: C) -> Self
    where
        C: Fn(Value) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.compensation = Some(Arc::new(compensation));
        self
    }

    /// Sets the maximum retry count.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the sleep between retry attempts. Zero disables sleeping.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the per-step timeout. Zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = normalize_timeout(timeout);
        self
    }

    /// Marks the step critical: its failure aborts immediately.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Marks the step idempotent: a positive checker response skips it.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Attaches a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds the immutable step.
    pub fn build(self) -> SyncStep {
        SyncStep {
            id: self.id,
            name: self.name,
            action: self.action,
            compensation: self.compensation,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            critical: self.critical,
            idempotent: self.idempotent,
            metadata: self.metadata,
        }
    }
}

/// An asynchronous workflow step.
///
/// Same shape as [`SyncStep`], but the action receives shared context
/// access and returns a future; the engine awaits each attempt, bounded by
/// the step timeout.
#[derive(Clone)]
pub struct AsyncStep {
    id: String,
    name: String,
    action: AsyncAction,
    compensation: Option<AsyncCompensation>,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Option<Duration>,
    critical: bool,
    idempotent: bool,
    metadata: HashMap<String, Value>,
}

impl AsyncStep {
    /// Creates a builder for an asynchronous step.
    pub fn builder<F, Fut, T>(name: impl Into<String>, action: F) -> AsyncStepBuilder
    where
        F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
        T: Serialize,
    {
        let action: AsyncAction = Arc::new(
            move |ctx| -> BoxFuture<'static, Result<Value, StepError>> {
                let fut = action(ctx);
                Box::pin(async move {
                    fut.await
                        .and_then(|v| serde_json::to_value(v).map_err(Into::into))
                })
            },
        );
        AsyncStepBuilder {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            action,
            compensation: None,
            max_retries: defaults::MAX_RETRIES,
            retry_delay: defaults::RETRY_DELAY,
            timeout: Some(defaults::STEP_TIMEOUT),
            critical: false,
            idempotent: false,
            metadata: HashMap::new(),
        }
    }

    /// Returns the step identifier, unique within a workflow instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the human-readable step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the step action.
    pub fn action(&self) -> &AsyncAction {
        &self.action
    }

    /// Returns the compensation, if one was declared.
    pub fn compensation(&self) -> Option<&AsyncCompensation> {
        self.compensation.as_ref()
    }

    /// Returns the maximum retry count.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the sleep between retry attempts.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Returns the per-attempt timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns `true` if a failure of this step aborts the workflow
    /// immediately, regardless of retries.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Returns `true` if the step may be skipped by an idempotency checker.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Returns the free-form metadata attached at build time.
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }
}

impl fmt::Debug for AsyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .field("idempotent", &self.idempotent)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

/// Builder for [`AsyncStep`].
pub struct AsyncStepBuilder {
    id: String,
    name: String,
    action: AsyncAction,
    compensation: Option<AsyncCompensation>,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Option<Duration>,
    critical: bool,
    idempotent: bool,
    metadata: HashMap<String, Value>,
}

impl AsyncStepBuilder {
    /// Overrides the generated step identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Declares an asynchronous compensation invoked with the step's
    /// recorded result when the workflow rolls back.
    pub fn compensation<C, Fut>(mut self, compensation: C) -> Self
    where
        C: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensation = Some(Arc::new(
            move |value| -> BoxFuture<'static, Result<(), StepError>> {
                Box::pin(compensation(value))
            },
        ));
        self
    }

    /// Sets the maximum retry count.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the sleep between retry attempts. Zero disables sleeping.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the per-attempt timeout. Zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = normalize_timeout(timeout);
        self
    }

    /// Marks the step critical: its failure aborts immediately.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Marks the step idempotent: a positive checker response skips it.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Attaches a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds the immutable step.
    pub fn build(self) -> AsyncStep {
        AsyncStep {
            id: self.id,
            name: self.name,
            action: self.action,
            compensation: self.compensation,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            critical: self.critical,
            idempotent: self.idempotent,
            metadata: self.metadata,
        }
    }
}

/// A queued step: synchronous or asynchronous.
///
/// The runner visits this tagged union; no dynamic type dispatch is
/// involved in telling the two kinds apart.
#[derive(Clone, Debug)]
pub enum WorkflowStep {
    /// A step whose action runs on the calling task.
    Sync(SyncStep),
    /// A step whose action yields a future awaited by the engine.
    Async(AsyncStep),
}

impl WorkflowStep {
    /// Returns the step identifier.
    pub fn id(&self) -> &str {
        match self {
            WorkflowStep::Sync(s) => s.id(),
            WorkflowStep::Async(a) => a.id(),
        }
    }

    /// Returns the step name.
    pub fn name(&self) -> &str {
        match self {
            WorkflowStep::Sync(s) => s.name(),
            WorkflowStep::Async(a) => a.name(),
        }
    }

    /// Returns the maximum retry count.
    pub fn max_retries(&self) -> u32 {
        match self {
            WorkflowStep::Sync(s) => s.max_retries(),
            WorkflowStep::Async(a) => a.max_retries(),
        }
    }

    /// Returns the sleep between retry attempts.
    pub fn retry_delay(&self) -> Duration {
        match self {
            WorkflowStep::Sync(s) => s.retry_delay(),
            WorkflowStep::Async(a) => a.retry_delay(),
        }
    }

    /// Returns the per-step timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            WorkflowStep::Sync(s) => s.timeout(),
            WorkflowStep::Async(a) => a.timeout(),
        }
    }

    /// Returns `true` for critical steps.
    pub fn is_critical(&self) -> bool {
        match self {
            WorkflowStep::Sync(s) => s.is_critical(),
            WorkflowStep::Async(a) => a.is_critical(),
        }
    }

    /// Returns `true` for idempotent steps.
    pub fn is_idempotent(&self) -> bool {
        match self {
            WorkflowStep::Sync(s) => s.is_idempotent(),
            WorkflowStep::Async(a) => a.is_idempotent(),
        }
    }

    /// Returns `true` for the asynchronous variant.
    pub fn is_async(&self) -> bool {
        matches!(self, WorkflowStep::Async(_))
    }

    /// Returns `true` if the step declared a compensation.
    pub fn has_compensation(&self) -> bool {
        match self {
            WorkflowStep::Sync(s) => s.compensation().is_some(),
            WorkflowStep::Async(a) => a.compensation().is_some(),
        }
    }

    /// Returns the free-form metadata attached at build time.
    pub fn metadata(&self) -> &HashMap<String, Value> {
        match self {
            WorkflowStep::Sync(s) => s.metadata(),
            WorkflowStep::Async(a) => a.metadata(),
        }
    }
}

impl From<SyncStep> for WorkflowStep {
    fn from(step: SyncStep) -> Self {
        WorkflowStep::Sync(step)
    }
}

impl From<AsyncStep> for WorkflowStep {
    fn from(step: AsyncStep) -> Self {
        WorkflowStep::Async(step)
    }
}
