//! Saga workflow engine: builder and runner.

use crate::compensation;
use crate::executor::{DefaultStepExecutor, ErrorPredicate};
use crate::handle::WorkflowHandle;
use sagaflow_core::{
    keys, AsyncStep, IdempotencyChecker, MetricsCollector, StepError, StepExecutor,
    StepInterceptor, SyncStep, WorkflowContext, WorkflowError, WorkflowListener, WorkflowStep,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Steps returned by a combinator expansion, spliced into the queue after
/// the synthetic step's action succeeds.
pub(crate) type ExpandFn = Box<
    dyn FnOnce(&Value, &EngineSeed, &Arc<WorkflowContext>) -> Result<Vec<QueuedStep>, StepError>
        + Send,
>;

/// A pending queue entry: the step plus an optional expansion hook used by
/// flattening combinators.
pub(crate) struct QueuedStep {
    pub(crate) step: WorkflowStep,
    pub(crate) expand: Option<ExpandFn>,
}

impl From<WorkflowStep> for QueuedStep {
    fn from(step: WorkflowStep) -> Self {
        Self { step, expand: None }
    }
}

/// Engine configuration inherited by sub-workflows.
#[derive(Clone)]
pub(crate) struct EngineSeed {
    pub(crate) name: String,
    pub(crate) logging: bool,
    pub(crate) skip_compensation: bool,
    pub(crate) executor: Option<Handle>,
    pub(crate) step_executor: Option<Arc<dyn StepExecutor>>,
    pub(crate) metrics: Option<Arc<dyn MetricsCollector>>,
    pub(crate) non_retryable: Option<ErrorPredicate>,
}

/// Saga workflow engine: accumulates steps, drives them in FIFO order and
/// compensates executed steps in reverse order on failure.
///
/// The engine is both a builder and an executor. Every mutator validates
/// that no execution is in flight and fails with
/// [`WorkflowError::ExecutionInProgress`] otherwise. Engines are
/// single-use by default; [`reset`](Workflow::reset) restores them to a
/// configurable state.
///
/// # Examples
///
/// ```no_run
/// use sagaflow::prelude::*;
///
/// # async fn run() -> Result<(), WorkflowError> {
/// let mut workflow = Workflow::new("CreateUser");
/// workflow
///     .step_with_compensation(
///         "Persist user",
///         || Ok("user-42"),
///         |user| {
///             println!("rolling back {user}");
///             Ok(())
///         },
///     )?
///     .step("Build response", || Ok("created"))?;
///
/// let result = workflow.execute().await?;
/// assert_eq!(result, Some(json!("created")));
/// # Ok(())
/// # }
/// ```
pub struct Workflow {
    pub(crate) name: String,
    pub(crate) logging: bool,
    pub(crate) skip_compensation: bool,
    pub(crate) context: Arc<WorkflowContext>,
    pub(crate) queue: VecDeque<QueuedStep>,
    executed: Arc<Mutex<Vec<WorkflowStep>>>,
    step_counter: Arc<AtomicU32>,
    compensation_errors: Arc<Mutex<Vec<WorkflowError>>>,
    interceptors: Vec<Arc<dyn StepInterceptor>>,
    listeners: Vec<Arc<dyn WorkflowListener>>,
    pub(crate) metrics: Option<Arc<dyn MetricsCollector>>,
    idempotency: Option<Arc<dyn IdempotencyChecker>>,
    pub(crate) step_executor: Option<Arc<dyn StepExecutor>>,
    pub(crate) executor: Option<Handle>,
    pub(crate) non_retryable: Option<ErrorPredicate>,
    executing: Arc<AtomicBool>,
    current: Option<AbortHandle>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("workflow_id", &self.context.context_id())
            .field("pending_steps", &self.queue.len())
            .field("is_executing", &self.is_executing())
            .finish()
    }
}

impl Workflow {
    /// Creates a new engine with the given name and a fresh context.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_context(name.into(), WorkflowContext::new())
    }

    /// Creates a new engine whose context is pre-populated with the given
    /// entries.
    pub fn with_initial(name: impl Into<String>, initial: HashMap<String, Value>) -> Self {
        Self::from_context(name.into(), WorkflowContext::with_initial(initial))
    }

    fn from_context(name: String, context: WorkflowContext) -> Self {
        let context = Arc::new(context);
        context.put(keys::WORKFLOW_NAME, name.clone());
        context.put(keys::EXECUTION_ID, Uuid::new_v4().to_string());
        Self {
            name,
            logging: true,
            skip_compensation: false,
            context,
            queue: VecDeque::new(),
            executed: Arc::new(Mutex::new(Vec::new())),
            step_counter: Arc::new(AtomicU32::new(0)),
            compensation_errors: Arc::new(Mutex::new(Vec::new())),
            interceptors: Vec::new(),
            listeners: Vec::new(),
            metrics: None,
            idempotency: None,
            step_executor: None,
            executor: None,
            non_retryable: None,
            executing: Arc::new(AtomicBool::new(false)),
            current: None,
        }
    }

    /// Builds a sub-engine for a combinator block: inherits the seed
    /// configuration, takes a suffixed name and copies a snapshot of the
    /// source context.
    pub(crate) fn from_seed(
        seed: &EngineSeed,
        suffix: &str,
        source: &WorkflowContext,
    ) -> Workflow {
        let mut sub = Workflow::new(format!("{}-{}", seed.name, suffix));
        sub.logging = seed.logging;
        sub.skip_compensation = seed.skip_compensation;
        sub.executor = seed.executor.clone();
        sub.step_executor = seed.step_executor.clone();
        sub.metrics = seed.metrics.clone();
        sub.non_retryable = seed.non_retryable.clone();
        for (key, value) in source.snapshot() {
            sub.context.put(key, value);
        }
        sub
    }

    /// Returns this engine's configuration as a seed for sub-workflows.
    pub(crate) fn seed(&self) -> EngineSeed {
        EngineSeed {
            name: self.name.clone(),
            logging: self.logging,
            skip_compensation: self.skip_compensation,
            executor: self.executor.clone(),
            step_executor: self.step_executor.clone(),
            metrics: self.metrics.clone(),
            non_retryable: self.non_retryable.clone(),
        }
    }

    /// Moves out the pending steps (used when flattening sub-workflows).
    pub(crate) fn drain_queue(&mut self) -> VecDeque<QueuedStep> {
        std::mem::take(&mut self.queue)
    }

    fn ensure_mutable(&self) -> Result<(), WorkflowError> {
        if self.executing.load(Ordering::SeqCst) {
            Err(WorkflowError::ExecutionInProgress)
        } else {
            Ok(())
        }
    }

    // ---- configuration -------------------------------------------------

    /// Renames the workflow.
    pub fn with_name(&mut self, name: impl Into<String>) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.name = name.into();
        self.context.put(keys::WORKFLOW_NAME, self.name.clone());
        Ok(self)
    }

    /// Enables or disables engine logging and lifecycle trace entries.
    pub fn enable_logging(&mut self, enabled: bool) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.logging = enabled;
        Ok(self)
    }

    /// Suppresses the compensation sweep on failure.
    pub fn skip_compensation(&mut self, skip: bool) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.skip_compensation = skip;
        Ok(self)
    }

    /// Seeds a context entry.
    pub fn with_value(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.context.put(key, value);
        Ok(self)
    }

    /// Sets the runtime handle used for async fan-out and spawning.
    ///
    /// Without one, the engine falls back to the ambient runtime, which is
    /// shared process-wide.
    pub fn with_executor(&mut self, executor: Handle) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.executor = Some(executor);
        Ok(self)
    }

    /// Overrides how step attempts are driven.
    pub fn with_step_executor(
        &mut self,
        step_executor: Arc<dyn StepExecutor>,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.step_executor = Some(step_executor);
        Ok(self)
    }

    /// Attaches a metrics collector.
    pub fn with_metrics_collector(
        &mut self,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.metrics = Some(metrics);
        Ok(self)
    }

    /// Attaches an idempotency checker consulted for idempotent steps.
    pub fn with_idempotency_checker(
        &mut self,
        checker: Arc<dyn IdempotencyChecker>,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.idempotency = Some(checker);
        Ok(self)
    }

    /// Declares which errors must never be retried.
    pub fn with_non_retryable<P>(&mut self, predicate: P) -> Result<&mut Self, WorkflowError>
    where
        P: Fn(&(dyn std::error::Error + Send + Sync)) -> bool + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        self.non_retryable = Some(Arc::new(predicate));
        Ok(self)
    }

    /// Registers a step interceptor. Interceptors fire in registration
    /// order; their failures are logged and swallowed.
    pub fn add_interceptor(
        &mut self,
        interceptor: Arc<dyn StepInterceptor>,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.interceptors.push(interceptor);
        Ok(self)
    }

    /// Registers a workflow listener. Listeners fire in registration
    /// order; their failures are logged and swallowed.
    pub fn add_listener(
        &mut self,
        listener: Arc<dyn WorkflowListener>,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.listeners.push(listener);
        Ok(self)
    }

    // ---- step accumulation ---------------------------------------------

    /// Enqueues a fully built step descriptor.
    pub fn add_step(
        &mut self,
        step: impl Into<WorkflowStep>,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        let step: WorkflowStep = step.into();
        self.queue.push_back(step.into());
        Ok(self)
    }

    pub(crate) fn enqueue_synthetic(
        &mut self,
        step: SyncStep,
        expand: ExpandFn,
    ) -> Result<&mut Self, WorkflowError> {
        self.ensure_mutable()?;
        self.queue.push_back(QueuedStep {
            step: step.into(),
            expand: Some(expand),
        });
        Ok(self)
    }

    /// Enqueues a quick synchronous step. A unit-returning action records
    /// no result.
    pub fn step<F, T>(
        &mut self,
        name: impl Into<String>,
        action: F,
    ) -> Result<&mut Self, WorkflowError>
    where
        F: Fn() -> Result<T, StepError> + Send + Sync + 'static,
        T: Serialize,
    {
        self.add_step(SyncStep::builder(name, action).build())
    }

    /// Enqueues a synchronous step with a compensation.
    pub fn step_with_compensation<F, T, C>(
        &mut self,
        name: impl Into<String>,
        action: F,
        compensation: C,
    ) -> Result<&mut Self, WorkflowError>
    where
        F: Fn() -> Result<T, StepError> + Send + Sync + 'static,
        T: Serialize,
        C: Fn(Value) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.add_step(
            SyncStep::builder(name, action)
                .compensation(compensation)
                .build(),
        )
    }

    /// Enqueues a quick asynchronous step.
    pub fn async_step<F, Fut, T>(
        &mut self,
        name: impl Into<String>,
        action: F,
    ) -> Result<&mut Self, WorkflowError>
    where
        F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
        T: Serialize,
    {
        self.add_step(AsyncStep::builder(name, action).build())
    }

    /// Enqueues an asynchronous step with an asynchronous compensation.
    pub fn async_step_with_compensation<F, Fut, T, C, CFut>(
        &mut self,
        name: impl Into<String>,
        action: F,
        compensation: C,
    ) -> Result<&mut Self, WorkflowError>
    where
        F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
        T: Serialize,
        C: Fn(Value) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.add_step(
            AsyncStep::builder(name, action)
                .compensation(compensation)
                .build(),
        )
    }

    // ---- execution -----------------------------------------------------

    /// Drives all pending steps to completion and returns the final
    /// result, i.e. the value of the last step that produced one.
    ///
    /// On failure the compensation sweep runs (unless suppressed) and a
    /// [`WorkflowError`] describing the failure is returned. The context
    /// remains inspectable afterwards.
    pub async fn execute(&mut self) -> Result<Option<Value>, WorkflowError> {
        self.ensure_mutable()?;
        self.executing.store(true, Ordering::SeqCst);
        let mut run = self.take_run_state();
        let result = run.drive().await;
        self.executing.store(false, Ordering::SeqCst);
        result
    }

    /// Starts execution on the configured (or ambient) runtime and
    /// returns a handle that can be awaited or cancelled.
    pub fn execute_async(&mut self) -> Result<WorkflowHandle, WorkflowError> {
        self.ensure_mutable()?;
        let handle = match &self.executor {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| {
                WorkflowError::Configuration(
                    "execute_async requires a tokio runtime".to_string(),
                )
            })?,
        };
        self.executing.store(true, Ordering::SeqCst);
        let mut run = self.take_run_state();
        let executing = Arc::clone(&self.executing);
        let join = handle.spawn(async move {
            let result = run.drive().await;
            executing.store(false, Ordering::SeqCst);
            result
        });
        self.current = Some(join.abort_handle());
        Ok(WorkflowHandle {
            join,
            executing: Arc::clone(&self.executing),
        })
    }

    /// Cancels an execution started with
    /// [`execute_async`](Workflow::execute_async) and clears the gate.
    pub fn cancel(&mut self) {
        if let Some(current) = self.current.take() {
            current.abort();
        }
        self.executing.store(false, Ordering::SeqCst);
    }

    fn take_run_state(&mut self) -> RunState {
        let step_executor = self.step_executor.clone().unwrap_or_else(|| {
            Arc::new(DefaultStepExecutor::new(
                self.metrics.clone(),
                self.non_retryable.clone(),
            ))
        });
        RunState {
            name: self.name.clone(),
            logging: self.logging,
            skip_compensation: self.skip_compensation,
            context: Arc::clone(&self.context),
            queue: std::mem::take(&mut self.queue),
            executed: Arc::clone(&self.executed),
            step_counter: Arc::clone(&self.step_counter),
            compensation_errors: Arc::clone(&self.compensation_errors),
            interceptors: self.interceptors.clone(),
            listeners: self.listeners.clone(),
            metrics: self.metrics.clone(),
            idempotency: self.idempotency.clone(),
            executor: self.executor.clone(),
            step_executor,
            step_executor_override: self.step_executor.clone(),
            non_retryable: self.non_retryable.clone(),
        }
    }

    // ---- inspection ----------------------------------------------------

    /// Returns the workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of attempted steps, including failed ones.
    pub fn executed_step_count(&self) -> u32 {
        self.step_counter.load(Ordering::SeqCst)
    }

    /// Returns the names of successfully executed steps in execution
    /// order.
    pub fn executed_step_names(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|step| step.name().to_string())
            .collect()
    }

    /// Returns a copy of the context's execution trace.
    pub fn execution_trace(&self) -> Vec<String> {
        self.context.get_trace()
    }

    /// Returns a deep copy of the context data.
    pub fn context_snapshot(&self) -> HashMap<String, Value> {
        self.context.snapshot()
    }

    /// Returns the workflow (context) identifier.
    pub fn workflow_id(&self) -> String {
        self.context.context_id().to_string()
    }

    /// Returns `true` while an execution is in flight.
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Returns a shared handle to the workflow context, for step actions
    /// that read or write shared state.
    pub fn context(&self) -> Arc<WorkflowContext> {
        Arc::clone(&self.context)
    }

    /// Returns a context value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.context.get(key)
    }

    /// Returns the most recent non-null step result.
    pub fn last_result(&self) -> Option<Value> {
        self.context.get(keys::LAST_RESULT)
    }

    /// Returns the recorded result of the given step id.
    pub fn step_result(&self, step_id: &str) -> Option<Value> {
        self.context.step_result(step_id)
    }

    /// Restores the engine to a configurable state: pending steps,
    /// bookkeeping, hooks and context data are cleared, and the reserved
    /// identity keys are re-seeded with a fresh execution id.
    pub fn reset(&mut self) -> Result<(), WorkflowError> {
        self.ensure_mutable()?;
        self.queue.clear();
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.compensation_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.interceptors.clear();
        self.listeners.clear();
        self.step_counter.store(0, Ordering::SeqCst);
        self.current = None;
        self.context.clear();
        self.context
            .put(keys::WORKFLOW_ID, self.context.context_id().to_string());
        self.context
            .put(keys::START_TIME, self.context.created_at().to_rfc3339());
        self.context.put(keys::WORKFLOW_NAME, self.name.clone());
        self.context
            .put(keys::EXECUTION_ID, Uuid::new_v4().to_string());
        Ok(())
    }
}

/// Failure raised by the runner loop, before final wrapping.
enum RunFailure {
    /// A plain step failure.
    Step(StepError),
    /// A failure already expressed in the engine's taxonomy (critical
    /// steps, inline sub-workflows).
    Workflow(WorkflowError),
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::Step(e) => fmt::Display::fmt(e, f),
            RunFailure::Workflow(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl RunFailure {
    fn into_step_error(self) -> StepError {
        match self {
            RunFailure::Step(e) => e,
            RunFailure::Workflow(e) => Box::new(e),
        }
    }

    fn as_dyn_error(&self) -> &(dyn std::error::Error + Send + Sync) {
        match self {
            RunFailure::Step(e) => e.as_ref(),
            RunFailure::Workflow(e) => e,
        }
    }
}

/// Everything the runner needs, detached from the builder so executions
/// can be spawned.
pub(crate) struct RunState {
    name: String,
    logging: bool,
    skip_compensation: bool,
    context: Arc<WorkflowContext>,
    queue: VecDeque<QueuedStep>,
    executed: Arc<Mutex<Vec<WorkflowStep>>>,
    step_counter: Arc<AtomicU32>,
    compensation_errors: Arc<Mutex<Vec<WorkflowError>>>,
    interceptors: Vec<Arc<dyn StepInterceptor>>,
    listeners: Vec<Arc<dyn WorkflowListener>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    idempotency: Option<Arc<dyn IdempotencyChecker>>,
    executor: Option<Handle>,
    step_executor: Arc<dyn StepExecutor>,
    step_executor_override: Option<Arc<dyn StepExecutor>>,
    non_retryable: Option<ErrorPredicate>,
}

impl RunState {
    pub(crate) async fn drive(&mut self) -> Result<Option<Value>, WorkflowError> {
        self.notify_listeners(|l| l.on_workflow_start(&self.name, &self.context));
        if self.logging {
            info!(
                "starting workflow '{}' [{}]",
                self.name,
                self.context.context_id()
            );
            self.context.trace(format!("Workflow started: {}", self.name));
        }

        let mut failure = None;
        while let Some(next) = self.queue.pop_front() {
            if let Err(e) = self.process(next).await {
                failure = Some(e);
                break;
            }
        }

        let Some(failure) = failure else {
            let final_result = self.context.get(keys::FINAL_RESULT);
            if self.logging {
                info!(
                    "workflow '{}' completed successfully ({} steps)",
                    self.name,
                    self.step_counter.load(Ordering::SeqCst)
                );
                self.context.trace("Workflow completed successfully");
            }
            self.notify_listeners(|l| {
                l.on_workflow_complete(&self.name, &self.context, final_result.as_ref())
            });
            return Ok(final_result);
        };

        let step_number = self.step_counter.load(Ordering::SeqCst);
        if self.logging {
            error!(
                "workflow '{}' failed at step {}: {}",
                self.name, step_number, failure
            );
            self.context.trace(format!("Workflow failed: {failure}"));
        }
        self.context.put(keys::ERROR_CONTEXT, failure.to_string());
        self.notify_listeners(|l| {
            l.on_workflow_error(&self.name, &self.context, failure.as_dyn_error())
        });

        if !self.skip_compensation {
            let executed = self
                .executed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let outcome = compensation::run_sweep(
                &self.name,
                &executed,
                &self.context,
                self.metrics.as_ref(),
                &self.listeners,
                self.logging,
            )
            .await;
            self.compensation_errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(outcome.errors);
        }

        let compensation_errors = std::mem::take(
            &mut *self
                .compensation_errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        match failure {
            RunFailure::Workflow(e) if compensation_errors.is_empty() => Err(e),
            RunFailure::Step(e) if compensation_errors.is_empty() => {
                // An error already in the engine taxonomy (timeouts,
                // nested workflow failures) surfaces unwrapped.
                match e.downcast::<WorkflowError>() {
                    Ok(workflow_error) => Err(*workflow_error),
                    Err(e) => Err(WorkflowError::WorkflowFailed {
                        workflow: self.name.clone(),
                        step_number,
                        source: e,
                        compensation_errors,
                    }),
                }
            }
            failure => Err(WorkflowError::WorkflowFailed {
                workflow: self.name.clone(),
                step_number,
                source: failure.into_step_error(),
                compensation_errors,
            }),
        }
    }

    fn engine_seed(&self) -> EngineSeed {
        EngineSeed {
            name: self.name.clone(),
            logging: self.logging,
            skip_compensation: self.skip_compensation,
            executor: self.executor.clone(),
            step_executor: self.step_executor_override.clone(),
            metrics: self.metrics.clone(),
            non_retryable: self.non_retryable.clone(),
        }
    }

    async fn process(&mut self, queued: QueuedStep) -> Result<(), RunFailure> {
        let QueuedStep { step, expand } = queued;

        if step.is_idempotent() {
            if let Some(checker) = &self.idempotency {
                match checker.is_step_executed(self.context.context_id(), step.id()) {
                    Ok(true) => {
                        if self.logging {
                            info!(
                                "skipping idempotent step '{}', already executed",
                                step.name()
                            );
                            self.context
                                .trace(format!("Step skipped (idempotent): {}", step.name()));
                        }
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        let step_number = self.step_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        return self.fail_step(&step, e, step_number);
                    }
                }
            }
        }

        let step_number = self.step_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if self.logging {
            debug!("step {}: {} - starting", step_number, step.name());
            self.context
                .trace(format!("Step {} started: {}", step_number, step.name()));
        }
        self.notify_interceptors(|i| i.before_step(&step, &self.context));

        let outcome = match self.step_executor.execute(&step, &self.context).await {
            Ok(value) => match expand {
                Some(expand) => {
                    let seed = self.engine_seed();
                    expand(&value, &seed, &self.context).map(|extra| (value, extra))
                }
                None => Ok((value, Vec::new())),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok((value, extra)) => {
                self.queue.extend(extra);
                if !value.is_null() {
                    self.context.put(keys::LAST_RESULT, value.clone());
                    self.context.record_step_result(step.id(), value.clone());
                    self.context.put(keys::FINAL_RESULT, value.clone());
                    let result_key =
                        format!("{}{}", keys::STEP_RESULT_PREFIX, sanitize(step.name()));
                    self.context.put(result_key, value.clone());
                }
                if step.is_idempotent() {
                    if let Some(checker) = &self.idempotency {
                        if let Err(e) =
                            checker.mark_step_executed(self.context.context_id(), step.id())
                        {
                            return self.fail_step(&step, e, step_number);
                        }
                    }
                }
                self.executed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(step.clone());
                if self.logging {
                    debug!("step {}: {} - completed", step_number, step.name());
                    self.context
                        .trace(format!("Step {} completed: {}", step_number, step.name()));
                }
                self.notify_interceptors(|i| i.after_step(&step, &self.context, &value));
                Ok(())
            }
            Err(e) => self.fail_step(&step, e, step_number),
        }
    }

    fn fail_step(
        &self,
        step: &WorkflowStep,
        error: StepError,
        step_number: u32,
    ) -> Result<(), RunFailure> {
        if self.logging {
            error!(
                "step {}: {} - failed: {}",
                step_number,
                step.name(),
                error
            );
            self.context.trace(format!(
                "Step {} failed: {}: {}",
                step_number,
                step.name(),
                error
            ));
        }
        self.context.record_step_error(step.id(), &error);
        self.notify_interceptors(|i| i.on_step_error(step, &self.context, error.as_ref()));
        if step.is_critical() {
            Err(RunFailure::Workflow(WorkflowError::CriticalStepFailed {
                step_name: step.name().to_string(),
                source: error,
            }))
        } else {
            Err(RunFailure::Step(error))
        }
    }

    fn notify_interceptors<F>(&self, hook: F)
    where
        F: Fn(&dyn StepInterceptor) -> Result<(), StepError>,
    {
        for interceptor in &self.interceptors {
            if let Err(e) = hook(interceptor.as_ref()) {
                error!("step interceptor hook failed: {}", e);
            }
        }
    }

    fn notify_listeners<F>(&self, hook: F)
    where
        F: Fn(&dyn WorkflowListener) -> Result<(), StepError>,
    {
        for listener in &self.listeners {
            if let Err(e) = hook(listener.as_ref()) {
                error!("workflow listener hook failed: {}", e);
            }
        }
    }
}

/// Derives the `step_result_<name>` context key fragment: whitespace runs
/// collapse to `_`, everything lowercased. Steps sharing a name share the
/// key; the later result overwrites.
pub(crate) fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_whitespace = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
                in_whitespace = true;
            }
        } else {
            in_whitespace = false;
            out.extend(c.to_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Persist user"), "persist_user");
        assert_eq!(sanitize("A  B\tC"), "a_b_c");
        assert_eq!(sanitize(" leading"), "_leading");
        assert_eq!(sanitize("UPPER"), "upper");
    }

    #[tokio::test]
    async fn test_basic_execution() {
        let mut workflow = Workflow::new("test");
        workflow
            .step("first", || Ok("one"))
            .expect("enqueue")
            .step("second", || Ok("two"))
            .expect("enqueue");

        let result = workflow.execute().await.expect("workflow failed");

        assert_eq!(result, Some(json!("two")));
        assert_eq!(workflow.executed_step_names(), vec!["first", "second"]);
        assert_eq!(workflow.executed_step_count(), 2);
        assert_eq!(workflow.last_result(), Some(json!("two")));
    }

    #[tokio::test]
    async fn test_step_results_recorded_under_sanitized_names() {
        let mut workflow = Workflow::new("test");
        workflow
            .step("Persist user", || Ok("user-42"))
            .expect("enqueue");

        workflow.execute().await.expect("workflow failed");

        assert_eq!(
            workflow.get("step_result_persist_user"),
            Some(json!("user-42"))
        );
    }

    #[tokio::test]
    async fn test_empty_workflow_returns_none() {
        let mut workflow = Workflow::new("empty");
        let result = workflow.execute().await.expect("workflow failed");
        assert_eq!(result, None);
        assert_eq!(workflow.executed_step_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_with_step_ordinal() {
        let mut workflow = Workflow::new("failing");
        workflow
            .step("ok", || Ok("fine"))
            .expect("enqueue")
            .add_step(
                SyncStep::builder("broken", || {
                    Err::<(), StepError>("kaput".into())
                })
                .max_retries(0)
                .build(),
            )
            .expect("enqueue");

        let error = workflow.execute().await.expect_err("must fail");

        match error {
            WorkflowError::WorkflowFailed {
                workflow,
                step_number,
                compensation_errors,
                ..
            } => {
                assert_eq!(workflow, "failing");
                assert_eq!(step_number, 2);
                assert!(compensation_errors.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_null_results_are_not_recorded() {
        let mut workflow = Workflow::new("test");
        workflow
            .step("valued", || Ok("value"))
            .expect("enqueue")
            .step("void", || Ok(()))
            .expect("enqueue");

        let result = workflow.execute().await.expect("workflow failed");

        // The unit step does not overwrite the final result.
        assert_eq!(result, Some(json!("value")));
    }

    #[tokio::test]
    async fn test_reset_allows_reuse() {
        let mut workflow = Workflow::new("reusable");
        workflow.step("a", || Ok("first")).expect("enqueue");
        let first = workflow.execute().await.expect("workflow failed");

        workflow.reset().expect("reset");
        assert_eq!(workflow.executed_step_count(), 0);
        assert!(workflow.executed_step_names().is_empty());

        workflow.step("a", || Ok("first")).expect("enqueue");
        let second = workflow.execute().await.expect("workflow failed");

        assert_eq!(first, second);
        assert_eq!(workflow.executed_step_names(), vec!["a"]);
        assert_eq!(
            workflow.get(keys::WORKFLOW_ID),
            Some(json!(workflow.workflow_id()))
        );
    }
}
