//! Control-flow combinators: conditionals, loops, parallel branches,
//! fallback and timeout steps.
//!
//! All combinators enqueue synthetic steps. Conditional and for-each
//! bodies are flattened into the parent queue so they participate in the
//! parent's retry and compensation bookkeeping; `repeat` and `parallel`
//! drive sub-workflows of their own, whose bookkeeping stays isolated.

use crate::workflow::{ExpandFn, QueuedStep, Workflow};
use sagaflow_core::{
    keys, AsyncStep, StepError, SyncStep, WorkflowContext, WorkflowError, WorkflowStep,
};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

/// A closure populating one parallel branch.
pub type Branch = Box<dyn Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync>;

impl Workflow {
    /// Runs `body` when `predicate` evaluates to true.
    ///
    /// One synthetic step evaluates the predicate; on true, the body
    /// populates a sub-workflow whose steps are flattened into this
    /// engine's queue.
    pub fn when<P, B>(&mut self, predicate: P, body: B) -> Result<&mut Self, WorkflowError>
    where
        P: Fn() -> bool + Send + Sync + 'static,
        B: Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.conditional_step("Condition check", "ConditionTrue", predicate, body)
    }

    /// Runs `body` when the context value under `key` equals `expected`.
    pub fn when_eq<B>(
        &mut self,
        key: impl Into<String>,
        expected: impl Into<Value>,
        body: B,
    ) -> Result<&mut Self, WorkflowError>
    where
        B: Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync + 'static,
    {
        let key = key.into();
        let expected = expected.into();
        let ctx = self.context();
        self.when(
            move || ctx.get(&key).is_some_and(|value| value == expected),
            body,
        )
    }

    /// If-then conditional; behaves like [`when`](Workflow::when).
    pub fn if_then<P, B>(&mut self, predicate: P, body: B) -> Result<&mut Self, WorkflowError>
    where
        P: Fn() -> bool + Send + Sync + 'static,
        B: Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.conditional_step("If-Then condition", "IfTrue", predicate, body)
    }

    /// If-then-else conditional.
    pub fn if_then_else<P, B, E>(
        &mut self,
        predicate: P,
        if_body: B,
        else_body: E,
    ) -> Result<&mut Self, WorkflowError>
    where
        P: Fn() -> bool + Send + Sync + 'static,
        B: Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync + 'static,
        E: Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync + 'static,
    {
        let expand: ExpandFn = Box::new(move |value, seed, ctx| {
            let mut steps = Vec::new();
            if value.as_bool().unwrap_or(false) {
                let mut sub = Workflow::from_seed(seed, "IfTrue", ctx);
                if_body(&mut sub)?;
                steps.extend(sub.drain_queue());
            } else {
                let mut sub = Workflow::from_seed(seed, "Else", ctx);
                else_body(&mut sub)?;
                steps.extend(sub.drain_queue());
            }
            Ok(steps)
        });
        let step = SyncStep::builder("If-Then-Else condition", move || Ok(predicate())).build();
        self.enqueue_synthetic(step, expand)
    }

    fn conditional_step<P, B>(
        &mut self,
        step_name: &str,
        block_name: &'static str,
        predicate: P,
        body: B,
    ) -> Result<&mut Self, WorkflowError>
    where
        P: Fn() -> bool + Send + Sync + 'static,
        B: Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync + 'static,
    {
        let expand: ExpandFn = Box::new(move |value, seed, ctx| {
            let mut steps = Vec::new();
            if value.as_bool().unwrap_or(false) {
                let mut sub = Workflow::from_seed(seed, block_name, ctx);
                body(&mut sub)?;
                steps.extend(sub.drain_queue());
            }
            Ok(steps)
        });
        let step = SyncStep::builder(step_name, move || Ok(predicate())).build();
        self.enqueue_synthetic(step, expand)
    }

    /// Maps the last recorded step result through `f` as a new step.
    pub fn process_result<F, T>(&mut self, f: F) -> Result<&mut Self, WorkflowError>
    where
        F: Fn(Option<Value>) -> Result<T, StepError> + Send + Sync + 'static,
        T: Serialize,
    {
        let ctx = self.context();
        self.step("Process result", move || f(ctx.get(keys::LAST_RESULT)))
    }

    /// Repeats `body` the given number of times.
    ///
    /// One synthetic step builds a `"<name>-Repeat-<i>"` sub-workflow per
    /// iteration, seeded with a snapshot of the current context, and
    /// drives it to completion before the next iteration. Iteration
    /// failure fails the step; the body's compensations belong to the
    /// iteration's own sub-workflow.
    pub fn repeat<B>(&mut self, times: usize, body: B) -> Result<&mut Self, WorkflowError>
    where
        B: Fn(&mut Workflow) -> Result<(), StepError> + Send + Sync + 'static,
    {
        let seed = self.seed();
        let body = Arc::new(body);
        let step = AsyncStep::builder(
            format!("Repeat {times} times"),
            move |ctx: Arc<WorkflowContext>| {
                let seed = seed.clone();
                let body = Arc::clone(&body);
                async move {
                    for i in 0..times {
                        let mut sub = Workflow::from_seed(&seed, &format!("Repeat-{i}"), &ctx);
                        body(&mut sub)?;
                        sub.execute().await?;
                    }
                    Ok(())
                }
            },
        )
        .build();
        self.add_step(step)
    }

    /// Processes each element of the supplied collection in order.
    ///
    /// The synthetic step enumerates the collection, writes
    /// [`keys::CURRENT_ITEM`] and [`keys::ITEM_INDEX`] into the context,
    /// and flattens one "Process item" step per element into the queue.
    pub fn for_each<S, I, T, P>(
        &mut self,
        supplier: S,
        processor: P,
    ) -> Result<&mut Self, WorkflowError>
    where
        S: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        T: Serialize,
        P: Fn(&Value) -> Result<(), StepError> + Send + Sync + 'static,
    {
        let processor = Arc::new(processor);
        let expand: ExpandFn = Box::new(move |_value, _seed, ctx| {
            let mut steps = Vec::new();
            for (index, item) in supplier().into_iter().enumerate() {
                let item = serde_json::to_value(item)?;
                ctx.put(keys::CURRENT_ITEM, item.clone());
                ctx.put(keys::ITEM_INDEX, index);
                let processor = Arc::clone(&processor);
                steps.push(QueuedStep::from(WorkflowStep::from(
                    SyncStep::builder("Process item", move || processor(&item)).build(),
                )));
            }
            Ok(steps)
        });
        let step = SyncStep::builder("For-Each loop", || Ok(())).build();
        self.enqueue_synthetic(step, expand)
    }

    /// Processes all elements concurrently on the configured executor.
    ///
    /// One async step fans out every element and waits for all of them;
    /// per-item failures are logged and suppressed. Items racing on the
    /// same context keys interleave arbitrarily.
    pub fn for_each_async<S, I, T, P, Fut>(
        &mut self,
        supplier: S,
        processor: P,
    ) -> Result<&mut Self, WorkflowError>
    where
        S: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        T: Serialize,
        P: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        let supplier = Arc::new(supplier);
        let processor = Arc::new(processor);
        let executor = self.executor.clone();
        let step = AsyncStep::builder(
            "For-Each Async loop",
            move |ctx: Arc<WorkflowContext>| {
                let supplier = Arc::clone(&supplier);
                let processor = Arc::clone(&processor);
                let executor = executor.clone();
                async move {
                    let handle = executor.unwrap_or_else(Handle::current);
                    let mut tasks = Vec::new();
                    for item in supplier().into_iter() {
                        let item = serde_json::to_value(item)?;
                        ctx.put(keys::CURRENT_ITEM, item.clone());
                        tasks.push(handle.spawn(processor(item)));
                    }
                    for task in tasks {
                        match task.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => error!("error processing item: {}", e),
                            Err(e) => error!("item processing task failed: {}", e),
                        }
                    }
                    Ok(())
                }
            },
        )
        .build();
        self.add_step(step)
    }

    /// Runs every branch in parallel and waits for all of them.
    ///
    /// Each branch populates a sub-workflow seeded with a snapshot of the
    /// current context, launched on the configured executor. All branches
    /// must succeed; the first failure is reported once every branch has
    /// finished. Branch bookkeeping is isolated: a later parent failure
    /// does not compensate branch work.
    pub fn parallel(&mut self, branches: Vec<Branch>) -> Result<&mut Self, WorkflowError> {
        let seed = self.seed();
        let branches = Arc::new(branches);
        let step = AsyncStep::builder(
            "Parallel execution",
            move |ctx: Arc<WorkflowContext>| {
                let seed = seed.clone();
                let branches = Arc::clone(&branches);
                async move {
                    let handle = seed.executor.clone().unwrap_or_else(Handle::current);
                    let mut tasks = Vec::new();
                    for branch in branches.iter() {
                        let mut sub = Workflow::from_seed(&seed, "ParallelBranch", &ctx);
                        branch(&mut sub)?;
                        tasks.push(handle.spawn(async move { sub.execute().await }));
                    }
                    let mut first_failure: Option<StepError> = None;
                    for task in tasks {
                        match task.await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                if first_failure.is_none() {
                                    first_failure = Some(e.into());
                                }
                            }
                            Err(e) => {
                                if first_failure.is_none() {
                                    first_failure = Some(
                                        WorkflowError::Interrupted {
                                            details: e.to_string(),
                                        }
                                        .into(),
                                    );
                                }
                            }
                        }
                    }
                    match first_failure {
                        Some(e) => Err(e),
                        None => Ok(()),
                    }
                }
            },
        )
        .build();
        self.add_step(step)
    }

    /// Runs `main`; on any failure, runs `fallback` and returns its
    /// result instead.
    pub fn with_fallback<M, T, F, U>(
        &mut self,
        main: M,
        fallback: F,
    ) -> Result<&mut Self, WorkflowError>
    where
        M: Fn() -> Result<T, StepError> + Send + Sync + 'static,
        T: Serialize,
        F: Fn() -> Result<U, StepError> + Send + Sync + 'static,
        U: Serialize,
    {
        self.step("With fallback", move || match main() {
            Ok(value) => serde_json::to_value(value).map_err(Into::into),
            Err(e) => {
                warn!("main action failed, using fallback: {}", e);
                fallback().and_then(|value| serde_json::to_value(value).map_err(Into::into))
            }
        })
    }

    /// Asynchronous variant of [`with_fallback`](Workflow::with_fallback).
    pub fn with_fallback_async<M, MFut, F, FFut, T>(
        &mut self,
        main: M,
        fallback: F,
    ) -> Result<&mut Self, WorkflowError>
    where
        M: Fn(Arc<WorkflowContext>) -> MFut + Send + Sync + 'static,
        MFut: Future<Output = Result<T, StepError>> + Send + 'static,
        F: Fn(Arc<WorkflowContext>) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = Result<T, StepError>> + Send + 'static,
        T: Serialize + Send,
    {
        let fallback = Arc::new(fallback);
        self.async_step("With async fallback", move |ctx: Arc<WorkflowContext>| {
            let main_fut = main(Arc::clone(&ctx));
            let fallback = Arc::clone(&fallback);
            async move {
                match main_fut.await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        warn!("main async action failed, using fallback: {}", e);
                        fallback(ctx).await
                    }
                }
            }
        })
    }

    /// Dispatches `action` on the executor's blocking pool and waits at
    /// most `duration`; on expiry the task is cancelled and the step
    /// fails with [`WorkflowError::StepTimeout`].
    pub fn with_timeout<F, T>(
        &mut self,
        name: impl Into<String>,
        action: F,
        duration: Duration,
    ) -> Result<&mut Self, WorkflowError>
    where
        F: Fn() -> Result<T, StepError> + Send + Sync + 'static,
        T: Serialize,
    {
        let name = name.into();
        let action = Arc::new(action);
        let executor = self.executor.clone();
        let step_name = format!("Timeout: {name}");
        self.async_step(step_name, move |_ctx: Arc<WorkflowContext>| {
            let action = Arc::clone(&action);
            let executor = executor.clone();
            let name = name.clone();
            async move {
                let handle = executor.unwrap_or_else(Handle::current);
                let task = handle.spawn_blocking(move || {
                    action().and_then(|value| serde_json::to_value(value).map_err(Into::into))
                });
                let abort = task.abort_handle();
                match tokio::time::timeout(duration, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => Err(WorkflowError::Interrupted {
                        details: e.to_string(),
                    }
                    .into()),
                    Err(_) => {
                        abort.abort();
                        Err(WorkflowError::StepTimeout {
                            step_name: name.clone(),
                            timeout: duration,
                        }
                        .into())
                    }
                }
            }
        })
    }

    /// Records a message in the execution trace (and the runtime log when
    /// logging is enabled); the message is the step's result.
    pub fn log_message(&mut self, message: impl Into<String>) -> Result<&mut Self, WorkflowError> {
        let message = message.into();
        let ctx = self.context();
        let logging = self.logging;
        let workflow = self.name.clone();
        self.step(format!("Log: {message}"), move || {
            ctx.trace(message.clone());
            if logging {
                info!("[workflow:{}] {}", workflow, message);
            }
            Ok(message.clone())
        })
    }
}
