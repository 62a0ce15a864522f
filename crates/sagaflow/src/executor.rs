//! Default step execution with per-step retry.

use async_trait::async_trait;
use sagaflow_core::{
    MetricsCollector, StepError, StepExecutor, WorkflowContext, WorkflowError, WorkflowStep,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Predicate deciding whether an error must not be retried.
pub type ErrorPredicate =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync)) -> bool + Send + Sync>;

/// The engine's built-in [`StepExecutor`].
///
/// Runs each attempt, records timing to the metrics collector, sleeps the
/// step's retry delay between attempts and rethrows the final failure.
/// Async attempts re-invoke the action for a fresh future and are bounded
/// by the step timeout; an elapsed timeout is a retryable failure. Sync
/// actions run on the calling task and are not bounded here.
pub struct DefaultStepExecutor {
    metrics: Option<Arc<dyn MetricsCollector>>,
    non_retryable: Option<ErrorPredicate>,
}

impl DefaultStepExecutor {
    /// Creates an executor reporting to the given collector and honouring
    /// the given non-retryable predicate.
    pub fn new(
        metrics: Option<Arc<dyn MetricsCollector>>,
        non_retryable: Option<ErrorPredicate>,
    ) -> Self {
        Self {
            metrics,
            non_retryable,
        }
    }

    async fn attempt(
        &self,
        step: &WorkflowStep,
        ctx: &Arc<WorkflowContext>,
    ) -> Result<Value, StepError> {
        match step {
            WorkflowStep::Sync(step) => (step.action())(),
            WorkflowStep::Async(step) => {
                let fut = (step.action())(Arc::clone(ctx));
                match step.timeout() {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(WorkflowError::StepTimeout {
                            step_name: step.name().to_string(),
                            timeout: limit,
                        }
                        .into()),
                    },
                    None => fut.await,
                }
            }
        }
    }
}

#[async_trait]
impl StepExecutor for DefaultStepExecutor {
    async fn execute(
        &self,
        step: &WorkflowStep,
        ctx: &Arc<WorkflowContext>,
    ) -> Result<Value, StepError> {
        let max_retries = step.max_retries();
        let mut attempt: u32 = 1;
        loop {
            let started = Instant::now();
            let outcome = self.attempt(step, ctx).await;
            let duration = started.elapsed();
            match outcome {
                Ok(value) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_step_execution(step.name(), duration, true);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_step_execution(step.name(), duration, false);
                        metrics.record_retry(step.name(), attempt);
                    }
                    let fatal = self
                        .non_retryable
                        .as_ref()
                        .is_some_and(|predicate| predicate(error.as_ref()));
                    if fatal || attempt > max_retries {
                        return Err(error);
                    }
                    warn!(
                        "step '{}' attempt {}/{} failed: {}",
                        step.name(),
                        attempt,
                        max_retries + 1,
                        error
                    );
                    if !step.retry_delay().is_zero() {
                        tokio::time::sleep(step.retry_delay()).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
