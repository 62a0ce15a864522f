//! Extension points for observing and customising execution.
//!
//! All hook methods default to no-ops so implementors only override what
//! they need. Failures returned by interceptor and listener hooks are
//! logged by the engine and swallowed, never propagated.

use crate::context::WorkflowContext;
use crate::error::StepError;
use crate::step::WorkflowStep;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Hooks into the execution lifecycle of individual steps.
pub trait StepInterceptor: Send + Sync {
    /// Called before a step's first attempt.
    fn before_step(
        &self,
        _step: &WorkflowStep,
        _ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Called after a step succeeded, with its result value.
    fn after_step(
        &self,
        _step: &WorkflowStep,
        _ctx: &WorkflowContext,
        _result: &Value,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Called when a step failed after exhausting its retries.
    fn on_step_error(
        &self,
        _step: &WorkflowStep,
        _ctx: &WorkflowContext,
        _error: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), StepError> {
        Ok(())
    }
}

/// Hooks into workflow-level lifecycle events.
pub trait WorkflowListener: Send + Sync {
    /// Called when execution starts.
    fn on_workflow_start(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Called when execution completes, with the final result.
    fn on_workflow_complete(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
        _result: Option<&Value>,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Called when execution fails, before any compensation.
    fn on_workflow_error(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
        _error: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Called when the compensation sweep begins.
    fn on_compensation_start(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Called when the compensation sweep finishes.
    fn on_compensation_complete(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
        _succeeded: usize,
        _failed: usize,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

/// Collects execution metrics for monitoring.
pub trait MetricsCollector: Send + Sync {
    /// Records one step attempt with its duration and outcome.
    fn record_step_execution(&self, _step: &str, _duration: Duration, _success: bool) {}

    /// Records a failed attempt, with the 1-based attempt number.
    fn record_retry(&self, _step: &str, _attempt: u32) {}

    /// Records the final outcome of one step's compensation.
    fn record_compensation(&self, _step: &str, _success: bool) {}
}

/// Guards idempotent steps against duplicate execution.
///
/// Implementations must be safe for concurrent use. Errors returned here
/// are treated as failures of the step being checked.
pub trait IdempotencyChecker: Send + Sync {
    /// Returns `true` if the step already ran for this workflow instance.
    fn is_step_executed(&self, workflow_id: &str, step_id: &str) -> Result<bool, StepError>;

    /// Marks the step as executed for this workflow instance.
    fn mark_step_executed(&self, workflow_id: &str, step_id: &str) -> Result<(), StepError>;
}

/// Customises how steps are executed, including the retry loop.
///
/// The engine uses its default executor unless an override is configured;
/// overrides are inherited by sub-workflows.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs one step to completion, applying its retry policy, and
    /// returns the action's value.
    async fn execute(
        &self,
        step: &WorkflowStep,
        ctx: &Arc<WorkflowContext>,
    ) -> Result<Value, StepError>;
}
