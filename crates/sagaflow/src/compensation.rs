//! Reverse-order compensation of executed steps.

use futures::future::join_all;
use sagaflow_core::{
    defaults, AsyncCompensation, MetricsCollector, StepError, SyncCompensation, WorkflowContext,
    WorkflowError, WorkflowListener, WorkflowStep,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Tally of one compensation sweep.
pub(crate) struct CompensationOutcome {
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
    pub(crate) errors: Vec<WorkflowError>,
}

/// Undoes executed steps in reverse execution order.
///
/// Steps without a compensation are skipped silently. Synchronous
/// compensations run inline during the sweep; asynchronous ones are
/// collected and awaited together, bounded by
/// [`defaults::COMPENSATION_TIMEOUT`] - a timeout logs and proceeds.
/// A compensation failure is collected and never aborts the sweep. A step
/// whose recorded result is missing is compensated with [`Value::Null`].
pub(crate) async fn run_sweep(
    workflow: &str,
    executed: &[WorkflowStep],
    ctx: &Arc<WorkflowContext>,
    metrics: Option<&Arc<dyn MetricsCollector>>,
    listeners: &[Arc<dyn WorkflowListener>],
    logging: bool,
) -> CompensationOutcome {
    let mut outcome = CompensationOutcome {
        succeeded: 0,
        failed: 0,
        errors: Vec::new(),
    };
    if executed.is_empty() {
        return outcome;
    }

    if logging {
        info!(
            "starting compensation for {} steps of workflow '{}'",
            executed.len(),
            workflow
        );
        ctx.trace(format!("Compensation started for {} steps", executed.len()));
    }
    for listener in listeners {
        if let Err(e) = listener.on_compensation_start(workflow, ctx) {
            error!("workflow listener on_compensation_start failed: {}", e);
        }
    }

    let mut pending = Vec::new();
    for step in executed.iter().rev() {
        match step {
            WorkflowStep::Sync(step) => {
                let Some(compensation) = step.compensation() else {
                    continue;
                };
                let result = ctx.step_result(step.id()).unwrap_or(Value::Null);
                let attempt = compensate_sync(compensation, result).await;
                record(&mut outcome, metrics, ctx, logging, step.name(), attempt);
            }
            WorkflowStep::Async(step) => {
                let Some(compensation) = step.compensation() else {
                    continue;
                };
                let result = ctx.step_result(step.id()).unwrap_or(Value::Null);
                let compensation = compensation.clone();
                let name = step.name().to_string();
                pending.push(async move {
                    let attempt = compensate_async(&compensation, result).await;
                    (name, attempt)
                });
            }
        }
    }

    if !pending.is_empty() {
        match tokio::time::timeout(defaults::COMPENSATION_TIMEOUT, join_all(pending)).await {
            Ok(results) => {
                for (name, attempt) in results {
                    record(&mut outcome, metrics, ctx, logging, &name, attempt);
                }
            }
            Err(_) => error!(
                "async compensation timed out after {:?}",
                defaults::COMPENSATION_TIMEOUT
            ),
        }
    }

    if logging {
        warn!(
            "compensation completed: {} succeeded, {} failed",
            outcome.succeeded, outcome.failed
        );
        ctx.trace(format!(
            "Compensation completed: {} succeeded, {} failed",
            outcome.succeeded, outcome.failed
        ));
    }
    for listener in listeners {
        if let Err(e) =
            listener.on_compensation_complete(workflow, ctx, outcome.succeeded, outcome.failed)
        {
            error!("workflow listener on_compensation_complete failed: {}", e);
        }
    }

    outcome
}

fn record(
    outcome: &mut CompensationOutcome,
    metrics: Option<&Arc<dyn MetricsCollector>>,
    ctx: &Arc<WorkflowContext>,
    logging: bool,
    step_name: &str,
    attempt: Result<(), StepError>,
) {
    match attempt {
        Ok(()) => {
            outcome.succeeded += 1;
            if let Some(metrics) = metrics {
                metrics.record_compensation(step_name, true);
            }
        }
        Err(e) => {
            outcome.failed += 1;
            if let Some(metrics) = metrics {
                metrics.record_compensation(step_name, false);
            }
            if logging {
                error!("compensation for step '{}' failed: {}", step_name, e);
                ctx.trace(format!("Compensation failed for step: {step_name}"));
            }
            outcome.errors.push(WorkflowError::CompensationFailed {
                step_name: step_name.to_string(),
                source: e,
            });
        }
    }
}

async fn compensate_sync(
    compensation: &SyncCompensation,
    result: Value,
) -> Result<(), StepError> {
    let mut attempt: u32 = 1;
    loop {
        match compensation(result.clone()) {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt > defaults::MAX_COMPENSATION_RETRIES {
                    return Err(e);
                }
                warn!(
                    "compensation attempt {}/{} failed: {}",
                    attempt,
                    defaults::MAX_COMPENSATION_RETRIES + 1,
                    e
                );
                tokio::time::sleep(defaults::RETRY_DELAY).await;
                attempt += 1;
            }
        }
    }
}

async fn compensate_async(
    compensation: &AsyncCompensation,
    result: Value,
) -> Result<(), StepError> {
    let mut attempt: u32 = 1;
    loop {
        match compensation(result.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt > defaults::MAX_COMPENSATION_RETRIES {
                    return Err(e);
                }
                warn!(
                    "compensation attempt {}/{} failed: {}",
                    attempt,
                    defaults::MAX_COMPENSATION_RETRIES + 1,
                    e
                );
                tokio::time::sleep(defaults::RETRY_DELAY).await;
                attempt += 1;
            }
        }
    }
}
