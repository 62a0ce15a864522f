//! Workflow error taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Opaque failure produced by step actions, compensations and hooks.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by workflow execution.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// The root failure kind: the workflow stopped at the given step.
    ///
    /// Carries the original cause and any errors collected while
    /// compensating already-executed steps.
    #[error("workflow '{workflow}' failed at step {step_number}: {source} [compensation errors: {}]", .compensation_errors.len())]
    WorkflowFailed {
        /// Name of the failed workflow.
        workflow: String,
        /// Ordinal of the failing step, counting attempted steps from 1.
        step_number: u32,
        /// The failure that stopped the workflow.
        #[source]
        source: StepError,
        /// Errors collected during the compensation sweep.
        compensation_errors: Vec<WorkflowError>,
    },

    /// A step flagged critical failed; propagation is immediate.
    #[error("critical step '{step_name}' failed: {source}")]
    CriticalStepFailed {
        /// Name of the critical step.
        step_name: String,
        /// The underlying failure.
        #[source]
        source: StepError,
    },

    /// A per-step or combinator timeout elapsed.
    #[error("step '{step_name}' timed out after {timeout:?}")]
    StepTimeout {
        /// Name of the step that timed out.
        step_name: String,
        /// The elapsed bound.
        timeout: Duration,
    },

    /// Execution was cancelled while running, sleeping between retries or
    /// compensating.
    #[error("workflow interrupted: {details}")]
    Interrupted {
        /// Human-readable cancellation detail.
        details: String,
    },

    /// Compensation retries were exhausted for one step. Collected into
    /// [`WorkflowError::WorkflowFailed`], never thrown standalone.
    #[error("compensation failed for step '{step_name}': {source}")]
    CompensationFailed {
        /// Name of the step whose compensation failed.
        step_name: String,
        /// The underlying failure.
        #[source]
        source: StepError,
    },

    /// A mutator was called while the workflow was executing.
    #[error("cannot modify workflow while it is executing")]
    ExecutionInProgress,

    /// The engine configuration is invalid.
    #[error("invalid workflow configuration: {0}")]
    Configuration(String),
}
