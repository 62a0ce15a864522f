//! Handle to a workflow execution started with `execute_async`.

use sagaflow_core::WorkflowError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Awaitable, cancellable handle to a spawned workflow execution.
///
/// Returned by [`Workflow::execute_async`](crate::Workflow::execute_async).
/// Dropping the handle detaches the execution; it keeps running.
pub struct WorkflowHandle {
    pub(crate) join: JoinHandle<Result<Option<Value>, WorkflowError>>,
    pub(crate) executing: Arc<AtomicBool>,
}

impl WorkflowHandle {
    /// Waits for the execution to finish and returns its result.
    ///
    /// A cancelled execution yields [`WorkflowError::Interrupted`].
    pub async fn join(self) -> Result<Option<Value>, WorkflowError> {
        let Self { join, executing } = self;
        match join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                executing.store(false, Ordering::SeqCst);
                Err(WorkflowError::Interrupted {
                    details: "execution cancelled".to_string(),
                })
            }
            Err(e) => {
                executing.store(false, Ordering::SeqCst);
                Err(WorkflowError::Interrupted {
                    details: e.to_string(),
                })
            }
        }
    }

    /// Cancels the running execution and clears the executing gate.
    pub fn cancel(&self) {
        self.join.abort();
        self.executing.store(false, Ordering::SeqCst);
    }

    /// Returns `true` once the execution has finished or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
