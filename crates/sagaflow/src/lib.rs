//! A saga-style workflow orchestrator.
//!
//! Workflows accumulate a FIFO of synchronous and asynchronous steps,
//! each with per-step retries, optional compensation, timeout and
//! criticality. The engine drives them in order; on failure it undoes the
//! already-executed steps in reverse order and surfaces a single error
//! carrying the root cause and any compensation failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use sagaflow::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkflowError> {
//!     let mut workflow = Workflow::new("CreateUser");
//!     workflow
//!         .step_with_compensation(
//!             "Persist user",
//!             || Ok("user-42"),
//!             |user| {
//!                 println!("deleting {user}");
//!                 Ok(())
//!             },
//!         )?
//!         .step("Provision account", || Ok("account-7"))?
//!         .step("Build response", || Ok("created"))?;
//!
//!     let result = workflow.execute().await?;
//!     assert_eq!(result, Some(json!("created")));
//!     Ok(())
//! }
//! ```

mod combinators;
mod compensation;
mod executor;
mod handle;
mod workflow;

// Re-export core types
pub use sagaflow_core::*;

// Export engine types
pub use combinators::Branch;
pub use executor::{DefaultStepExecutor, ErrorPredicate};
pub use handle::WorkflowHandle;
pub use workflow::Workflow;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        defaults, keys, AsyncStep, Branch, DefaultStepExecutor, IdempotencyChecker,
        MetricsCollector, StepError, StepExecutor, StepInterceptor, SyncStep, Workflow,
        WorkflowContext, WorkflowError, WorkflowHandle, WorkflowListener, WorkflowStep,
    };
    pub use serde_json::{json, Value};
}
