//! Core traits and types for the sagaflow workflow orchestrator.
//!
//! This crate provides minimal abstractions without runtime dependencies.
//! Library authors should depend on this crate to implement custom steps,
//! executors and observability hooks.
//!
//! # Core Types
//!
//! - [`WorkflowStep`] - Tagged union of sync and async step descriptors
//! - [`SyncStep`] / [`AsyncStep`] - Immutable step definitions with builders
//! - [`WorkflowContext`] - Versioned, concurrency-safe key-value store
//!   shared across a workflow's steps
//! - [`WorkflowError`] / [`StepError`] - Error taxonomy of the engine and
//!   the opaque failure type of caller-supplied code
//!
//! # Extension Points
//!
//! - [`StepInterceptor`] - Per-step before/after/error hooks
//! - [`WorkflowListener`] - Workflow and compensation lifecycle events
//! - [`MetricsCollector`] - Step timing, retry and compensation metrics
//! - [`IdempotencyChecker`] - Skip steps that already ran
//! - [`StepExecutor`] - Override how step attempts are driven

mod context;
mod error;
mod step;
mod traits;

pub use context::{keys, WorkflowContext};
pub use error::{StepError, WorkflowError};
pub use step::{
    defaults, AsyncAction, AsyncCompensation, AsyncStep, AsyncStepBuilder, SyncAction,
    SyncCompensation, SyncStep, SyncStepBuilder, WorkflowStep,
};
pub use traits::{
    IdempotencyChecker, MetricsCollector, StepExecutor, StepInterceptor, WorkflowListener,
};
