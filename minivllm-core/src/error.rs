//! Error types for the mini-vLLM core library
//!
//! This module provides the top-level error type built with `thiserror`.
//! Each component keeps its own error enum and converts into [`EngineError`].
//!
//! # Error Hierarchy
//!
//! ```text
//! EngineError (top-level)
//! ├── ConfigError     - Non-positive capacity, block size or batch size
//! └── SchedulerError  - Duplicate/unknown request IDs, oversized requests
//!     └── AllocatorError - Block shortfall and eviction failures
//! ```
//!
//! A block shortfall is not an error at this level: the scheduler resolves it
//! internally by eviction, or leaves the request queued and reports a
//! [`Stall`](crate::scheduler::Stall) in its output.
//!
//! # Usage
//!
//! Library code should use specific error types:
//!
//! ```rust,ignore
//! use minivllm_core::scheduler::SchedulerError;
//!
//! fn admit(scheduler: &mut Scheduler) -> Result<(), SchedulerError> {
//!     // ...
//! }
//! ```
//!
//! Application code should use `anyhow` with context:
//!
//! ```rust,ignore
//! use anyhow::Context;
//!
//! let engine = Engine::new(config).context("Failed to build engine")?;
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::scheduler::SchedulerError;

/// Errors surfaced by the [`Engine`](crate::engine::Engine)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Invalid construction-time configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Rejected request operation
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
