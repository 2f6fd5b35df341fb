//! Arbiter Core Library
//!
//! This crate picks an AI backend for a unit of work, runs it, cross-checks
//! weak results and remembers what happened:
//! - Backend registry and multi-criteria scoring
//! - Dispatcher with one-shot fallback, parallel alternatives and timeouts
//! - Self-assessment pass through a dedicated assessor backend
//! - Per-(backend, task type) metrics tracking
//! - Indexed context memory with similarity linking and retention cleanup

pub mod assessment;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod routing;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::assessment::{SelfAssessmentResult, SelfAssessor};
    pub use crate::config::Config;
    pub use crate::dispatch::{
        BackendExecutor, Dispatcher, DispatcherBuilder, ExecutionError, ExecutionOutput,
        OrchestrationOutcome, TaskResult,
    };
    pub use crate::error::{Error, Result};
    pub use crate::memory::{ContextEntry, ContextMemory, ContextQuery, NewContextEntry};
    pub use crate::routing::{
        Backend, BackendRegistry, MetricsTracker, Priority, Scorer, TaskRequest,
    };
}
