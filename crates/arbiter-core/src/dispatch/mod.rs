//! Task dispatch
//!
//! The dispatcher runs one request end to end:
//!
//! 1. Rank eligible backends and execute the best one
//! 2. On a hard failure, retry once on a fallback backend with a confidence penalty
//! 3. On a weak result, run up to two alternatives concurrently and keep the best
//! 4. Record metrics for every backend that ran
//! 5. Send results that are still not confident enough through self-assessment
//! 6. Store the final result in context memory
//!
//! Every backend call runs under a timeout and the dispatcher's cancellation
//! token, so [`Dispatcher::shutdown`] stops in-flight work.

mod dispatcher;
mod executor;

pub use dispatcher::{Dispatcher, DispatcherBuilder, OrchestrationOutcome};
pub use executor::{BackendExecutor, ExecutionError, ExecutionOutput, TaskResult};

pub(crate) use executor::execute_with_limits;
