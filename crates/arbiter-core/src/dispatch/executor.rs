//! Backend execution contract
//!
//! Every registered backend carries its own [`BackendExecutor`]. The
//! dispatcher never inspects backend ids to decide how to call a provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::routing::{Backend, TaskRequest};

/// Failure kinds at the backend-execution boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The provider reported an error
    #[error("backend error: {0}")]
    Backend(String),

    /// The call did not finish within its time budget
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The call was cancelled before it finished
    #[error("cancelled")]
    Cancelled,

    /// The provider answered with something unusable
    #[error("invalid output: {0}")]
    InvalidOutput(String),
}

/// What a backend returns for one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Opaque result payload
    pub output: serde_json::Value,
    /// Self-reported confidence (0.0 to 1.0)
    pub confidence: f64,
    /// Units of work consumed
    pub units: u64,
    /// Observed cost, if the provider reports one
    pub cost: Option<f64>,
}

impl ExecutionOutput {
    pub fn new(output: serde_json::Value, confidence: f64) -> Self {
        Self {
            output,
            confidence,
            units: 0,
            cost: None,
        }
    }

    /// Set units of work consumed
    pub fn with_units(mut self, units: u64) -> Self {
        self.units = units;
        self
    }

    /// Set the observed cost
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// A pluggable provider client
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Run the request against this backend
    async fn execute(&self, request: &TaskRequest) -> Result<ExecutionOutput, ExecutionError>;
}

/// Result of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub backend_id: String,
    pub output: serde_json::Value,
    /// Confidence (0.0 to 1.0)
    pub confidence: f64,
    /// Wall-clock latency observed by the dispatcher
    pub latency_ms: u64,
    pub cost: f64,
    pub units: u64,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    /// Copy of this result with confidence scaled by `factor`
    pub fn penalized(&self, factor: f64) -> Self {
        Self {
            confidence: (self.confidence * factor).clamp(0.0, 1.0),
            ..self.clone()
        }
    }
}

/// Run one backend call under a timeout and a cancellation token
///
/// Cost falls back to the backend's declared price for the units consumed
/// when the provider does not report one.
pub(crate) async fn execute_with_limits(
    backend: &Backend,
    executor: &dyn BackendExecutor,
    request: &TaskRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TaskResult, ExecutionError> {
    if cancel.is_cancelled() {
        return Err(ExecutionError::Cancelled);
    }

    let started = Instant::now();
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
        outcome = tokio::time::timeout(timeout, executor.execute(request)) => {
            outcome.map_err(|_| ExecutionError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })??
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    if !output.confidence.is_finite() {
        return Err(ExecutionError::InvalidOutput(format!(
            "confidence {} is not a number",
            output.confidence
        )));
    }

    Ok(TaskResult {
        backend_id: backend.id.clone(),
        cost: output
            .cost
            .unwrap_or_else(|| backend.estimate_cost(output.units)),
        output: output.output,
        confidence: output.confidence.clamp(0.0, 1.0),
        latency_ms,
        units: output.units,
        timestamp: Utc::now(),
    })
}
