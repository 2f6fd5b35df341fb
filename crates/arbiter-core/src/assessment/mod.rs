//! Self-assessment of produced results
//!
//! A designated assessor backend critiques another backend's result and,
//! when it is not confident in it, produces an improved version. The
//! assessor never fails the caller: any problem yields a degraded result.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AssessmentConfig;
use crate::dispatch::{TaskResult, execute_with_limits};
use crate::error::{Error, Result};
use crate::routing::{BackendRegistry, TaskRequest};

/// Task type used for evaluation and improvement calls
pub const ASSESSMENT_TASK_TYPE: &str = "self_assessment";

/// Improved output returned inline with an evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovedPayload {
    pub output: serde_json::Value,
    pub confidence: f64,
}

/// Structured evaluation an assessor backend must return
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentPayload {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    pub confidence: f64,
    pub reliability: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub potential_errors: Vec<String>,
    #[serde(default)]
    pub improved_output: Option<ImprovedPayload>,
}

/// Outcome of one self-assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfAssessmentResult {
    pub assessor_id: String,
    /// Backend whose result was assessed
    pub assessed_backend: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub confidence: f64,
    pub reliability: f64,
    pub suggestions: Vec<String>,
    pub potential_errors: Vec<String>,
    /// Improved result produced by the assessor, if any
    pub improved: Option<TaskResult>,
    /// Maximum of the evaluation and improvement confidence
    pub final_confidence: f64,
    /// Whether the assessment itself failed
    pub degraded: bool,
}

/// Runs evaluation passes through the configured assessor backend
#[derive(Debug, Clone)]
pub struct SelfAssessor {
    registry: Arc<BackendRegistry>,
    assessor_id: String,
    config: AssessmentConfig,
}

impl SelfAssessor {
    /// Create an assessor. The assessor backend must be configured and
    /// registered.
    pub fn new(registry: Arc<BackendRegistry>, config: AssessmentConfig) -> Result<Self> {
        let assessor_id = config
            .assessor_backend
            .clone()
            .ok_or_else(|| Error::ConfigError("assessment.assessor_backend is not set".into()))?;
        registry.get(&assessor_id)?;

        Ok(Self {
            registry,
            assessor_id,
            config,
        })
    }

    pub fn assessor_id(&self) -> &str {
        &self.assessor_id
    }

    /// Assess `result`, produced for `request`
    pub async fn assess(
        &self,
        request: &TaskRequest,
        result: &TaskResult,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SelfAssessmentResult {
        let evaluation = match self.evaluate(request, result, timeout, cancel).await {
            Ok(evaluation) => evaluation,
            Err(err) => {
                warn!(
                    assessor_id = %self.assessor_id,
                    backend_id = %result.backend_id,
                    task_type = %request.task_type,
                    error = %err,
                    "Self-assessment failed, using degraded result"
                );
                return self.degraded(result, &err);
            }
        };
        let (payload, eval_result) = evaluation;

        let improved = if payload.confidence >= self.config.improvement_threshold {
            None
        } else if let Some(inline) = &payload.improved_output {
            Some(TaskResult {
                output: inline.output.clone(),
                confidence: inline.confidence.clamp(0.0, 1.0),
                ..eval_result
            })
        } else {
            self.improve(request, result, &payload, timeout, cancel).await
        };

        let final_confidence = improved
            .as_ref()
            .map_or(payload.confidence, |i| payload.confidence.max(i.confidence));

        info!(
            assessor_id = %self.assessor_id,
            backend_id = %result.backend_id,
            task_type = %request.task_type,
            confidence = payload.confidence,
            improved = improved.is_some(),
            final_confidence = final_confidence,
            "Self-assessment complete"
        );

        SelfAssessmentResult {
            assessor_id: self.assessor_id.clone(),
            assessed_backend: result.backend_id.clone(),
            strengths: payload.strengths,
            weaknesses: payload.weaknesses,
            confidence: payload.confidence,
            reliability: payload.reliability,
            suggestions: payload.suggestions,
            potential_errors: payload.potential_errors,
            improved,
            final_confidence,
            degraded: false,
        }
    }

    async fn evaluate(
        &self,
        request: &TaskRequest,
        result: &TaskResult,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(AssessmentPayload, TaskResult)> {
        let evaluation_request = self.derived_request(
            request,
            serde_json::json!({
                "mode": "evaluate",
                "task": request.task_type,
                "original_input": request.context,
                "original_output": result.output,
                "backend_id": result.backend_id,
            }),
        );

        let eval_result = self.call(&evaluation_request, timeout, cancel).await.map_err(
            |source| self.failure(request, source.to_string()),
        )?;

        let payload: AssessmentPayload = serde_json::from_value(eval_result.output.clone())
            .map_err(|e| self.failure(request, format!("malformed evaluation: {}", e)))?;

        for (name, value) in [
            ("confidence", payload.confidence),
            ("reliability", payload.reliability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(self.failure(
                    request,
                    format!("evaluation {} {} is outside [0, 1]", name, value),
                ));
            }
        }

        Ok((payload, eval_result))
    }

    async fn improve(
        &self,
        request: &TaskRequest,
        result: &TaskResult,
        payload: &AssessmentPayload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<TaskResult> {
        let improve_request = self.derived_request(
            request,
            serde_json::json!({
                "mode": "improve",
                "task": request.task_type,
                "original_input": request.context,
                "original_output": result.output,
                "weaknesses": payload.weaknesses,
                "suggestions": payload.suggestions,
            }),
        );

        match self.call(&improve_request, timeout, cancel).await {
            Ok(improved) => {
                debug!(
                    assessor_id = %self.assessor_id,
                    confidence = improved.confidence,
                    "Assessor produced improved output"
                );
                Some(improved)
            }
            Err(err) => {
                warn!(
                    assessor_id = %self.assessor_id,
                    task_type = %request.task_type,
                    error = %err,
                    "Improvement attempt failed, keeping evaluation"
                );
                None
            }
        }
    }

    async fn call(
        &self,
        request: &TaskRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TaskResult> {
        let backend = self.registry.get(&self.assessor_id)?;
        let executor = self.registry.executor(&self.assessor_id)?;
        execute_with_limits(backend, executor.as_ref(), request, timeout, cancel)
            .await
            .map_err(|source| Error::BackendExecution {
                backend_id: self.assessor_id.clone(),
                task_type: request.task_type.clone(),
                source,
            })
    }

    fn derived_request(&self, original: &TaskRequest, context: serde_json::Value) -> TaskRequest {
        let mut derived = TaskRequest::new(ASSESSMENT_TASK_TYPE, context)
            .with_priority(original.priority);
        derived.max_latency_ms = original.max_latency_ms;
        derived
    }

    fn failure(&self, request: &TaskRequest, message: String) -> Error {
        Error::Assessment {
            backend_id: self.assessor_id.clone(),
            task_type: request.task_type.clone(),
            message,
        }
    }

    fn degraded(&self, result: &TaskResult, err: &Error) -> SelfAssessmentResult {
        let confidence = self.config.degraded_confidence;
        SelfAssessmentResult {
            assessor_id: self.assessor_id.clone(),
            assessed_backend: result.backend_id.clone(),
            strengths: Vec::new(),
            weaknesses: vec![format!("Assessment could not be completed: {}", err)],
            confidence,
            reliability: confidence,
            suggestions: Vec::new(),
            potential_errors: Vec::new(),
            improved: None,
            final_confidence: confidence,
            degraded: true,
        }
    }
}
