//! Dispatcher - selection, execution, cross-checking and bookkeeping

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{ExecutionError, TaskResult, execute_with_limits};
use crate::assessment::{SelfAssessmentResult, SelfAssessor};
use crate::config::{Config, DispatchConfig};
use crate::error::{Error, Result};
use crate::memory::{ContextEntry, ContextMemory, ContextQuery, ExecutionMetadata, NewContextEntry};
use crate::routing::{BackendRegistry, MetricsReport, MetricsTracker, ScoredBackend, Scorer, TaskRequest};

/// Caller-visible result of one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationOutcome {
    pub request_id: Uuid,
    pub task_type: String,
    /// Backend whose execution produced the candidate result
    pub selected_backend: String,
    /// Final result, possibly replaced by the assessor's improvement
    pub result: TaskResult,
    /// Other results considered for this request
    pub alternatives: Vec<TaskResult>,
    pub justification: String,
    pub confidence: f64,
    pub assessment: Option<SelfAssessmentResult>,
    pub fallback_used: bool,
    /// Context memory entry written for this request
    pub memory_entry: Option<Uuid>,
}

/// One backend call made while handling a request
struct Attempt {
    backend_id: String,
    outcome: std::result::Result<TaskResult, ExecutionError>,
}

/// Orchestrates requests across registered backends
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: DispatchConfig,
    registry: Arc<BackendRegistry>,
    scorer: Scorer,
    assessor: SelfAssessor,
    metrics: MetricsTracker,
    memory: ContextMemory,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Run a request end to end
    pub async fn submit(&self, request: TaskRequest) -> Result<OrchestrationOutcome> {
        let request_id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let timeout = self.timeout_for(&request);

        let history = self.metrics.success_rates(&request.task_type).await;
        let ranked = self.scorer.rank(&request, &history)?;
        let primary = &ranked[0];

        info!(
            request_id = %request_id,
            task_type = %request.task_type,
            backend_id = %primary.backend_id,
            score = primary.score,
            "Selected backend"
        );

        let mut justification = vec![format!("Selected {}", primary.describe())];
        let mut attempts = Vec::new();

        // Primary, then at most one fallback
        let primary_outcome = self.run(&primary.backend_id, &request, timeout, &cancel).await;
        attempts.push(Attempt {
            backend_id: primary.backend_id.clone(),
            outcome: primary_outcome.clone(),
        });

        let (mut candidate, mut selected_backend, fallback_used) = match primary_outcome {
            Ok(result) => (result, primary.backend_id.clone(), false),
            Err(ExecutionError::Cancelled) => {
                return Err(self.cancelled(&request, &primary.backend_id));
            }
            Err(primary_err) => {
                warn!(
                    request_id = %request_id,
                    backend_id = %primary.backend_id,
                    task_type = %request.task_type,
                    error = %primary_err,
                    "Primary execution failed"
                );

                let Some(fallback_id) = self.fallback_for(&ranked, &attempts) else {
                    self.record_attempts(&request.task_type, &attempts).await;
                    return Err(Error::AllBackendsFailed {
                        task_type: request.task_type.clone(),
                        backend_ids: attempted_ids(&attempts),
                        source: primary_err,
                    });
                };

                info!(
                    request_id = %request_id,
                    backend_id = %fallback_id,
                    task_type = %request.task_type,
                    "Retrying on fallback backend"
                );

                let fallback_outcome = self.run(&fallback_id, &request, timeout, &cancel).await;
                attempts.push(Attempt {
                    backend_id: fallback_id.clone(),
                    outcome: fallback_outcome.clone(),
                });

                match fallback_outcome {
                    Ok(result) => {
                        let penalized = result.penalized(self.config.fallback_penalty);
                        justification.push(format!(
                            "{} failed ({}); fell back to {} with confidence {:.2} penalized to {:.2}",
                            primary.backend_id,
                            primary_err,
                            fallback_id,
                            result.confidence,
                            penalized.confidence
                        ));
                        (penalized, fallback_id, true)
                    }
                    Err(ExecutionError::Cancelled) => {
                        return Err(self.cancelled(&request, &fallback_id));
                    }
                    Err(fallback_err) => {
                        warn!(
                            request_id = %request_id,
                            backend_id = %fallback_id,
                            task_type = %request.task_type,
                            error = %fallback_err,
                            "Fallback execution failed"
                        );
                        self.record_attempts(&request.task_type, &attempts).await;
                        return Err(Error::AllBackendsFailed {
                            task_type: request.task_type.clone(),
                            backend_ids: attempted_ids(&attempts),
                            source: fallback_err,
                        });
                    }
                }
            }
        };

        // Cross-check weak results
        let mut alternatives = Vec::new();
        if candidate.confidence < self.config.alternative_threshold {
            let alternative_ids: Vec<String> = ranked
                .iter()
                .map(|s| s.backend_id.clone())
                .filter(|id| !attempts.iter().any(|a| &a.backend_id == id))
                .take(self.config.max_alternatives)
                .collect();

            if !alternative_ids.is_empty() {
                debug!(
                    request_id = %request_id,
                    task_type = %request.task_type,
                    confidence = candidate.confidence,
                    alternatives = ?alternative_ids,
                    "Running alternatives"
                );

                let settled = self
                    .run_alternatives(&alternative_ids, &request, timeout, &cancel)
                    .await;
                if cancel.is_cancelled() {
                    return Err(self.cancelled(&request, &selected_backend));
                }

                let mut successes = Vec::new();
                for attempt in settled {
                    match &attempt.outcome {
                        Ok(result) => successes.push(result.clone()),
                        Err(err) => warn!(
                            request_id = %request_id,
                            backend_id = %attempt.backend_id,
                            task_type = %request.task_type,
                            error = %err,
                            "Alternative execution failed"
                        ),
                    }
                    attempts.push(attempt);
                }

                let best = successes
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.confidence > candidate.confidence)
                    .max_by(|(ia, a), (ib, b)| {
                        a.confidence.total_cmp(&b.confidence).then_with(|| ib.cmp(ia))
                    })
                    .map(|(i, _)| i);

                match best {
                    Some(index) => {
                        let better = successes.remove(index);
                        justification.push(format!(
                            "{} confidence {:.2} was below {:.2}; switched to {} at {:.2} (+{:.2})",
                            selected_backend,
                            candidate.confidence,
                            self.config.alternative_threshold,
                            better.backend_id,
                            better.confidence,
                            better.confidence - candidate.confidence
                        ));
                        selected_backend = better.backend_id.clone();
                        alternatives.push(std::mem::replace(&mut candidate, better));
                        alternatives.extend(successes);
                    }
                    None => {
                        justification.push(format!(
                            "{} confidence {:.2} was below {:.2}; no alternative did better",
                            selected_backend, candidate.confidence, self.config.alternative_threshold
                        ));
                        alternatives = successes;
                    }
                }
            }
        }

        self.record_attempts(&request.task_type, &attempts).await;

        // Second opinion
        let mut assessment = None;
        if candidate.confidence < self.config.assessment_threshold {
            if cancel.is_cancelled() {
                return Err(self.cancelled(&request, &selected_backend));
            }

            let assessed = self
                .assessor
                .assess(&request, &candidate, timeout, &cancel)
                .await;
            if cancel.is_cancelled() {
                return Err(self.cancelled(&request, &selected_backend));
            }

            match &assessed.improved {
                Some(improved) if improved.confidence > candidate.confidence => {
                    justification.push(format!(
                        "self-assessment by {} raised confidence from {:.2} to {:.2}",
                        assessed.assessor_id, candidate.confidence, improved.confidence
                    ));
                    candidate = improved.clone();
                }
                _ if assessed.degraded => {
                    justification.push(format!(
                        "self-assessment by {} unavailable; kept result",
                        assessed.assessor_id
                    ));
                }
                _ => {
                    justification.push(format!(
                        "self-assessment by {} rated confidence {:.2}; kept result",
                        assessed.assessor_id, assessed.confidence
                    ));
                }
            }
            assessment = Some(assessed);
        }

        let memory_entry = self.remember(&request, &candidate).await;

        info!(
            request_id = %request_id,
            task_type = %request.task_type,
            backend_id = %candidate.backend_id,
            confidence = candidate.confidence,
            fallback_used = fallback_used,
            alternatives = alternatives.len(),
            "Request complete"
        );

        Ok(OrchestrationOutcome {
            request_id,
            task_type: request.task_type,
            selected_backend,
            confidence: candidate.confidence,
            result: candidate,
            alternatives,
            justification: justification.join("; "),
            assessment,
            fallback_used,
            memory_entry,
        })
    }

    /// Aggregate metrics with a context memory snapshot
    pub async fn report(&self) -> MetricsReport {
        self.metrics.report(&self.memory).await
    }

    /// Past executions matching a filter
    pub async fn query(&self, query: &ContextQuery) -> Vec<ContextEntry> {
        self.memory.query(query).await
    }

    /// Cancel every in-flight and future backend call
    pub fn shutdown(&self) {
        info!("Dispatcher shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    pub fn memory(&self) -> &ContextMemory {
        &self.memory
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn timeout_for(&self, request: &TaskRequest) -> Duration {
        request
            .max_latency_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.config.default_timeout_secs))
    }

    async fn run(
        &self,
        backend_id: &str,
        request: &TaskRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<TaskResult, ExecutionError> {
        let (backend, executor) = match (
            self.registry.get(backend_id),
            self.registry.executor(backend_id),
        ) {
            (Ok(backend), Ok(executor)) => (backend, executor),
            _ => {
                return Err(ExecutionError::Backend(format!(
                    "backend '{}' is not registered",
                    backend_id
                )));
            }
        };

        let outcome = execute_with_limits(backend, executor.as_ref(), request, timeout, cancel).await;
        match &outcome {
            Ok(result) => debug!(
                backend_id = %backend_id,
                task_type = %request.task_type,
                confidence = result.confidence,
                latency_ms = result.latency_ms,
                "Backend call succeeded"
            ),
            Err(err) => debug!(
                backend_id = %backend_id,
                task_type = %request.task_type,
                error = %err,
                "Backend call failed"
            ),
        }
        outcome
    }

    /// Run alternatives concurrently and wait for all of them to settle
    async fn run_alternatives(
        &self,
        backend_ids: &[String],
        request: &TaskRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Vec<Attempt> {
        join_all(backend_ids.iter().map(|backend_id| async move {
            Attempt {
                backend_id: backend_id.clone(),
                outcome: self.run(backend_id, request, timeout, cancel).await,
            }
        }))
        .await
    }

    /// Next-ranked backend not yet tried, else any other registered backend
    fn fallback_for(&self, ranked: &[ScoredBackend], attempts: &[Attempt]) -> Option<String> {
        let tried = |id: &String| attempts.iter().any(|a| &a.backend_id == id);
        ranked
            .iter()
            .map(|s| s.backend_id.clone())
            .find(|id| !tried(id))
            .or_else(|| self.registry.ids().into_iter().find(|id| !tried(id)))
    }

    /// Fold every finished call into the metrics tracker
    async fn record_attempts(&self, task_type: &str, attempts: &[Attempt]) {
        for attempt in attempts {
            match &attempt.outcome {
                Ok(result) => {
                    self.metrics
                        .record(&attempt.backend_id, task_type, Some(result), true)
                        .await;
                }
                Err(ExecutionError::Cancelled) => {}
                Err(_) => {
                    self.metrics
                        .record(&attempt.backend_id, task_type, None, false)
                        .await;
                }
            }
        }
    }

    async fn remember(&self, request: &TaskRequest, result: &TaskResult) -> Option<Uuid> {
        let entry = NewContextEntry::new(
            request.task_type.clone(),
            result.backend_id.clone(),
            request.context.clone(),
            result.output.clone(),
            result.confidence,
        )
        .with_tags(request.required_capabilities.iter().cloned())
        .with_metadata(ExecutionMetadata {
            latency_ms: result.latency_ms,
            cost: result.cost,
            units: result.units,
        });

        match self.memory.add(entry).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(
                    task_type = %request.task_type,
                    backend_id = %result.backend_id,
                    error = %err,
                    "Failed to store context entry"
                );
                None
            }
        }
    }

    fn cancelled(&self, request: &TaskRequest, backend_id: &str) -> Error {
        Error::BackendExecution {
            backend_id: backend_id.to_string(),
            task_type: request.task_type.clone(),
            source: ExecutionError::Cancelled,
        }
    }
}

fn attempted_ids(attempts: &[Attempt]) -> Vec<String> {
    attempts.iter().map(|a| a.backend_id.clone()).collect()
}

/// Builder for Dispatcher
pub struct DispatcherBuilder {
    config: Config,
    registry: Option<Arc<BackendRegistry>>,
    metrics: Option<MetricsTracker>,
    memory: Option<ContextMemory>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            registry: None,
            metrics: None,
            memory: None,
        }
    }

    /// Set configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the assessor backend
    pub fn assessor(mut self, backend_id: impl Into<String>) -> Self {
        self.config.assessment.assessor_backend = Some(backend_id.into());
        self
    }

    /// Set backend registry
    pub fn registry(mut self, registry: Arc<BackendRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share an existing metrics tracker
    pub fn metrics(mut self, metrics: MetricsTracker) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share an existing context memory
    pub fn memory(mut self, memory: ContextMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Build the dispatcher
    pub fn build(self) -> Result<Dispatcher> {
        self.config
            .validate()
            .map_err(|e| Error::ConfigError(format!("{:#}", e)))?;

        let registry = self
            .registry
            .ok_or_else(|| Error::ConfigError("a backend registry is required".into()))?;
        let assessor = SelfAssessor::new(registry.clone(), self.config.assessment.clone())?;
        let scorer =
            Scorer::new(registry.clone()).with_nominal_units(self.config.dispatch.nominal_units);

        Ok(Dispatcher {
            memory: self
                .memory
                .unwrap_or_else(|| ContextMemory::with_config(self.config.memory.clone())),
            metrics: self.metrics.unwrap_or_default(),
            config: self.config.dispatch,
            registry,
            scorer,
            assessor,
            shutdown: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BackendExecutor, ExecutionOutput};
    use crate::routing::Backend;
    use async_trait::async_trait;

    struct Fixed(f64);

    #[async_trait]
    impl BackendExecutor for Fixed {
        async fn execute(
            &self,
            request: &TaskRequest,
        ) -> std::result::Result<ExecutionOutput, ExecutionError> {
            if request.task_type == crate::assessment::ASSESSMENT_TASK_TYPE {
                return Ok(ExecutionOutput::new(
                    serde_json::json!({"confidence": 0.95, "reliability": 0.9}),
                    1.0,
                ));
            }
            Ok(ExecutionOutput::new(serde_json::json!({"answer": 42}), self.0).with_units(100))
        }
    }

    fn registry() -> Arc<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        registry.register(
            Backend::new("fast").with_cost_per_unit(0.0005),
            Arc::new(Fixed(0.95)),
        );
        registry.register(
            Backend::new("creative").with_cost_per_unit(0.003),
            Arc::new(Fixed(0.99)),
        );
        Arc::new(registry)
    }

    #[test]
    fn test_build_requires_assessor() {
        let err = Dispatcher::builder()
            .registry(registry())
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "E600");
    }

    #[test]
    fn test_build_requires_registry() {
        let err = Dispatcher::builder().assessor("creative").build().unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.dispatch.fallback_penalty = 2.0;

        let err = Dispatcher::builder()
            .registry(registry())
            .config(config)
            .assessor("creative")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("fallback_penalty"));
    }

    #[test]
    fn test_timeout_policy() {
        let dispatcher = Dispatcher::builder()
            .registry(registry())
            .assessor("creative")
            .build()
            .unwrap();

        let request = TaskRequest::new("pricing", serde_json::Value::Null);
        assert_eq!(dispatcher.timeout_for(&request), Duration::from_secs(60));
        assert_eq!(
            dispatcher.timeout_for(&request.with_max_latency_ms(250)),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn test_confident_result_skips_cross_checks() {
        let dispatcher = Dispatcher::builder()
            .registry(registry())
            .assessor("creative")
            .build()
            .unwrap();

        let outcome = dispatcher
            .submit(TaskRequest::new("pricing", serde_json::json!({"item": "rice"})))
            .await
            .unwrap();

        assert_eq!(outcome.selected_backend, "fast");
        assert_eq!(outcome.confidence, 0.95);
        assert!(outcome.alternatives.is_empty());
        assert!(outcome.assessment.is_none());
        assert!(!outcome.fallback_used);
        assert!((outcome.result.cost - 0.05).abs() < 1e-9);
        assert!(outcome.justification.starts_with("Selected fast scored"));

        let entry = dispatcher
            .memory()
            .get(outcome.memory_entry.unwrap())
            .await
            .unwrap();
        assert_eq!(entry.backend_id, "fast");
        assert_eq!(entry.metadata.units, 100);

        let metric = dispatcher.metrics().get("fast", "pricing").await.unwrap();
        assert_eq!(metric.total_uses, 1);
        assert_eq!(metric.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_cancelled() {
        let dispatcher = Dispatcher::builder()
            .registry(registry())
            .assessor("creative")
            .build()
            .unwrap();

        dispatcher.shutdown();
        assert!(dispatcher.is_shut_down());

        let err = dispatcher
            .submit(TaskRequest::new("pricing", serde_json::Value::Null))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::BackendExecution {
                source: ExecutionError::Cancelled,
                ..
            }
        ));
        assert!(dispatcher.metrics().all().await.is_empty());
        assert!(dispatcher.memory().is_empty().await);
    }
}
