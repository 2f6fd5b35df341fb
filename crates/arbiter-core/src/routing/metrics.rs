//! Rolling per-(backend, task type) execution metrics
//!
//! The tracker is the scorer's source of history and the basis of the
//! aggregate report. Each update takes the write lock for exactly one
//! record, so concurrent requests never interleave a read-modify-write.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::dispatch::TaskResult;
use crate::memory::{ContextMemory, MemoryStats};

/// Statistics for a (backend, task type) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// The backend id
    pub backend_id: String,
    /// The task type
    pub task_type: String,
    /// Running success rate (0.0 to 1.0)
    pub success_rate: f64,
    /// Average confidence over successful executions
    pub avg_confidence: f64,
    /// Average latency in ms (mean of the previous average and the newest value)
    pub avg_latency_ms: f64,
    /// Average observed cost over successful executions
    pub avg_cost: f64,
    /// Confidence per unit of cost
    pub cost_efficiency: f64,
    /// Total number of executions
    pub total_uses: u64,
    /// Number of executions that produced a result
    pub results: u64,
    /// When this record last changed
    pub last_updated: DateTime<Utc>,
}

impl Metric {
    /// Create an empty record
    pub fn new(backend_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            task_type: task_type.into(),
            success_rate: 0.0,
            avg_confidence: 0.0,
            avg_latency_ms: 0.0,
            avg_cost: 0.0,
            cost_efficiency: 0.0,
            total_uses: 0,
            results: 0,
            last_updated: Utc::now(),
        }
    }

    /// Fold one execution into the record
    pub fn update(&mut self, result: Option<&TaskResult>, success: bool) {
        self.total_uses += 1;
        let n = self.total_uses as f64;
        let hit = if success { 1.0 } else { 0.0 };
        self.success_rate = ((self.success_rate * (n - 1.0) + hit) / n).clamp(0.0, 1.0);

        if let Some(result) = result {
            let latency = result.latency_ms as f64;
            self.avg_latency_ms = if self.total_uses == 1 || self.avg_latency_ms == 0.0 {
                latency
            } else {
                (self.avg_latency_ms + latency) / 2.0
            };

            if success {
                self.results += 1;
                let r = self.results as f64;
                self.avg_confidence += (result.confidence - self.avg_confidence) / r;
                self.avg_cost += (result.cost - self.avg_cost) / r;
                self.cost_efficiency = if self.avg_cost > 0.0 {
                    self.avg_confidence / self.avg_cost
                } else {
                    self.avg_confidence
                };
            }
        }

        self.last_updated = Utc::now();
    }
}

/// Per-backend aggregate across all task types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReport {
    pub backend_id: String,
    /// Mean of the per-task-type success rates
    pub avg_success_rate: f64,
    /// Sum of uses across task types
    pub total_uses: u64,
    /// Mean of the per-task-type latencies
    pub avg_latency_ms: f64,
    /// Task types this backend has run
    pub task_types: Vec<String>,
}

/// Aggregate report across backends plus a context memory snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    /// Backends sorted by id
    pub backends: Vec<BackendReport>,
    pub memory: MemoryStats,
}

impl MetricsReport {
    /// Report for one backend
    pub fn backend(&self, backend_id: &str) -> Option<&BackendReport> {
        self.backends.iter().find(|b| b.backend_id == backend_id)
    }
}

type MetricKey = (String, String);

/// Tracker for rolling execution metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsTracker {
    metrics: Arc<RwLock<HashMap<MetricKey, Metric>>>,
}

impl MetricsTracker {
    /// Create a new empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution
    pub async fn record(
        &self,
        backend_id: &str,
        task_type: &str,
        result: Option<&TaskResult>,
        success: bool,
    ) -> Metric {
        let mut metrics = self.metrics.write().await;
        let metric = metrics
            .entry((backend_id.to_string(), task_type.to_string()))
            .or_insert_with(|| Metric::new(backend_id, task_type));
        metric.update(result, success);

        debug!(
            backend_id = %backend_id,
            task_type = %task_type,
            success = success,
            success_rate = metric.success_rate,
            total_uses = metric.total_uses,
            "Recorded execution metric"
        );

        metric.clone()
    }

    /// Get the record for a (backend, task type) pair
    pub async fn get(&self, backend_id: &str, task_type: &str) -> Option<Metric> {
        self.metrics
            .read()
            .await
            .get(&(backend_id.to_string(), task_type.to_string()))
            .cloned()
    }

    /// Success rates by backend id for one task type
    pub async fn success_rates(&self, task_type: &str) -> HashMap<String, f64> {
        self.metrics
            .read()
            .await
            .values()
            .filter(|m| m.task_type == task_type && m.total_uses > 0)
            .map(|m| (m.backend_id.clone(), m.success_rate))
            .collect()
    }

    /// Snapshot of every record
    pub async fn all(&self) -> Vec<Metric> {
        let mut all: Vec<Metric> = self.metrics.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.backend_id
                .cmp(&b.backend_id)
                .then_with(|| a.task_type.cmp(&b.task_type))
        });
        all
    }

    /// Aggregate per-backend statistics with a context memory snapshot
    pub async fn report(&self, memory: &ContextMemory) -> MetricsReport {
        let mut grouped: BTreeMap<String, Vec<Metric>> = BTreeMap::new();
        for metric in self.all().await {
            grouped
                .entry(metric.backend_id.clone())
                .or_default()
                .push(metric);
        }

        let backends = grouped
            .into_iter()
            .map(|(backend_id, metrics)| {
                let count = metrics.len() as f64;
                BackendReport {
                    avg_success_rate: metrics.iter().map(|m| m.success_rate).sum::<f64>() / count,
                    total_uses: metrics.iter().map(|m| m.total_uses).sum(),
                    avg_latency_ms: metrics.iter().map(|m| m.avg_latency_ms).sum::<f64>() / count,
                    task_types: metrics.into_iter().map(|m| m.task_type).collect(),
                    backend_id,
                }
            })
            .collect();

        MetricsReport {
            generated_at: Utc::now(),
            backends,
            memory: memory.stats().await,
        }
    }
}
