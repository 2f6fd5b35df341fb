//! Backend selection
//!
//! This module decides which backend should run a task. The key components are:
//!
//! - **Backend Registry**: Catalog of available backends with their
//!   capabilities, pricing, latency, reliability and executor handle.
//!
//! - **Scorer**: Weighted multi-criteria ranking of eligible backends.
//!
//! - **Metrics Tracker**: Rolling per-(backend, task type) statistics that feed
//!   the scorer's history term and the aggregate report.
//!
//! ## How It Works
//!
//! 1. Candidates are filtered by capability requirements and the cost ceiling
//! 2. Each candidate is scored on reliability, history, cost and speed
//! 3. The best candidate runs the task
//! 4. After execution, the outcome is recorded to improve future selections
//!
//! ## Example
//!
//! ```rust,ignore
//! use arbiter_core::routing::{Backend, BackendRegistry, MetricsTracker, Scorer, TaskRequest};
//!
//! let mut registry = BackendRegistry::new();
//! registry.register(Backend::new("fast").with_cost_per_unit(0.0005), fast_executor);
//! registry.register(Backend::new("balanced").with_reliability(0.95), balanced_executor);
//!
//! let scorer = Scorer::new(Arc::new(registry));
//! let metrics = MetricsTracker::new();
//!
//! let request = TaskRequest::new("menu_planning", serde_json::json!({"guests": 40}));
//! let history = metrics.success_rates(&request.task_type).await;
//! let backend_id = scorer.select_best(&request, &history)?;
//! ```

mod metrics;
mod scorer;
mod types;

pub use metrics::{BackendReport, Metric, MetricsReport, MetricsTracker};
pub use scorer::{ScoreBreakdown, ScoredBackend, Scorer, NOMINAL_UNITS};
pub use types::{Backend, BackendFilter, BackendRegistry, Priority, TaskRequest};
