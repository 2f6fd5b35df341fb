//! Weighted multi-criteria backend scoring
//!
//! Each eligible backend gets a score built from four terms:
//!
//! | term        | weight | source                                          |
//! |-------------|--------|-------------------------------------------------|
//! | reliability | 0.40   | static prior declared at registration           |
//! | history     | 0.30   | success rate for (backend, task type), else 0.5 |
//! | cost        | 0.20   | cheapest candidate cost / this cost             |
//! | speed       | 0.10   | fastest candidate latency / this latency        |
//!
//! High priority requests multiply the sum by 1.10. Ranking is by score,
//! then lowest declared cost, then registration order, so identical registry
//! and metrics state always produce the same choice.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{Backend, BackendFilter, BackendRegistry, Priority, TaskRequest};
use crate::error::{Error, Result};

/// Units of work used to estimate cost when filtering on `max_cost`
pub const NOMINAL_UNITS: u64 = 1000;

const RELIABILITY_WEIGHT: f64 = 0.40;
const HISTORY_WEIGHT: f64 = 0.30;
const COST_WEIGHT: f64 = 0.20;
const SPEED_WEIGHT: f64 = 0.10;
/// History term used when a backend has never run this task type
const DEFAULT_HISTORY_TERM: f64 = 0.15;
const HIGH_PRIORITY_MULTIPLIER: f64 = 1.10;

/// Per-term contributions to a backend's score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub reliability: f64,
    pub history: f64,
    pub cost: f64,
    pub speed: f64,
    /// 1.10 for high priority requests, otherwise 1.0
    pub priority_multiplier: f64,
    /// Whether the history term came from recorded metrics
    pub has_history: bool,
}

impl ScoreBreakdown {
    /// Weighted total including the priority multiplier
    pub fn total(&self) -> f64 {
        (self.reliability + self.history + self.cost + self.speed) * self.priority_multiplier
    }
}

/// A backend together with its score for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredBackend {
    pub backend_id: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    /// Declared cost per unit, kept for tie-breaking
    pub cost_per_unit: f64,
}

impl ScoredBackend {
    /// Short human-readable rendering of the score
    pub fn describe(&self) -> String {
        let b = &self.breakdown;
        let mut text = format!(
            "{} scored {:.3} (reliability {:.3}, history {:.3}{}, cost {:.3}, speed {:.3}",
            self.backend_id,
            self.score,
            b.reliability,
            b.history,
            if b.has_history { "" } else { " default" },
            b.cost,
            b.speed,
        );
        if b.priority_multiplier > 1.0 {
            text.push_str(", high-priority bonus");
        }
        text.push(')');
        text
    }
}

/// Ranks registered backends for a request
#[derive(Debug, Clone)]
pub struct Scorer {
    registry: Arc<BackendRegistry>,
    nominal_units: u64,
}

impl Scorer {
    /// Create a scorer over a registry
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            nominal_units: NOMINAL_UNITS,
        }
    }

    /// Override the nominal unit count used for cost filtering
    pub fn with_nominal_units(mut self, units: u64) -> Self {
        self.nominal_units = units.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Backends eligible for a request, in registration order
    pub fn eligible(&self, request: &TaskRequest) -> Vec<&Backend> {
        self.registry
            .list(&BackendFilter::for_request(request, self.nominal_units))
    }

    /// Score and rank every eligible backend, best first
    ///
    /// `history` maps backend ids to their success rate for the request's
    /// task type.
    pub fn rank(
        &self,
        request: &TaskRequest,
        history: &HashMap<String, f64>,
    ) -> Result<Vec<ScoredBackend>> {
        let candidates = self.eligible(request);
        if candidates.is_empty() {
            return Err(self.no_eligible(request));
        }

        let min_cost = candidates
            .iter()
            .map(|b| b.cost_per_unit)
            .fold(f64::INFINITY, f64::min);
        let min_latency = candidates
            .iter()
            .map(|b| b.avg_latency_ms)
            .min()
            .unwrap_or(0);

        let priority_multiplier = if request.priority == Priority::High {
            HIGH_PRIORITY_MULTIPLIER
        } else {
            1.0
        };

        let mut scored: Vec<(usize, ScoredBackend)> = candidates
            .iter()
            .map(|backend| {
                let success_rate = history.get(&backend.id).copied();
                let breakdown = ScoreBreakdown {
                    reliability: backend.reliability * RELIABILITY_WEIGHT,
                    history: success_rate
                        .map(|rate| rate.clamp(0.0, 1.0) * HISTORY_WEIGHT)
                        .unwrap_or(DEFAULT_HISTORY_TERM),
                    cost: inverse_ratio(min_cost, backend.cost_per_unit) * COST_WEIGHT,
                    speed: inverse_ratio(min_latency as f64, backend.avg_latency_ms as f64)
                        * SPEED_WEIGHT,
                    priority_multiplier,
                    has_history: success_rate.is_some(),
                };
                let position = self.registry.position(&backend.id).unwrap_or(usize::MAX);
                (
                    position,
                    ScoredBackend {
                        backend_id: backend.id.clone(),
                        score: breakdown.total(),
                        breakdown,
                        cost_per_unit: backend.cost_per_unit,
                    },
                )
            })
            .collect();

        scored.sort_by(|(pos_a, a), (pos_b, b)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.cost_per_unit.total_cmp(&b.cost_per_unit))
                .then_with(|| pos_a.cmp(pos_b))
        });

        let ranked: Vec<ScoredBackend> = scored.into_iter().map(|(_, s)| s).collect();

        debug!(
            task_type = %request.task_type,
            candidates = ranked.len(),
            best = %ranked[0].backend_id,
            score = ranked[0].score,
            "Ranked backends"
        );

        Ok(ranked)
    }

    /// Pick the single best backend for a request
    pub fn select_best(
        &self,
        request: &TaskRequest,
        history: &HashMap<String, f64>,
    ) -> Result<String> {
        self.rank(request, history)
            .map(|ranked| ranked[0].backend_id.clone())
    }

    fn no_eligible(&self, request: &TaskRequest) -> Error {
        let reason = if self.registry.is_empty() {
            "no backends are registered".to_string()
        } else {
            let mut parts = Vec::new();
            if !request.required_capabilities.is_empty() {
                let caps: Vec<&str> = request
                    .required_capabilities
                    .iter()
                    .map(String::as_str)
                    .collect();
                parts.push(format!("capabilities [{}]", caps.join(", ")));
            }
            if let Some(max_cost) = request.max_cost {
                parts.push(format!(
                    "max cost {} for {} units",
                    max_cost, self.nominal_units
                ));
            }
            format!("no registered backend satisfies {}", parts.join(" and "))
        };

        Error::NoEligibleBackend {
            task_type: request.task_type.clone(),
            reason,
        }
    }
}

/// `best / value`, where lower values are better. Zero or negative values
/// count as the best possible.
fn inverse_ratio(best: f64, value: f64) -> f64 {
    if value <= 0.0 {
        return 1.0;
    }
    match best.partial_cmp(&0.0) {
        Some(Ordering::Greater) => (best / value).clamp(0.0, 1.0),
        _ => 0.0,
    }
}
