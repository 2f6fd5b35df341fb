//! Types for backend selection
//!
//! This module defines the backend catalog and the request shape the scorer
//! and dispatcher work with.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatch::BackendExecutor;
use crate::error::{Error, Result};

/// Priority of a task request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// A unit of work submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task type (e.g. "menu_planning", "price_estimate")
    pub task_type: String,
    /// Task-specific payload handed to the backend untouched
    pub context: serde_json::Value,
    /// Request priority
    pub priority: Priority,
    /// Maximum cost for a nominal unit of work
    pub max_cost: Option<f64>,
    /// Maximum latency per backend call, in milliseconds
    pub max_latency_ms: Option<u64>,
    /// Capabilities every candidate backend must offer
    pub required_capabilities: BTreeSet<String>,
}

impl TaskRequest {
    /// Create a new request with defaults
    pub fn new(task_type: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            context,
            priority: Priority::Medium,
            max_cost: None,
            max_latency_ms: None,
            required_capabilities: BTreeSet::new(),
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set maximum cost constraint
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    /// Set maximum latency per backend call
    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    /// Require capabilities
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// An execution target with declared cost, latency, reliability and capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    /// Backend identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Provider name
    pub provider: String,
    /// Capability tags
    pub capabilities: BTreeSet<String>,
    /// Cost per unit of work
    pub cost_per_unit: f64,
    /// Average latency in milliseconds
    pub avg_latency_ms: u64,
    /// Static reliability prior (0.0 to 1.0)
    pub reliability: f64,
}

impl Backend {
    /// Create a new backend definition
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider: String::new(),
            capabilities: BTreeSet::new(),
            cost_per_unit: 0.001,
            avg_latency_ms: 1000,
            reliability: 0.9,
        }
    }

    /// Set display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set provider name
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Set capability tags
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set cost per unit of work
    pub fn with_cost_per_unit(mut self, cost: f64) -> Self {
        self.cost_per_unit = cost.max(0.0);
        self
    }

    /// Set average latency
    pub fn with_latency_ms(mut self, ms: u64) -> Self {
        self.avg_latency_ms = ms;
        self
    }

    /// Set reliability prior
    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability.clamp(0.0, 1.0);
        self
    }

    /// Estimate cost for a given amount of work
    pub fn estimate_cost(&self, units: u64) -> f64 {
        units as f64 * self.cost_per_unit
    }

    /// Whether this backend offers every required capability
    pub fn supports(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Filter for listing registry contents
#[derive(Debug, Clone, Default)]
pub struct BackendFilter {
    /// Capabilities a backend must offer
    pub capabilities: BTreeSet<String>,
    /// Maximum cost for `units` of work
    pub max_cost: Option<f64>,
    /// Units of work used to estimate cost against `max_cost`
    pub units: u64,
}

impl BackendFilter {
    /// Build the eligibility filter for a request
    pub fn for_request(request: &TaskRequest, nominal_units: u64) -> Self {
        Self {
            capabilities: request.required_capabilities.clone(),
            max_cost: request.max_cost,
            units: nominal_units,
        }
    }

    fn matches(&self, backend: &Backend) -> bool {
        if !backend.supports(&self.capabilities) {
            return false;
        }
        match self.max_cost {
            Some(max_cost) => backend.estimate_cost(self.units) <= max_cost,
            None => true,
        }
    }
}

struct RegisteredBackend {
    backend: Backend,
    executor: Arc<dyn BackendExecutor>,
}

/// Catalog of available backends and their executors
///
/// Backends are kept in registration order, which is the final tie-breaker
/// when scores and costs are equal.
#[derive(Default)]
pub struct BackendRegistry {
    entries: Vec<RegisteredBackend>,
    positions: HashMap<String, usize>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend with its executor
    ///
    /// Registering an id that already exists replaces the definition and
    /// executor but keeps the original position.
    pub fn register(&mut self, backend: Backend, executor: Arc<dyn BackendExecutor>) {
        let entry = RegisteredBackend { backend, executor };
        match self.positions.get(&entry.backend.id) {
            Some(&position) => {
                tracing::debug!(backend_id = %entry.backend.id, "Replacing backend definition");
                self.entries[position] = entry;
            }
            None => {
                self.positions
                    .insert(entry.backend.id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Get a backend by id
    pub fn get(&self, id: &str) -> Result<&Backend> {
        self.positions
            .get(id)
            .map(|&p| &self.entries[p].backend)
            .ok_or_else(|| Error::BackendNotFound(id.to_string()))
    }

    /// Get the executor registered for a backend
    pub fn executor(&self, id: &str) -> Result<Arc<dyn BackendExecutor>> {
        self.positions
            .get(id)
            .map(|&p| self.entries[p].executor.clone())
            .ok_or_else(|| Error::BackendNotFound(id.to_string()))
    }

    /// Registration position of a backend
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// All backends in registration order
    pub fn all(&self) -> impl Iterator<Item = &Backend> {
        self.entries.iter().map(|e| &e.backend)
    }

    /// Backend ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.all().map(|b| b.id.clone()).collect()
    }

    /// Backends matching a filter, in registration order
    pub fn list(&self, filter: &BackendFilter) -> Vec<&Backend> {
        self.all().filter(|b| filter.matches(b)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}
