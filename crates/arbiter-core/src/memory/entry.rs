//! Context entry types

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Feedback left by a user on a stored execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    pub helpful: bool,
    /// Rating from 1 to 5
    pub rating: Option<u8>,
}

impl UserFeedback {
    pub fn new(helpful: bool) -> Self {
        Self {
            helpful,
            rating: None,
        }
    }

    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }
}

/// Cost and timing of the execution an entry records
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub latency_ms: u64,
    pub cost: f64,
    pub units: u64,
}

/// A stored record of one past execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: Uuid,
    pub task_type: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub backend_id: String,
    /// Confidence (0.0 to 1.0)
    pub confidence: f64,
    pub tags: BTreeSet<String>,
    pub feedback: Option<UserFeedback>,
    /// Ids of related entries, in link order
    pub related: Vec<Uuid>,
    pub metadata: ExecutionMetadata,
    pub created_at: DateTime<Utc>,
}

impl ContextEntry {
    /// Materialize an entry with a fresh id
    pub fn from_new(entry: NewContextEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: entry.task_type,
            input: entry.input,
            output: entry.output,
            backend_id: entry.backend_id,
            confidence: entry.confidence,
            tags: entry.tags,
            feedback: entry.feedback,
            related: Vec::new(),
            metadata: entry.metadata,
            created_at,
        }
    }

    /// Age in fractional days relative to `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_fields(
            &self.task_type,
            &self.backend_id,
            self.confidence,
            self.feedback,
        )
    }
}

/// An entry to ingest; id and timestamp are assigned on add
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContextEntry {
    pub task_type: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub backend_id: String,
    pub confidence: f64,
    pub tags: BTreeSet<String>,
    pub feedback: Option<UserFeedback>,
    pub metadata: ExecutionMetadata,
}

impl NewContextEntry {
    pub fn new(
        task_type: impl Into<String>,
        backend_id: impl Into<String>,
        input: serde_json::Value,
        output: serde_json::Value,
        confidence: f64,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            input,
            output,
            backend_id: backend_id.into(),
            confidence,
            tags: BTreeSet::new(),
            feedback: None,
            metadata: ExecutionMetadata::default(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_feedback(mut self, feedback: UserFeedback) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_fields(
            &self.task_type,
            &self.backend_id,
            self.confidence,
            self.feedback,
        )
    }
}

fn validate_fields(
    task_type: &str,
    backend_id: &str,
    confidence: f64,
    feedback: Option<UserFeedback>,
) -> Result<()> {
    if task_type.trim().is_empty() {
        return Err(Error::invalid("context entry task type is empty"));
    }
    if backend_id.trim().is_empty() {
        return Err(Error::invalid("context entry backend id is empty"));
    }
    if !(0.0..=1.0).contains(&confidence) {
        return Err(Error::invalid(format!(
            "context entry confidence {} is outside [0, 1]",
            confidence
        )));
    }
    match feedback.and_then(|f| f.rating) {
        Some(rating) if !(1..=5).contains(&rating) => Err(Error::invalid(format!(
            "feedback rating {} is outside 1-5",
            rating
        ))),
        _ => Ok(()),
    }
}
