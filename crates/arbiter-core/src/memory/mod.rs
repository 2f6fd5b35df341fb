//! Indexed context memory
//!
//! Stores one [`ContextEntry`] per past execution and answers filtered
//! queries, similarity lookups and suggestion requests. Entries are indexed
//! by tag, task type and backend id, and each new entry is linked both ways
//! to its most similar predecessors.
//!
//! # Usage
//!
//! ```rust,ignore
//! use arbiter_core::memory::{ContextMemory, ContextQuery, NewContextEntry};
//!
//! let memory = ContextMemory::new();
//! let id = memory
//!     .add(NewContextEntry::new("pricing", "fast", input, output, 0.9).with_tags(["dairy"]))
//!     .await?;
//!
//! let hits = memory
//!     .query(&ContextQuery::new().with_task_type("pricing").with_tags(["dairy"]))
//!     .await;
//! ```

mod entry;
mod index;
mod similarity;

pub use entry::{ContextEntry, ExecutionMetadata, NewContextEntry, UserFeedback};
pub use index::{ContextIndex, LinkGraph};
pub use similarity::{
    similarity, similarity_with_tokens, time_decay, tokens, word_overlap, words,
};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::{Error, Result};

/// Filter for [`ContextMemory::query`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextQuery {
    pub task_type: Option<String>,
    /// Matches entries carrying any of these tags
    pub tags: BTreeSet<String>,
    /// Matches entries produced by any of these backends
    pub backends: BTreeSet<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}

impl ContextQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backends = backends.into_iter().map(Into::into).collect();
        self
    }

    /// Only entries created in `[since, until]`
    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn with_min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &ContextEntry) -> bool {
        self.since.is_none_or(|since| entry.created_at >= since)
            && self.until.is_none_or(|until| entry.created_at <= until)
            && self
                .min_confidence
                .is_none_or(|min| entry.confidence >= min)
    }
}

/// An entry with a similarity or relevance score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMatch {
    pub entry: ContextEntry,
    pub score: f64,
}

/// Aggregate feedback over stored entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub entries_with_feedback: usize,
    pub helpful: usize,
    pub avg_rating: Option<f64>,
}

/// Aggregate statistics for the memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_entries: usize,
    pub avg_confidence: f64,
    pub task_types: BTreeMap<String, usize>,
    pub backends: BTreeMap<String, usize>,
    pub total_cost: f64,
    pub feedback: FeedbackStats,
    pub total_links: usize,
    pub oldest_at: Option<DateTime<Utc>>,
    pub newest_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<Uuid, ContextEntry>,
    index: ContextIndex,
    links: LinkGraph,
    /// Input tokens per entry, extracted once at insert
    tokens: HashMap<Uuid, HashSet<String>>,
}

impl MemoryState {
    fn store(&mut self, entry: ContextEntry, entry_tokens: HashSet<String>) {
        self.index.insert(&entry);
        self.tokens.insert(entry.id, entry_tokens);
        self.entries.insert(entry.id, entry);
    }

    fn remove(&mut self, id: Uuid) {
        self.entries.remove(&id);
        self.tokens.remove(&id);
        self.links.unlink_all(id);
    }

    /// Entry with its related ids filled in from the link graph
    fn materialize(&self, entry: &ContextEntry) -> ContextEntry {
        let mut entry = entry.clone();
        entry.related = self.links.related(entry.id).to_vec();
        entry
    }

    /// Other entries ranked by similarity to `target`, best first
    fn ranked_similar(
        &self,
        target: &ContextEntry,
        target_tokens: &HashSet<String>,
    ) -> Vec<(f64, &ContextEntry)> {
        let mut ranked: Vec<(f64, &ContextEntry)> = self
            .entries
            .values()
            .filter(|other| other.id != target.id)
            .map(|other| {
                let score = match self.tokens.get(&other.id) {
                    Some(other_tokens) => {
                        similarity_with_tokens(target, target_tokens, other, other_tokens)
                    }
                    None => similarity(target, other),
                };
                (score, other)
            })
            .collect();
        ranked.sort_by(|a, b| by_score_then_newest(*a, *b));
        ranked
    }
}

fn by_score_then_newest(a: (f64, &ContextEntry), b: (f64, &ContextEntry)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        .then_with(|| a.1.id.cmp(&b.1.id))
}

/// In-memory store of past executions
#[derive(Debug, Clone)]
pub struct ContextMemory {
    config: MemoryConfig,
    state: Arc<RwLock<MemoryState>>,
}

impl Default for ContextMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextMemory {
    /// Create an empty memory with default settings
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Store a new entry and link it to its most similar predecessors
    pub async fn add(&self, entry: NewContextEntry) -> Result<Uuid> {
        entry.validate()?;
        let entry = ContextEntry::from_new(entry, Utc::now());
        let id = entry.id;
        let entry_tokens = tokens(&entry.input);

        let mut state = self.state.write().await;
        let similar: Vec<Uuid> = state
            .ranked_similar(&entry, &entry_tokens)
            .into_iter()
            .filter(|(score, _)| *score > 0.0)
            .take(self.config.max_related)
            .map(|(_, other)| other.id)
            .collect();

        for other in &similar {
            state.links.link(id, *other);
        }
        state.store(entry, entry_tokens);

        debug!(
            entry_id = %id,
            linked = similar.len(),
            total_entries = state.entries.len(),
            "Added context entry"
        );

        Ok(id)
    }

    /// Restore a previously exported entry with its id and timestamp
    ///
    /// Links to related entries already present are restored; no similarity
    /// search is run.
    pub async fn import(&self, entry: ContextEntry) -> Result<()> {
        entry.validate()?;
        let entry_tokens = tokens(&entry.input);

        let mut state = self.state.write().await;
        if state.entries.contains_key(&entry.id) {
            return Err(Error::invalid(format!(
                "context entry '{}' already exists",
                entry.id
            )));
        }

        for related in &entry.related {
            if state.entries.contains_key(related) {
                state.links.link(entry.id, *related);
            }
        }
        state.store(
            ContextEntry {
                related: Vec::new(),
                ..entry
            },
            entry_tokens,
        );

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<ContextEntry> {
        let state = self.state.read().await;
        state
            .entries
            .get(&id)
            .map(|entry| state.materialize(entry))
            .ok_or_else(|| Error::ContextNotFound(id.to_string()))
    }

    /// Entries matching a filter, newest first
    pub async fn query(&self, query: &ContextQuery) -> Vec<ContextEntry> {
        let state = self.state.read().await;

        let mut candidates: Option<HashSet<Uuid>> = None;
        let mut narrow = |ids: HashSet<Uuid>| {
            candidates = Some(match candidates.take() {
                Some(current) => current.intersection(&ids).copied().collect(),
                None => ids,
            });
        };
        if let Some(task_type) = &query.task_type {
            narrow(state.index.with_task_type(task_type));
        }
        if !query.tags.is_empty() {
            narrow(state.index.with_any_tag(&query.tags));
        }
        if !query.backends.is_empty() {
            narrow(state.index.with_any_backend(&query.backends));
        }

        let mut results: Vec<&ContextEntry> = match &candidates {
            Some(ids) => ids.iter().filter_map(|id| state.entries.get(id)).collect(),
            None => state.entries.values().collect(),
        };
        results.retain(|entry| query.matches(entry));
        results.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        results
            .into_iter()
            .map(|entry| state.materialize(entry))
            .collect()
    }

    /// All other entries ranked by similarity to `id`, best first
    pub async fn find_similar(&self, id: Uuid, limit: usize) -> Result<Vec<ContextMatch>> {
        let state = self.state.read().await;
        let target = state
            .entries
            .get(&id)
            .ok_or_else(|| Error::ContextNotFound(id.to_string()))?;

        let target_tokens = match state.tokens.get(&id) {
            Some(cached) => cached.clone(),
            None => tokens(&target.input),
        };

        Ok(state
            .ranked_similar(target, &target_tokens)
            .into_iter()
            .take(limit)
            .map(|(score, entry)| ContextMatch {
                entry: state.materialize(entry),
                score,
            })
            .collect())
    }

    /// High-confidence entries of a task type whose input resembles `input`
    pub async fn suggestions_for(
        &self,
        input: &serde_json::Value,
        task_type: &str,
    ) -> Vec<ContextMatch> {
        let state = self.state.read().await;
        let now = Utc::now();
        let query_words = words(input);

        let mut scored: Vec<(f64, &ContextEntry)> = state
            .index
            .with_task_type(task_type)
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| entry.confidence > self.config.suggestion_min_confidence)
            .map(|entry| {
                let overlap = word_overlap(&query_words, &words(&entry.input));
                let decay = time_decay(entry.age_days(now), self.config.decay_half_life_days);
                (overlap * decay * entry.confidence, entry)
            })
            .filter(|(relevance, _)| *relevance > 0.0)
            .collect();
        scored.sort_by(|a, b| by_score_then_newest(*a, *b));

        scored
            .into_iter()
            .take(self.config.suggestion_limit)
            .map(|(score, entry)| ContextMatch {
                entry: state.materialize(entry),
                score,
            })
            .collect()
    }

    /// Delete entries older than `max_age_days` whose confidence is below the
    /// cleanup threshold. Returns the number deleted.
    pub async fn cleanup(&self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let threshold = self.config.cleanup_confidence;

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let doomed: Vec<Uuid> = state
            .entries
            .values()
            .filter(|entry| entry.created_at < cutoff && entry.confidence < threshold)
            .map(|entry| entry.id)
            .collect();

        for id in &doomed {
            state.remove(*id);
        }
        state.index.rebuild(state.entries.values());

        info!(
            deleted = doomed.len(),
            remaining = state.entries.len(),
            max_age_days = max_age_days,
            "Cleaned up context memory"
        );

        doomed.len()
    }

    /// Cleanup using the configured retention period
    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup(self.config.retention_days).await
    }

    pub async fn stats(&self) -> MemoryStats {
        let state = self.state.read().await;
        let entries: Vec<&ContextEntry> = state.entries.values().collect();
        if entries.is_empty() {
            return MemoryStats::default();
        }

        let mut stats = MemoryStats {
            total_entries: entries.len(),
            avg_confidence: entries.iter().map(|e| e.confidence).sum::<f64>()
                / entries.len() as f64,
            total_cost: entries.iter().map(|e| e.metadata.cost).sum(),
            total_links: state.links.link_count(),
            oldest_at: entries.iter().map(|e| e.created_at).min(),
            newest_at: entries.iter().map(|e| e.created_at).max(),
            ..Default::default()
        };

        let mut ratings = Vec::new();
        for entry in &entries {
            *stats.task_types.entry(entry.task_type.clone()).or_default() += 1;
            *stats.backends.entry(entry.backend_id.clone()).or_default() += 1;
            if let Some(feedback) = entry.feedback {
                stats.feedback.entries_with_feedback += 1;
                if feedback.helpful {
                    stats.feedback.helpful += 1;
                }
                ratings.extend(feedback.rating.map(f64::from));
            }
        }
        if !ratings.is_empty() {
            stats.feedback.avg_rating = Some(ratings.iter().sum::<f64>() / ratings.len() as f64);
        }

        stats
    }

    /// Every entry with its related ids, oldest first
    pub async fn export(&self) -> Vec<ContextEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<ContextEntry> = state
            .entries
            .values()
            .map(|entry| state.materialize(entry))
            .collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        entries
    }

    /// Write every entry to a JSON snapshot file. Returns the number written.
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let entries = self.export().await;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let contents = serde_json::to_vec_pretty(&entries)?;
        tokio::fs::write(path, contents).await?;

        info!(
            path = %path.display(),
            entries = entries.len(),
            "Saved context memory snapshot"
        );
        Ok(entries.len())
    }

    /// Import every entry from a JSON snapshot file. Returns the number loaded.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let contents = tokio::fs::read(path).await?;
        let entries: Vec<ContextEntry> = serde_json::from_slice(&contents)?;
        let count = entries.len();
        for entry in entries {
            self.import(entry).await?;
        }

        info!(
            path = %path.display(),
            entries = count,
            "Loaded context memory snapshot"
        );
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(task_type: &str, backend_id: &str, confidence: f64) -> NewContextEntry {
        NewContextEntry::new(
            task_type,
            backend_id,
            serde_json::json!({"dish": "lasagna for forty guests"}),
            serde_json::json!({"ok": true}),
            confidence,
        )
    }

    fn aged(entry: NewContextEntry, days: i64) -> ContextEntry {
        ContextEntry::from_new(entry, Utc::now() - Duration::days(days))
    }

    #[tokio::test]
    async fn test_add_then_query_by_tags_and_task_type() {
        let memory = ContextMemory::new();
        memory
            .add(new_entry("pricing", "fast", 0.9).with_tags(["produce"]))
            .await
            .unwrap();
        let id = memory
            .add(new_entry("menu_planning", "balanced", 0.8).with_tags(["vegan", "buffet"]))
            .await
            .unwrap();

        let hits = memory
            .query(
                &ContextQuery::new()
                    .with_task_type("menu_planning")
                    .with_tags(["vegan", "buffet"]),
            )
            .await;

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[tokio::test]
    async fn test_links_are_symmetric_without_self_links() {
        let memory = ContextMemory::new();
        let a = memory.add(new_entry("pricing", "fast", 0.9)).await.unwrap();
        let b = memory.add(new_entry("pricing", "fast", 0.9)).await.unwrap();

        let a = memory.get(a).await.unwrap();
        let b = memory.get(b).await.unwrap();

        assert_eq!(a.related, vec![b.id]);
        assert_eq!(b.related, vec![a.id]);
        assert!(!a.related.contains(&a.id));
    }

    #[tokio::test]
    async fn test_new_entry_links_at_most_three() {
        let memory = ContextMemory::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(memory.add(new_entry("pricing", "fast", 0.9)).await.unwrap());
        }

        let last = memory.get(ids[4]).await.unwrap();
        assert_eq!(last.related.len(), 3);
        for related in &last.related {
            let other = memory.get(*related).await.unwrap();
            assert!(other.related.contains(&last.id));
        }
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let memory = ContextMemory::new();
        let old = aged(new_entry("pricing", "fast", 0.9), 10);
        let mid = aged(new_entry("pricing", "balanced", 0.6), 5);
        let new = aged(new_entry("pricing", "fast", 0.95), 1);
        for entry in [&old, &mid, &new] {
            memory.import(entry.clone()).await.unwrap();
        }

        let all = memory.query(&ContextQuery::new().with_task_type("pricing")).await;
        let ids: Vec<Uuid> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![new.id, mid.id, old.id]);

        let confident = memory
            .query(&ContextQuery::new().with_min_confidence(0.7))
            .await;
        assert_eq!(confident.len(), 2);

        let balanced = memory
            .query(&ContextQuery::new().with_backends(["balanced"]))
            .await;
        assert_eq!(balanced.len(), 1);
        assert_eq!(balanced[0].id, mid.id);

        let window = memory
            .query(&ContextQuery::new().between(
                Utc::now() - Duration::days(7),
                Utc::now(),
            ))
            .await;
        assert_eq!(window.len(), 2);

        let limited = memory.query(&ContextQuery::new().with_limit(1)).await;
        assert_eq!(limited[0].id, new.id);
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_find_similar_ranks_by_score() {
        let memory = ContextMemory::new();
        let target = memory
            .add(new_entry("pricing", "fast", 0.9).with_tags(["dairy"]))
            .await
            .unwrap();
        let close = memory
            .add(new_entry("pricing", "fast", 0.9).with_tags(["dairy"]))
            .await
            .unwrap();
        let far = memory.add(new_entry("menu", "creative", 0.9)).await.unwrap();

        let similar = memory.find_similar(target, 10).await.unwrap();
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].entry.id, close);
        assert_eq!(similar[1].entry.id, far);
        assert!(similar[0].score > similar[1].score);

        assert!(matches!(
            memory.find_similar(Uuid::new_v4(), 3).await,
            Err(Error::ContextNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_suggestions_prefer_confident_recent_matches() {
        let memory = ContextMemory::new();
        let input = serde_json::json!({"dish": "lasagna for forty guests"});
        let best = aged(new_entry("menu", "fast", 0.95), 0);
        let older = aged(new_entry("menu", "fast", 0.95), 30);
        let weak = aged(new_entry("menu", "fast", 0.75), 0);
        let other_type = aged(new_entry("pricing", "fast", 0.95), 0);
        let unrelated = aged(
            NewContextEntry::new(
                "menu",
                "fast",
                serde_json::json!("zzz"),
                serde_json::Value::Null,
                0.95,
            ),
            0,
        );
        for entry in [&best, &older, &weak, &other_type, &unrelated] {
            memory.import(entry.clone()).await.unwrap();
        }

        let suggestions = memory.suggestions_for(&input, "menu").await;
        let ids: Vec<Uuid> = suggestions.iter().map(|m| m.entry.id).collect();
        assert_eq!(ids, vec![best.id, older.id]);
        assert!((suggestions[0].score - 0.95).abs() < 1e-3);
        assert!((suggestions[1].score - 0.475).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_suggestions_capped_at_three() {
        let memory = ContextMemory::new();
        for _ in 0..5 {
            memory.add(new_entry("menu", "fast", 0.9)).await.unwrap();
        }

        let suggestions = memory
            .suggestions_for(&serde_json::json!({"dish": "lasagna"}), "menu")
            .await;
        assert_eq!(suggestions.len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_old_low_confidence_entries() {
        let memory = ContextMemory::new();
        for _ in 0..95 {
            memory
                .import(aged(new_entry("pricing", "fast", 0.60), 100))
                .await
                .unwrap();
        }
        for _ in 0..5 {
            memory
                .import(aged(new_entry("pricing", "fast", 0.95), 100))
                .await
                .unwrap();
        }
        let boundary = aged(new_entry("pricing", "fast", 0.70), 100);
        memory.import(boundary.clone()).await.unwrap();
        memory.add(new_entry("pricing", "fast", 0.1)).await.unwrap();

        assert_eq!(memory.cleanup(90).await, 95);
        assert_eq!(memory.len().await, 7);
        assert!(memory.get(boundary.id).await.is_ok());

        let stats = memory.stats().await;
        assert_eq!(stats.task_types["pricing"], 7);
    }

    #[tokio::test]
    async fn test_token_cache_follows_entries() {
        let memory = ContextMemory::new();
        memory
            .import(aged(new_entry("pricing", "fast", 0.5), 120))
            .await
            .unwrap();
        for _ in 0..3 {
            memory.add(new_entry("pricing", "fast", 0.9)).await.unwrap();
        }
        assert_eq!(memory.state.read().await.tokens.len(), 4);

        memory.cleanup_expired().await;

        let state = memory.state.read().await;
        assert_eq!(state.tokens.len(), 3);
        assert!(state.entries.keys().all(|id| state.tokens.contains_key(id)));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_links() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("memory").join("snapshot.json");

        let memory = ContextMemory::new();
        let a = memory
            .add(new_entry("pricing", "fast", 0.9).with_tags(["dairy"]))
            .await
            .unwrap();
        let b = memory.add(new_entry("pricing", "fast", 0.8)).await.unwrap();
        assert_eq!(memory.save_snapshot(&path).await.unwrap(), 2);

        let restored = ContextMemory::new();
        assert_eq!(restored.load_snapshot(&path).await.unwrap(), 2);

        assert_eq!(restored.get(a).await.unwrap().related, vec![b]);
        assert_eq!(restored.get(b).await.unwrap().related, vec![a]);
        let dairy = restored
            .query(&ContextQuery::new().with_tags(["dairy"]))
            .await;
        assert_eq!(dairy.len(), 1);
        assert_eq!(dairy[0].id, a);
    }

    #[tokio::test]
    async fn test_snapshot_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let memory = ContextMemory::new();

        let missing = memory
            .load_snapshot(&dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::Io(_)));

        let garbled = dir.path().join("garbled.json");
        std::fs::write(&garbled, "{not json").unwrap();
        let err = memory.load_snapshot(&garbled).await.unwrap_err();
        assert_eq!(err.code(), "E801");
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_removes_dangling_links() {
        let memory = ContextMemory::new();
        let old = aged(new_entry("pricing", "fast", 0.5), 120);
        memory.import(old.clone()).await.unwrap();
        let fresh = memory.add(new_entry("pricing", "fast", 0.9)).await.unwrap();

        assert_eq!(memory.cleanup_expired().await, 1);
        assert!(memory.get(fresh).await.unwrap().related.is_empty());
        assert!(memory.get(old.id).await.is_err());
        assert!(memory
            .query(&ContextQuery::new().with_backends(["fast"]))
            .await
            .iter()
            .all(|e| e.id != old.id));
    }

    #[tokio::test]
    async fn test_import_restores_links() {
        let memory = ContextMemory::new();
        let a = aged(new_entry("pricing", "fast", 0.9), 3);
        let mut b = aged(new_entry("pricing", "fast", 0.9), 2);
        b.related = vec![a.id, Uuid::new_v4()];

        memory.import(a.clone()).await.unwrap();
        memory.import(b.clone()).await.unwrap();

        assert_eq!(memory.get(a.id).await.unwrap().related, vec![b.id]);
        assert_eq!(memory.get(b.id).await.unwrap().related, vec![a.id]);
        assert!(memory.import(a).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_invalid_entries() {
        let memory = ContextMemory::new();
        let err = memory
            .add(new_entry("pricing", "fast", 1.5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E800");
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_stats() {
        let memory = ContextMemory::new();
        memory
            .add(
                new_entry("pricing", "fast", 0.8)
                    .with_feedback(UserFeedback::new(true).with_rating(4))
                    .with_metadata(ExecutionMetadata {
                        latency_ms: 100,
                        cost: 0.5,
                        units: 10,
                    }),
            )
            .await
            .unwrap();
        memory
            .add(
                new_entry("menu", "balanced", 0.6)
                    .with_feedback(UserFeedback::new(false).with_rating(2)),
            )
            .await
            .unwrap();

        let stats = memory.stats().await;
        assert_eq!(stats.total_entries, 2);
        assert!((stats.avg_confidence - 0.7).abs() < 1e-9);
        assert_eq!(stats.backends["balanced"], 1);
        assert!((stats.total_cost - 0.5).abs() < 1e-9);
        assert_eq!(stats.feedback.entries_with_feedback, 2);
        assert_eq!(stats.feedback.helpful, 1);
        assert_eq!(stats.feedback.avg_rating, Some(3.0));
        assert_eq!(stats.total_links, 1);
    }
}
