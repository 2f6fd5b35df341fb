//! Secondary indices and the related-entry adjacency

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::entry::ContextEntry;

/// Lookup of entry ids by tag, task type and backend id
#[derive(Debug, Clone, Default)]
pub struct ContextIndex {
    by_tag: HashMap<String, HashSet<Uuid>>,
    by_task_type: HashMap<String, HashSet<Uuid>>,
    by_backend: HashMap<String, HashSet<Uuid>>,
}

impl ContextIndex {
    pub fn insert(&mut self, entry: &ContextEntry) {
        for tag in &entry.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(entry.id);
        }
        self.by_task_type
            .entry(entry.task_type.clone())
            .or_default()
            .insert(entry.id);
        self.by_backend
            .entry(entry.backend_id.clone())
            .or_default()
            .insert(entry.id);
    }

    /// Rebuild every index from scratch
    pub fn rebuild<'a>(&mut self, entries: impl IntoIterator<Item = &'a ContextEntry>) {
        self.by_tag.clear();
        self.by_task_type.clear();
        self.by_backend.clear();
        for entry in entries {
            self.insert(entry);
        }
    }

    pub fn with_task_type(&self, task_type: &str) -> HashSet<Uuid> {
        self.by_task_type.get(task_type).cloned().unwrap_or_default()
    }

    /// Ids carrying any of the given tags
    pub fn with_any_tag<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> HashSet<Uuid> {
        tags.into_iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .flatten()
            .copied()
            .collect()
    }

    /// Ids produced by any of the given backends
    pub fn with_any_backend<'a>(
        &self,
        backends: impl IntoIterator<Item = &'a String>,
    ) -> HashSet<Uuid> {
        backends
            .into_iter()
            .filter_map(|backend| self.by_backend.get(backend))
            .flatten()
            .copied()
            .collect()
    }
}

/// Symmetric adjacency between related entries
///
/// No id is ever linked to itself and no pair is stored twice.
#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    edges: HashMap<Uuid, Vec<Uuid>>,
}

impl LinkGraph {
    /// Link two entries both ways. Returns false for a self-link or an
    /// existing link.
    pub fn link(&mut self, a: Uuid, b: Uuid) -> bool {
        if a == b || self.are_linked(a, b) {
            return false;
        }
        self.edges.entry(a).or_default().push(b);
        self.edges.entry(b).or_default().push(a);
        true
    }

    pub fn are_linked(&self, a: Uuid, b: Uuid) -> bool {
        self.edges.get(&a).is_some_and(|related| related.contains(&b))
    }

    /// Related ids in link order
    pub fn related(&self, id: Uuid) -> &[Uuid] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove an entry and every link pointing at it
    pub fn unlink_all(&mut self, id: Uuid) {
        if let Some(related) = self.edges.remove(&id) {
            for other in related {
                if let Some(back) = self.edges.get_mut(&other) {
                    back.retain(|r| *r != id);
                }
            }
        }
    }

    /// Number of undirected links
    pub fn link_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum::<usize>() / 2
    }
}
