//! Long-term store: archived entries, the entity graph, snapshot records,
//! and a term-based inverted index for lexical search.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TierRetrieve;
use crate::schema::{EntityKind, ExtractedEntity, MemoryEntry, MemoryTier};

/// Terms this short carry almost no signal and bloat the index.
const MIN_TERM_LEN: usize = 4;

/// Lightweight record of a snapshot the engine has taken; the snapshot body
/// lives on disk under `archives/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Default)]
pub struct ArchivalMemory {
    entries: HashMap<String, MemoryEntry>,
    entities: HashMap<String, ExtractedEntity>,
    snapshots: HashMap<String, SnapshotRecord>,
    /// term → ids of entries whose content contains the term.
    inverted_index: HashMap<String, HashSet<String>>,
}

/// Lowercase, split on non-word characters, drop short tokens.
pub fn index_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|term| term.len() > MIN_TERM_LEN - 1)
        .filter(|term| seen.insert(term.to_string()))
        .map(str::to_string)
        .collect()
}

impl ArchivalMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, mut entry: MemoryEntry) {
        entry.tier = MemoryTier::Archival;
        for term in index_terms(&entry.content) {
            self.inverted_index
                .entry(term)
                .or_default()
                .insert(entry.id.clone());
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&MemoryEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryEntry> {
        let removed = self.entries.remove(id)?;
        for postings in self.inverted_index.values_mut() {
            postings.remove(id);
        }
        Some(removed)
    }

    // ── entities ─────────────────────────────────────────────────────────

    /// Insert or merge an entity; merging accumulates mentions and
    /// relationships under the `(kind, lowercased name)` identity.
    pub fn upsert_entity(&mut self, entity: ExtractedEntity) -> String {
        let key = entity.dedup_key();
        let existing_id = self
            .entities
            .values()
            .find(|candidate| candidate.dedup_key() == key)
            .map(|candidate| candidate.id.clone());

        match existing_id {
            Some(id) => {
                if let Some(existing) = self.entities.get_mut(&id) {
                    existing.merge(&entity);
                }
                id
            }
            None => {
                let id = entity.id.clone();
                self.entities.insert(id.clone(), entity);
                id
            }
        }
    }

    pub fn entity(&self, id: &str) -> Option<&ExtractedEntity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &ExtractedEntity> {
        self.entities.values()
    }

    pub fn entities_of_kind(&self, kind: EntityKind) -> Vec<&ExtractedEntity> {
        self.entities
            .values()
            .filter(|entity| entity.kind == kind)
            .collect()
    }

    // ── snapshots ────────────────────────────────────────────────────────

    pub fn record_snapshot(&mut self, record: SnapshotRecord) {
        self.snapshots.insert(record.id.clone(), record);
    }

    pub fn snapshot(&self, id: &str) -> Option<&SnapshotRecord> {
        self.snapshots.get(id)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.snapshots.values()
    }

    // ── search ───────────────────────────────────────────────────────────

    /// Full-text search: union of inverted-index term hits and a direct
    /// substring scan, ranked by number of matches.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(MemoryEntry, usize)> {
        let query_lower = query.to_lowercase();
        let mut match_counts: HashMap<&str, usize> = HashMap::new();

        for term in index_terms(query) {
            if let Some(postings) = self.inverted_index.get(&term) {
                for id in postings {
                    if let Some((key, _)) = self.entries.get_key_value(id.as_str()) {
                        *match_counts.entry(key.as_str()).or_default() += 1;
                    }
                }
            }
        }

        for (id, entry) in &self.entries {
            if entry.content.to_lowercase().contains(&query_lower) {
                *match_counts.entry(id.as_str()).or_default() += 1;
            }
        }

        let mut ranked: Vec<(MemoryEntry, usize)> = match_counts
            .into_iter()
            .filter_map(|(id, count)| self.entries.get(id).map(|e| (e.clone(), count)))
            .collect();
        ranked.sort_by(|(a, ca), (b, cb)| {
            cb.cmp(ca)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.truncate(limit);
        ranked
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.entities.clear();
        self.snapshots.clear();
        self.inverted_index.clear();
    }
}

impl TierRetrieve for ArchivalMemory {
    fn tier(&self) -> MemoryTier {
        MemoryTier::Archival
    }

    fn entries(&self) -> Vec<&MemoryEntry> {
        self.entries.values().collect()
    }
}
