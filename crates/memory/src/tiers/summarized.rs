//! Compressed knowledge: summaries, key decisions, and learned facts, each
//! mirrored as an importance-ranked entry so the tier can participate in
//! uniform retrieval.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::TierRetrieve;
use crate::schema::{
    EntryKind, ImpactLevel, KeyDecision, LearnedFact, MemoryEntry, MemoryTier, Summary,
    SummaryKind, token_estimate,
};

const SUMMARY_IMPORTANCE: f64 = 0.7;

pub fn decision_importance(impact: ImpactLevel) -> f64 {
    match impact {
        ImpactLevel::Critical => 1.0,
        ImpactLevel::High => 0.8,
        _ => 0.5,
    }
}

#[derive(Debug)]
pub struct SummarizedMemory {
    max_entries: usize,
    summaries: HashMap<String, Summary>,
    decisions: HashMap<String, KeyDecision>,
    facts: HashMap<String, LearnedFact>,
    entries: HashMap<String, MemoryEntry>,
}

impl SummarizedMemory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            summaries: HashMap::new(),
            decisions: HashMap::new(),
            facts: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn summaries(&self) -> impl Iterator<Item = &Summary> {
        self.summaries.values()
    }

    pub fn decisions(&self) -> impl Iterator<Item = &KeyDecision> {
        self.decisions.values()
    }

    pub fn facts(&self) -> impl Iterator<Item = &LearnedFact> {
        self.facts.values()
    }

    pub fn get_summary(&self, id: &str) -> Option<&Summary> {
        self.summaries.get(id)
    }

    pub fn add_summary(&mut self, summary: Summary) {
        let entry = MemoryEntry::new(MemoryTier::Summarized, EntryKind::Summary, &summary.content)
            .with_id(&summary.id)
            .with_importance(SUMMARY_IMPORTANCE);
        self.summaries.insert(summary.id.clone(), summary);
        self.insert_entry(entry);
    }

    pub fn add_decision(&mut self, decision: KeyDecision) {
        let entry = MemoryEntry::new(
            MemoryTier::Summarized,
            EntryKind::Decision,
            format!("{}: {}", decision.title, decision.description),
        )
        .with_id(&decision.id)
        .with_importance(decision_importance(decision.impact));
        self.decisions.insert(decision.id.clone(), decision);
        self.insert_entry(entry);
    }

    pub fn add_fact(&mut self, fact: LearnedFact) {
        let entry = MemoryEntry::new(MemoryTier::Summarized, EntryKind::Fact, &fact.content)
            .with_id(&fact.id)
            .with_importance(fact.confidence);
        self.facts.insert(fact.id.clone(), fact);
        self.insert_entry(entry);
    }

    /// Re-insert an entry carried across a reload without rebuilding its
    /// backing record.
    pub fn restore_entry(&mut self, entry: MemoryEntry) {
        self.insert_entry(entry);
    }

    fn insert_entry(&mut self, mut entry: MemoryEntry) {
        entry.tier = MemoryTier::Summarized;
        self.entries.insert(entry.id.clone(), entry);
        while self.entries.len() > self.max_entries {
            self.evict_least_important();
        }
    }

    /// Capacity pressure drops the least important mirror entry along with
    /// its backing record.
    fn evict_least_important(&mut self) {
        let victim_id = match self
            .entries
            .values()
            .min_by(|a, b| {
                a.importance
                    .total_cmp(&b.importance)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|entry| entry.id.clone())
        {
            Some(id) => id,
            None => return,
        };

        self.entries.remove(&victim_id);
        self.summaries.remove(&victim_id);
        self.decisions.remove(&victim_id);
        self.facts.remove(&victim_id);
        debug!(id = %victim_id, "evicted from summarized tier");
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryEntry> {
        self.summaries.remove(id);
        self.decisions.remove(id);
        self.facts.remove(id);
        self.entries.remove(id)
    }

    /// Merge several summaries into one `merged` summary: contents are
    /// concatenated, list fields unioned in order, and the *last* summary's
    /// `current_state` and `next_steps` win.
    pub fn merge_summaries(&mut self, ids: &[String]) -> Option<Summary> {
        let sources: Vec<Summary> = ids
            .iter()
            .filter_map(|id| self.summaries.get(id).cloned())
            .collect();
        if sources.is_empty() {
            return None;
        }

        let mut content_parts = Vec::new();
        let mut key_points = Vec::new();
        let mut decisions = Vec::new();
        let mut errors = Vec::new();
        let mut files_modified = Vec::new();
        let mut source_messages = 0;

        for summary in &sources {
            content_parts.push(summary.content.clone());
            for point in &summary.key_points {
                if !key_points.contains(point) {
                    key_points.push(point.clone());
                }
            }
            for decision in &summary.decisions {
                if !decisions.contains(decision) {
                    decisions.push(decision.clone());
                }
            }
            for error in &summary.errors {
                if !errors.contains(error) {
                    errors.push(error.clone());
                }
            }
            for file in &summary.files_modified {
                if !files_modified.contains(file) {
                    files_modified.push(file.clone());
                }
            }
            source_messages += summary.source_messages;
        }

        let last = sources.last().expect("nonempty");
        let content = content_parts.join("\n\n");
        let merged = Summary {
            id: Uuid::new_v4().to_string(),
            conversation_id: last.conversation_id.clone(),
            kind: SummaryKind::Merged,
            tokens: token_estimate(&content),
            content,
            key_points,
            decisions,
            errors,
            files_modified,
            current_state: last.current_state.clone(),
            next_steps: last.next_steps.clone(),
            timestamp: Utc::now(),
            source_messages,
        };

        self.add_summary(merged.clone());
        Some(merged)
    }

    pub fn clear(&mut self) {
        self.summaries.clear();
        self.decisions.clear();
        self.facts.clear();
        self.entries.clear();
    }
}

impl TierRetrieve for SummarizedMemory {
    fn tier(&self) -> MemoryTier {
        MemoryTier::Summarized
    }

    fn entries(&self) -> Vec<&MemoryEntry> {
        self.entries.values().collect()
    }
}
