//! The four memory tiers.
//!
//! Each tier is a concrete type implementing [`TierRetrieve`]; the engine
//! holds one of each rather than a collection of boxed tiers, so tier-specific
//! operations stay statically typed.

pub mod archival;
pub mod immediate;
pub mod session;
pub mod summarized;

use chrono::{DateTime, Utc};

use crate::schema::{EntryKind, MemoryEntry, MemoryTier};

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub kinds: Option<Vec<EntryKind>>,
    pub min_importance: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RetrieveOptions {
    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&entry.kind)
        {
            return false;
        }
        if let Some(min) = self.min_importance
            && entry.importance < min
        {
            return false;
        }
        if let Some(since) = self.since
            && entry.created_at < since
        {
            return false;
        }
        true
    }
}

/// Shared retrieval contract across the four tiers. Results are sorted by
/// importance descending, then recency.
pub trait TierRetrieve {
    fn tier(&self) -> MemoryTier;

    fn entries(&self) -> Vec<&MemoryEntry>;

    fn retrieve(&self, options: &RetrieveOptions) -> Vec<MemoryEntry> {
        let mut matched: Vec<&MemoryEntry> = self
            .entries()
            .into_iter()
            .filter(|entry| options.matches(entry))
            .collect();
        matched.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        if let Some(limit) = options.limit {
            matched.truncate(limit);
        }
        matched.into_iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Linear age penalty used by immediate-tier eviction and promotion: 0 for a
/// brand-new entry, 1.0 at 24 hours or older.
pub(crate) fn age_penalty(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_secs = (now - created_at).num_seconds().max(0) as f64;
    (age_secs / 86_400.0).clamp(0.0, 1.0)
}
