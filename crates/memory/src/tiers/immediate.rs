//! Hot cache of the most recent entries, capped by tokens and entry count.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use super::{TierRetrieve, age_penalty};
use crate::schema::{MemoryEntry, MemoryTier};

const AGE_WEIGHT: f64 = 0.1;

#[derive(Debug)]
pub struct ImmediateMemory {
    max_tokens: usize,
    max_entries: usize,
    entries: HashMap<String, MemoryEntry>,
    tokens_used: usize,
}

impl Default for ImmediateMemory {
    fn default() -> Self {
        Self::new(4000, 20)
    }
}

impl ImmediateMemory {
    pub fn new(max_tokens: usize, max_entries: usize) -> Self {
        Self {
            max_tokens,
            max_entries,
            entries: HashMap::new(),
            tokens_used: 0,
        }
    }

    pub fn tokens_used(&self) -> usize {
        self.tokens_used
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Insert an entry, evicting the lowest-value entries until both caps
    /// hold. Returns every entry dropped to make room; an entry too large to
    /// ever fit is returned unstored.
    pub fn add(&mut self, mut entry: MemoryEntry) -> Vec<MemoryEntry> {
        entry.tier = MemoryTier::Immediate;
        let tokens = entry.ensure_tokens();

        if tokens > self.max_tokens {
            debug!(id = %entry.id, tokens, "entry exceeds immediate capacity, not cached");
            return vec![entry];
        }

        // Replacing an existing id releases its tokens first.
        if let Some(previous) = self.entries.remove(&entry.id) {
            self.tokens_used -= previous.tokens.unwrap_or(0);
        }

        let mut evicted = Vec::new();
        while self.tokens_used + tokens > self.max_tokens
            || self.entries.len() >= self.max_entries
        {
            match self.evict_one() {
                Some(dropped) => evicted.push(dropped),
                None => break,
            }
        }

        self.tokens_used += tokens;
        self.entries.insert(entry.id.clone(), entry);
        evicted
    }

    fn evict_one(&mut self) -> Option<MemoryEntry> {
        let now = Utc::now();
        let victim_id = self
            .entries
            .values()
            .min_by(|a, b| {
                let score_a = a.importance - age_penalty(a.created_at, now) * AGE_WEIGHT;
                let score_b = b.importance - age_penalty(b.created_at, now) * AGE_WEIGHT;
                score_a.total_cmp(&score_b).then_with(|| a.id.cmp(&b.id))
            })?
            .id
            .clone();

        let victim = self.entries.remove(&victim_id)?;
        self.tokens_used -= victim.tokens.unwrap_or(0);
        debug!(id = %victim.id, importance = victim.importance, "evicted from immediate tier");
        Some(victim)
    }

    pub fn get(&mut self, id: &str) -> Option<&MemoryEntry> {
        let entry = self.entries.get_mut(id)?;
        entry.touch();
        Some(&*entry)
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryEntry> {
        let removed = self.entries.remove(id)?;
        self.tokens_used -= removed.tokens.unwrap_or(0);
        Some(removed)
    }

    /// When the tier is at least 80% full (by either cap), the bottom half of
    /// entries by eviction score are offered for promotion into the session
    /// tier.
    pub fn promotion_candidates(&self) -> Vec<MemoryEntry> {
        let entry_occupancy = self.entries.len() as f64 / self.max_entries.max(1) as f64;
        let token_occupancy = self.tokens_used as f64 / self.max_tokens.max(1) as f64;
        if entry_occupancy < 0.8 && token_occupancy < 0.8 {
            return Vec::new();
        }

        let now = Utc::now();
        let mut ranked: Vec<&MemoryEntry> = self.entries.values().collect();
        ranked.sort_by(|a, b| {
            let score_a = a.importance - age_penalty(a.created_at, now) * AGE_WEIGHT;
            let score_b = b.importance - age_penalty(b.created_at, now) * AGE_WEIGHT;
            score_a.total_cmp(&score_b).then_with(|| a.id.cmp(&b.id))
        });
        ranked.truncate(self.entries.len() / 2);
        ranked.into_iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.tokens_used = 0;
    }
}

impl TierRetrieve for ImmediateMemory {
    fn tier(&self) -> MemoryTier {
        MemoryTier::Immediate
    }

    fn entries(&self) -> Vec<&MemoryEntry> {
        self.entries.values().collect()
    }
}
