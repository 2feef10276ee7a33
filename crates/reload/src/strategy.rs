//! Snapshot-to-live-state reconciliation.
//!
//! [`ReloadMode`] is a closed set of four rules dispatched by one
//! [`apply_strategy`] function. Each rule maps `(snapshot, current entries,
//! options)` to a [`ReloadPlan`]; the engine then installs the plan into the
//! tiers. Entries rebuilt from a snapshot keep the ids of their source
//! records, which is what lets Merge detect genuine conflicts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use recall_commit::SessionSnapshot;
use recall_memory::{
    EntryKind, EntryMetadata, EntrySource, MemoryEntry, MemoryTier,
    tiers::summarized::decision_importance,
};

const MESSAGE_IMPORTANCE: f64 = 0.4;
const ENTITY_IMPORTANCE: f64 = 0.6;
const MAX_PREVIOUS_STATES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    Full,
    Selective,
    Rollback,
    Merge,
}

impl ReloadMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "selective" => Some(Self::Selective),
            "rollback" => Some(Self::Rollback),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReloadOptions {
    /// Tiers replaced by a selective reload.
    pub tiers: Vec<MemoryTier>,
    /// Rollback cutoff; defaults to the snapshot's own timestamp.
    pub from_timestamp: Option<DateTime<Utc>>,
    /// On merge conflicts, keep the live entry rather than the snapshot's.
    pub preserve_local: bool,
}

impl Default for ReloadOptions {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            from_timestamp: None,
            preserve_local: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReloadPlan {
    /// Entries rebuilt from the snapshot.
    pub reloaded: Vec<MemoryEntry>,
    /// Ids of live entries the plan drops.
    pub discarded: Vec<String>,
    /// Live entries kept verbatim.
    pub preserved: Vec<MemoryEntry>,
    /// Conflict resolutions (both sides existed).
    pub merged: Vec<MemoryEntry>,
}

impl ReloadPlan {
    /// The complete post-reload entry set.
    pub fn final_entries(&self) -> Vec<MemoryEntry> {
        let mut seen = std::collections::HashSet::new();
        self.reloaded
            .iter()
            .chain(self.merged.iter())
            .chain(self.preserved.iter())
            .filter(|entry| seen.insert(entry.id.clone()))
            .cloned()
            .collect()
    }
}

/// Rebuild tier entries from a snapshot's records: messages land in the
/// session tier, entities in archival, decisions and facts in summarized.
pub fn entries_from_snapshot(snapshot: &SessionSnapshot) -> Vec<MemoryEntry> {
    let mut entries = Vec::new();

    for message in &snapshot.messages {
        let mut entry = MemoryEntry::new(MemoryTier::Session, EntryKind::Message, &message.content)
            .with_id(&message.id)
            .with_importance(MESSAGE_IMPORTANCE)
            .with_metadata(EntryMetadata {
                conversation_id: snapshot.conversation_id.clone(),
                session_id: snapshot.session_id.clone(),
                turn_number: Some(message.turn_number),
                source: Some(EntrySource::from(message.role)),
                ..Default::default()
            });
        entry.created_at = message.timestamp;
        entry.accessed_at = message.timestamp;
        entries.push(entry);
    }

    for entity in &snapshot.entities {
        let mut entry = MemoryEntry::new(MemoryTier::Archival, EntryKind::Entity, &entity.name)
            .with_id(&entity.id)
            .with_importance(ENTITY_IMPORTANCE);
        entry.created_at = entity.created_at;
        entry.accessed_at = entity.updated_at;
        entries.push(entry);
    }

    for decision in &snapshot.key_decisions {
        let mut entry = MemoryEntry::new(
            MemoryTier::Summarized,
            EntryKind::Decision,
            format!("{}: {}", decision.title, decision.description),
        )
        .with_id(&decision.id)
        .with_importance(decision_importance(decision.impact));
        entry.created_at = decision.timestamp;
        entry.accessed_at = decision.timestamp;
        entries.push(entry);
    }

    for fact in &snapshot.learned_facts {
        let mut entry = MemoryEntry::new(MemoryTier::Summarized, EntryKind::Fact, &fact.content)
            .with_id(&fact.id)
            .with_importance(fact.confidence);
        entry.created_at = fact.timestamp;
        entry.accessed_at = fact.timestamp;
        entries.push(entry);
    }

    entries
}

pub fn apply_strategy(
    mode: ReloadMode,
    snapshot: &SessionSnapshot,
    current: &HashMap<String, MemoryEntry>,
    options: &ReloadOptions,
) -> ReloadPlan {
    let extracted = entries_from_snapshot(snapshot);
    let plan = match mode {
        ReloadMode::Full => ReloadPlan {
            reloaded: extracted,
            discarded: current.keys().cloned().collect(),
            ..Default::default()
        },
        ReloadMode::Selective => {
            let replace = |tier: MemoryTier| options.tiers.contains(&tier);
            ReloadPlan {
                reloaded: extracted
                    .into_iter()
                    .filter(|entry| replace(entry.tier))
                    .collect(),
                discarded: current
                    .values()
                    .filter(|entry| replace(entry.tier))
                    .map(|entry| entry.id.clone())
                    .collect(),
                preserved: current
                    .values()
                    .filter(|entry| !replace(entry.tier))
                    .cloned()
                    .collect(),
                merged: Vec::new(),
            }
        }
        ReloadMode::Rollback => {
            let cutoff = options.from_timestamp.unwrap_or(snapshot.timestamp);
            ReloadPlan {
                reloaded: extracted
                    .into_iter()
                    .filter(|entry| entry.created_at <= cutoff)
                    .collect(),
                discarded: current.keys().cloned().collect(),
                ..Default::default()
            }
        }
        ReloadMode::Merge => {
            let mut plan = ReloadPlan::default();
            let mut conflicting: std::collections::HashSet<String> =
                std::collections::HashSet::new();

            for entry in extracted {
                match current.get(&entry.id) {
                    Some(live) => {
                        conflicting.insert(entry.id.clone());
                        if options.preserve_local {
                            plan.merged.push(live.clone());
                            plan.discarded.push(entry.id.clone());
                        } else {
                            plan.merged.push(entry);
                        }
                    }
                    None => plan.reloaded.push(entry),
                }
            }
            plan.preserved = current
                .values()
                .filter(|entry| !conflicting.contains(&entry.id))
                .cloned()
                .collect();
            plan
        }
    };

    debug!(
        mode = ?mode,
        reloaded = plan.reloaded.len(),
        discarded = plan.discarded.len(),
        preserved = plan.preserved.len(),
        merged = plan.merged.len(),
        "reload strategy applied"
    );
    plan
}

/// Bounded FIFO of pre-reload entry maps backing `rollback_last_reload`.
#[derive(Debug, Default)]
pub struct StateHistory {
    states: Vec<HashMap<String, MemoryEntry>>,
}

impl StateHistory {
    pub fn push(&mut self, state: HashMap<String, MemoryEntry>) {
        self.states.push(state);
        while self.states.len() > MAX_PREVIOUS_STATES {
            self.states.remove(0);
        }
    }

    pub fn pop(&mut self) -> Option<HashMap<String, MemoryEntry>> {
        self.states.pop()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use recall_commit::{SessionData, SessionStatistics, TierEntries};
    use recall_memory::{ConversationMessage, ImpactLevel, KeyDecision, LearnedFact, MessageRole};

    use super::*;

    fn snapshot_with(
        messages: Vec<ConversationMessage>,
        decisions: Vec<KeyDecision>,
        facts: Vec<LearnedFact>,
    ) -> SessionSnapshot {
        let statistics = SessionStatistics {
            message_count: messages.len(),
            ..Default::default()
        };
        let data = SessionData {
            conversation_id: "conv".into(),
            session_id: "sess".into(),
            collected_at: Utc::now(),
            messages,
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
            file_changes: Vec::new(),
            artifacts: Vec::new(),
            entities: Vec::new(),
            relationships: Vec::new(),
            facts,
            decisions,
            summary: None,
            project_state: serde_json::json!({}),
            task_state: serde_json::json!({}),
            agent_state: None,
            tier_entries: TierEntries::default(),
            statistics,
        };
        SessionSnapshot::from_data("commit-1-test", &data)
    }

    fn message_at(id: &str, turn: u32, age_minutes: i64) -> ConversationMessage {
        let mut message = ConversationMessage::new(MessageRole::User, format!("body {id}"), turn);
        message.id = id.into();
        message.timestamp = Utc::now() - Duration::minutes(age_minutes);
        message
    }

    fn live_entry(id: &str, tier: MemoryTier) -> MemoryEntry {
        MemoryEntry::new(tier, EntryKind::Message, format!("live {id}")).with_id(id)
    }

    fn live_map(entries: Vec<MemoryEntry>) -> HashMap<String, MemoryEntry> {
        entries
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect()
    }

    #[test]
    fn full_reload_replaces_everything() {
        let snapshot = snapshot_with(
            vec![message_at("m1", 1, 10), message_at("m2", 2, 5)],
            vec![KeyDecision {
                id: "d1".into(),
                title: "go async".into(),
                description: "adopt the event loop".into(),
                rationale: "long-running io".into(),
                alternatives: Vec::new(),
                timestamp: Utc::now(),
                turn_number: 2,
                impact: ImpactLevel::Critical,
            }],
            vec![LearnedFact {
                id: "f1".into(),
                content: "flushes happen on a timer".into(),
                source: "turn-2".into(),
                confidence: 0.8,
                category: "general".into(),
                timestamp: Utc::now(),
            }],
        );
        let current = live_map(vec![live_entry("old-1", MemoryTier::Session)]);

        let plan = apply_strategy(ReloadMode::Full, &snapshot, &current, &Default::default());

        assert_eq!(plan.reloaded.len(), 4);
        assert_eq!(plan.discarded, vec!["old-1".to_string()]);
        assert!(plan.preserved.is_empty());

        let decision = plan.reloaded.iter().find(|e| e.id == "d1").unwrap();
        assert_eq!(decision.tier, MemoryTier::Summarized);
        assert_eq!(decision.importance, 1.0);
        let fact = plan.reloaded.iter().find(|e| e.id == "f1").unwrap();
        assert_eq!(fact.importance, 0.8);
        let message = plan.reloaded.iter().find(|e| e.id == "m1").unwrap();
        assert_eq!(message.tier, MemoryTier::Session);
        assert_eq!(message.importance, 0.4);
    }

    #[test]
    fn selective_reload_touches_only_named_tiers() {
        let snapshot = snapshot_with(
            vec![
                message_at("m1", 1, 10),
                message_at("m2", 2, 8),
                message_at("m3", 3, 5),
            ],
            Vec::new(),
            vec![LearnedFact {
                id: "f1".into(),
                content: "snapshot fact".into(),
                source: "turn-1".into(),
                confidence: 0.9,
                category: "general".into(),
                timestamp: Utc::now(),
            }],
        );
        let current = live_map(vec![
            live_entry("live-a", MemoryTier::Summarized),
            live_entry("live-b", MemoryTier::Summarized),
            live_entry("live-c", MemoryTier::Session),
            live_entry("live-d", MemoryTier::Session),
            live_entry("live-e", MemoryTier::Session),
        ]);

        let plan = apply_strategy(
            ReloadMode::Selective,
            &snapshot,
            &current,
            &ReloadOptions {
                tiers: vec![MemoryTier::Session],
                ..Default::default()
            },
        );

        // Exactly the snapshot's 3 session entries come in; the 2 summarized
        // live entries survive untouched; the fact entry is not loaded.
        assert_eq!(plan.reloaded.len(), 3);
        assert!(plan.reloaded.iter().all(|e| e.tier == MemoryTier::Session));
        assert_eq!(plan.preserved.len(), 2);
        assert!(plan
            .preserved
            .iter()
            .all(|e| e.tier == MemoryTier::Summarized));
        assert_eq!(plan.discarded.len(), 3);

        let final_entries = plan.final_entries();
        assert_eq!(final_entries.len(), 5);
    }

    #[test]
    fn rollback_drops_entries_after_the_cutoff() {
        let messages: Vec<ConversationMessage> = (0..10)
            .map(|i| message_at(&format!("m{i}"), i as u32 + 1, 100 - (i as i64 * 10)))
            .collect();
        let cutoff = messages[4].timestamp;
        let snapshot = snapshot_with(messages, Vec::new(), Vec::new());
        let current = live_map(vec![live_entry("live", MemoryTier::Session)]);

        let plan = apply_strategy(
            ReloadMode::Rollback,
            &snapshot,
            &current,
            &ReloadOptions {
                from_timestamp: Some(cutoff),
                ..Default::default()
            },
        );

        assert_eq!(plan.reloaded.len(), 5);
        assert!(plan.reloaded.iter().all(|e| e.created_at <= cutoff));
        assert_eq!(plan.discarded, vec!["live".to_string()]);
    }

    #[test]
    fn rollback_defaults_to_the_snapshot_timestamp() {
        let snapshot = snapshot_with(vec![message_at("m1", 1, 10)], Vec::new(), Vec::new());
        let plan = apply_strategy(
            ReloadMode::Rollback,
            &snapshot,
            &HashMap::new(),
            &Default::default(),
        );
        assert_eq!(plan.reloaded.len(), 1);
    }

    #[test]
    fn merge_prefers_local_by_default() {
        let snapshot = snapshot_with(
            vec![message_at("shared", 1, 10), message_at("only-snap", 2, 5)],
            Vec::new(),
            Vec::new(),
        );
        let current = live_map(vec![
            live_entry("shared", MemoryTier::Session),
            live_entry("only-live", MemoryTier::Session),
        ]);

        let plan = apply_strategy(ReloadMode::Merge, &snapshot, &current, &Default::default());

        assert_eq!(plan.reloaded.len(), 1);
        assert_eq!(plan.reloaded[0].id, "only-snap");
        assert_eq!(plan.merged.len(), 1);
        assert!(plan.merged[0].content.starts_with("live"));
        assert_eq!(plan.preserved.len(), 1);
        assert_eq!(plan.preserved[0].id, "only-live");
        assert_eq!(plan.final_entries().len(), 3);
    }

    #[test]
    fn merge_can_prefer_the_snapshot_side() {
        let snapshot = snapshot_with(vec![message_at("shared", 1, 10)], Vec::new(), Vec::new());
        let current = live_map(vec![live_entry("shared", MemoryTier::Session)]);

        let plan = apply_strategy(
            ReloadMode::Merge,
            &snapshot,
            &current,
            &ReloadOptions {
                preserve_local: false,
                ..Default::default()
            },
        );
        assert_eq!(plan.merged.len(), 1);
        assert!(plan.merged[0].content.starts_with("body"));
    }

    #[test]
    fn state_history_is_a_bounded_fifo() {
        let mut history = StateHistory::default();
        for i in 0..8 {
            history.push(live_map(vec![live_entry(&format!("s{i}"), MemoryTier::Session)]));
        }
        assert_eq!(history.len(), 5);

        // Newest state pops first; the oldest three were dropped.
        let top = history.pop().expect("state");
        assert!(top.contains_key("s7"));
        while let Some(state) = history.pop() {
            assert!(!state.contains_key("s0"));
            assert!(!state.contains_key("s1"));
        }
    }
}
