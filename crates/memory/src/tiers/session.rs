//! Working store for one session: ordered messages, tool calls, and the
//! mirrored entries derived from them.

use std::collections::HashMap;

use tracing::debug;

use super::TierRetrieve;
use crate::schema::{
    ConversationMessage, EntryKind, EntryMetadata, EntrySource, MemoryEntry, MemoryTier,
    MessageRole, ToolCallRecord,
};

const MESSAGE_IMPORTANCE: f64 = 0.4;
const TOOL_RESULT_IMPORTANCE: f64 = 0.6;
const TOOL_ERROR_IMPORTANCE: f64 = 0.9;

#[derive(Debug)]
pub struct SessionMemory {
    conversation_id: String,
    session_id: String,
    max_entries: usize,
    messages: Vec<ConversationMessage>,
    tool_calls: Vec<ToolCallRecord>,
    entries: HashMap<String, MemoryEntry>,
    /// Insertion order of `entries`, for oldest-first eviction.
    entry_order: Vec<String>,
    next_turn: u32,
}

impl SessionMemory {
    pub fn new(
        conversation_id: impl Into<String>,
        session_id: impl Into<String>,
        max_entries: usize,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            session_id: session_id.into(),
            max_entries,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            entries: HashMap::new(),
            entry_order: Vec::new(),
            next_turn: 1,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    pub fn last_turn_number(&self) -> u32 {
        self.next_turn.saturating_sub(1)
    }

    /// Append a message, assigning the next turn number, and mirror it as a
    /// `message` entry at importance 0.4.
    pub fn add_message(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
    ) -> ConversationMessage {
        let message = ConversationMessage::new(role, content, self.next_turn);
        self.next_turn += 1;

        let entry = MemoryEntry::new(MemoryTier::Session, EntryKind::Message, &message.content)
            .with_id(&message.id)
            .with_importance(MESSAGE_IMPORTANCE)
            .with_metadata(EntryMetadata {
                conversation_id: self.conversation_id.clone(),
                session_id: self.session_id.clone(),
                turn_number: Some(message.turn_number),
                source: Some(EntrySource::from(role)),
                ..Default::default()
            });
        self.insert_entry(entry);

        self.messages.push(message.clone());
        message
    }

    /// Re-insert a message that already carries a turn number (reload path).
    /// The turn counter advances past it so new turns stay monotonic.
    pub fn restore_message(&mut self, message: ConversationMessage) {
        self.next_turn = self.next_turn.max(message.turn_number + 1);
        self.messages.push(message);
        self.messages.sort_by_key(|m| m.turn_number);
    }

    /// Re-insert a tool call that already has a mirror entry (reload path).
    pub fn restore_tool_call(&mut self, call: ToolCallRecord) {
        self.tool_calls.push(call);
    }

    /// Record a tool call, mirroring it as `tool_result` (importance 0.6) or
    /// `error` (importance 0.9) depending on success.
    pub fn add_tool_call(&mut self, call: ToolCallRecord) {
        let (kind, importance, content) = if call.success {
            let rendered = call
                .result
                .as_ref()
                .map(|value| value.to_string())
                .unwrap_or_default();
            (
                EntryKind::ToolResult,
                TOOL_RESULT_IMPORTANCE,
                format!("{}: {rendered}", call.name),
            )
        } else {
            let reason = call.error.clone().unwrap_or_else(|| "unknown".to_string());
            (
                EntryKind::Error,
                TOOL_ERROR_IMPORTANCE,
                format!("{} failed: {reason}", call.name),
            )
        };

        let entry = MemoryEntry::new(MemoryTier::Session, kind, content)
            .with_id(&call.id)
            .with_importance(importance)
            .with_metadata(EntryMetadata {
                conversation_id: self.conversation_id.clone(),
                session_id: self.session_id.clone(),
                turn_number: Some(self.last_turn_number()),
                source: Some(EntrySource::Tool),
                ..Default::default()
            });
        self.insert_entry(entry);
        self.tool_calls.push(call);
    }

    pub fn insert_entry(&mut self, mut entry: MemoryEntry) {
        entry.tier = MemoryTier::Session;
        if self.entries.insert(entry.id.clone(), entry.clone()).is_none() {
            self.entry_order.push(entry.id);
        }

        while self.entries.len() > self.max_entries {
            let oldest = self.entry_order.remove(0);
            self.entries.remove(&oldest);
            debug!(id = %oldest, "evicted oldest session entry");
        }
    }

    pub fn get(&self, id: &str) -> Option<&MemoryEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryEntry> {
        let removed = self.entries.remove(id);
        if removed.is_some() {
            self.entry_order.retain(|existing| existing != id);
        }
        removed
    }

    /// Lexical search: one point per query term contained in the content,
    /// two bonus points when the whole query appears. Only positive scores
    /// are returned, best first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(MemoryEntry, f64)> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(MemoryEntry, f64)> = self
            .entries
            .values()
            .filter_map(|entry| {
                let content = entry.content.to_lowercase();
                let mut score = terms
                    .iter()
                    .filter(|term| content.contains(*term))
                    .count() as f64;
                if content.contains(&query_lower) {
                    score += 2.0;
                }
                (score > 0.0).then(|| (entry.clone(), score))
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa).then_with(|| b.created_at.cmp(&a.created_at))
        });
        scored.truncate(limit);
        scored
    }

    /// End-of-session reset. Turn numbering restarts at 1.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.tool_calls.clear();
        self.entries.clear();
        self.entry_order.clear();
        self.next_turn = 1;
    }
}

impl TierRetrieve for SessionMemory {
    fn tier(&self) -> MemoryTier {
        MemoryTier::Session
    }

    fn entries(&self) -> Vec<&MemoryEntry> {
        self.entries.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionMemory {
        SessionMemory::new("conv", "sess", 100)
    }

    #[test]
    fn turn_numbers_increase_from_one_in_call_order() {
        let mut memory = session();
        let turns: Vec<u32> = (0..5)
            .map(|i| {
                memory
                    .add_message(MessageRole::User, format!("message {i}"))
                    .turn_number
            })
            .collect();
        assert_eq!(turns, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn messages_are_mirrored_as_entries() {
        let mut memory = session();
        let message = memory.add_message(MessageRole::Assistant, "I will check the logs");
        let entry = memory.get(&message.id).expect("mirror entry");
        assert_eq!(entry.kind, EntryKind::Message);
        assert_eq!(entry.importance, 0.4);
        assert_eq!(entry.metadata.turn_number, Some(1));
        assert_eq!(entry.metadata.source, Some(EntrySource::Assistant));
    }

    #[test]
    fn failed_tool_calls_mirror_as_high_importance_errors() {
        let mut memory = session();
        memory.add_tool_call(ToolCallRecord {
            id: "call-1".into(),
            name: "compile".into(),
            arguments: serde_json::json!({}),
            result: None,
            success: false,
            duration_ms: Some(12),
            error: Some("linker failure".into()),
        });

        let entry = memory.get("call-1").expect("mirror entry");
        assert_eq!(entry.kind, EntryKind::Error);
        assert_eq!(entry.importance, 0.9);
        assert!(entry.content.contains("linker failure"));
    }

    #[test]
    fn search_prefers_full_query_matches() {
        let mut memory = session();
        memory.add_message(MessageRole::User, "the parser handles escape sequences");
        memory.add_message(MessageRole::User, "escape hatch for the config parser");

        let hits = memory.search("parser handles", 10);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].0.content.contains("handles escape"));
        assert_eq!(hits[0].1, 4.0);
        assert_eq!(hits[1].1, 1.0);
    }

    #[test]
    fn search_with_no_match_is_empty() {
        let mut memory = session();
        memory.add_message(MessageRole::User, "hello there");
        assert!(memory.search("quaternion", 5).is_empty());
    }

    #[test]
    fn entry_cap_evicts_oldest_first() {
        let mut memory = SessionMemory::new("conv", "sess", 3);
        for i in 0..5 {
            memory.add_message(MessageRole::User, format!("m{i}"));
        }
        assert_eq!(memory.entries().len(), 3);
        let contents: Vec<&str> = memory
            .entries()
            .iter()
            .map(|e| e.content.as_str())
            .collect();
        assert!(!contents.contains(&"m0"));
        assert!(!contents.contains(&"m1"));
        assert!(contents.contains(&"m4"));
    }

    #[test]
    fn clear_resets_turn_numbering() {
        let mut memory = session();
        memory.add_message(MessageRole::User, "one");
        memory.clear();
        let message = memory.add_message(MessageRole::User, "fresh start");
        assert_eq!(message.turn_number, 1);
    }
}
