//! Snapshot and commit-metadata records.
//!
//! Two distinct hashes live here on purpose: [`SessionSnapshot::checksum`]
//! covers the fixed subset `{messages, tool_calls, summary, key_decisions}`
//! and travels inside the snapshot file for integrity verification, while
//! [`CommitChecksums::global`] (computed by the validator) covers every
//! component and lives in the commit metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recall_memory::{
    ConversationMessage, ExtractedEntity, KeyDecision, LearnedFact, Summary, ToolCallRecord,
};
use recall_store::checksum_value;

use crate::collector::{SessionData, SessionStatistics};

pub const SNAPSHOT_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitChecksums {
    /// One SHA-256 per top-level component.
    pub components: BTreeMap<String, String>,
    /// Hash over `{conversation_id, session_id, message_count, components}`.
    pub global: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub conversation_id: String,
    pub session_id: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub messages: Vec<ConversationMessage>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub artifacts: Vec<String>,
    pub project_state: serde_json::Value,
    pub task_state: serde_json::Value,
    pub agent_state: Option<serde_json::Value>,
    pub summary: Option<Summary>,
    pub key_decisions: Vec<KeyDecision>,
    pub learned_facts: Vec<LearnedFact>,
    pub entities: Vec<ExtractedEntity>,
    pub statistics: SessionStatistics,
    pub checksum: String,
}

impl SessionSnapshot {
    pub fn from_data(commit_id: &str, data: &SessionData) -> Self {
        let checksum = Self::compute_checksum(
            &data.messages,
            &data.tool_calls,
            data.summary.as_ref(),
            &data.decisions,
        );
        Self {
            id: commit_id.to_string(),
            conversation_id: data.conversation_id.clone(),
            session_id: data.session_id.clone(),
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: Utc::now(),
            messages: data.messages.clone(),
            tool_calls: data.tool_calls.clone(),
            artifacts: data.artifacts.clone(),
            project_state: data.project_state.clone(),
            task_state: data.task_state.clone(),
            agent_state: data.agent_state.clone(),
            summary: data.summary.clone(),
            key_decisions: data.decisions.clone(),
            learned_facts: data.facts.clone(),
            entities: data.entities.clone(),
            statistics: data.statistics.clone(),
            checksum,
        }
    }

    /// Hash of the canonical JSON of the integrity-bearing subset.
    pub fn compute_checksum(
        messages: &[ConversationMessage],
        tool_calls: &[ToolCallRecord],
        summary: Option<&Summary>,
        key_decisions: &[KeyDecision],
    ) -> String {
        let subset = serde_json::json!({
            "messages": messages,
            "tool_calls": tool_calls,
            "summary": summary,
            "key_decisions": key_decisions,
        });
        checksum_value(&subset)
    }

    /// Recompute the subset hash and compare with the embedded one.
    pub fn verify(&self) -> bool {
        let expected = Self::compute_checksum(
            &self.messages,
            &self.tool_calls,
            self.summary.as_ref(),
            &self.key_decisions,
        );
        expected == self.checksum
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub commit_id: String,
    pub conversation_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub previous_commit_id: Option<String>,
    pub checksums: CommitChecksums,
    pub statistics: SessionStatistics,
    /// Component name → path relative to the conversation root.
    pub paths: BTreeMap<String, String>,
}
