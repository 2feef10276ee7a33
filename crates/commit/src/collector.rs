//! Gathering every live session artifact into one [`SessionData`] record.
//!
//! The collector owns the recording hooks for tool outputs and file changes;
//! everything else is read from the tiers and derived (extraction, decisions,
//! summary) at collection time. Independent disk reads run concurrently.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use recall_memory::{
    ArchivalMemory, ConversationMessage, EntityRelationship, ExtractedEntity, FileChangeOp,
    FileChangeRecord, KeyDecision, KnowledgeExtractor, LearnedFact, MemoryEntry, MessageRole,
    SessionMemory, Summarize, Summary, SummarizedMemory, TierRetrieve, ToolCallRecord,
    ToolOutputRecord, extract_decisions,
};
use recall_store::{ConversationLayout, FileStore};

use crate::error::CommitError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStatistics {
    pub message_count: usize,
    pub user_message_count: usize,
    pub assistant_message_count: usize,
    pub tool_call_count: usize,
    pub entity_count: usize,
    pub decision_count: usize,
    pub fact_count: usize,
    pub artifact_count: usize,
    pub file_change_count: usize,
    pub total_content_size: usize,
    pub collection_duration_ms: u64,
}

/// Per-tier entry snapshots carried alongside the session artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierEntries {
    pub session: Vec<MemoryEntry>,
    pub summarized: Vec<MemoryEntry>,
    pub archival: Vec<MemoryEntry>,
}

/// Everything the commit pipeline needs, collected at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub conversation_id: String,
    pub session_id: String,
    pub collected_at: DateTime<Utc>,
    pub messages: Vec<ConversationMessage>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_outputs: Vec<ToolOutputRecord>,
    pub file_changes: Vec<FileChangeRecord>,
    pub artifacts: Vec<String>,
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<EntityRelationship>,
    pub facts: Vec<LearnedFact>,
    pub decisions: Vec<KeyDecision>,
    pub summary: Option<Summary>,
    pub project_state: serde_json::Value,
    pub task_state: serde_json::Value,
    pub agent_state: Option<serde_json::Value>,
    pub tier_entries: TierEntries,
    pub statistics: SessionStatistics,
}

impl SessionData {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.tool_calls.is_empty()
    }
}

#[derive(Default)]
pub struct DataCollector {
    extractor: KnowledgeExtractor,
    tool_outputs: Vec<ToolOutputRecord>,
    file_changes: Vec<FileChangeRecord>,
}

impl DataCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // ── recording hooks ──────────────────────────────────────────────────

    pub fn record_tool_output(
        &mut self,
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        success: bool,
    ) {
        self.tool_outputs.push(ToolOutputRecord {
            tool_call_id: call_id.into(),
            name: name.into(),
            output: output.into(),
            success,
            timestamp: Utc::now(),
        });
    }

    pub fn record_file_change(
        &mut self,
        path: impl Into<String>,
        op: FileChangeOp,
        turn_number: u32,
        details: BTreeMap<String, serde_json::Value>,
    ) {
        self.file_changes.push(FileChangeRecord {
            path: path.into(),
            op,
            turn_number,
            timestamp: Utc::now(),
            details,
        });
    }

    pub fn tool_outputs(&self) -> &[ToolOutputRecord] {
        &self.tool_outputs
    }

    pub fn file_changes(&self) -> &[FileChangeRecord] {
        &self.file_changes
    }

    /// Reset recorded artifacts at session end.
    pub fn clear(&mut self) {
        self.tool_outputs.clear();
        self.file_changes.clear();
    }

    // ── collection ───────────────────────────────────────────────────────

    pub async fn collect(
        &self,
        session: &SessionMemory,
        summarized: &SummarizedMemory,
        archival: &ArchivalMemory,
        summarizer: &dyn Summarize,
        store: &FileStore,
        layout: &ConversationLayout,
    ) -> Result<SessionData, CommitError> {
        let started = Instant::now();
        let conversation_id = session.conversation_id().to_string();

        let messages = session.messages().to_vec();
        let tool_calls = session.tool_calls().to_vec();

        // The two state files are independent reads.
        let (project_state, task_state) = tokio::join!(
            store.read_value(layout.project_state_file()),
            store.read_value(layout.task_state_file()),
        );
        let project_state = project_state?.unwrap_or_else(empty_object);
        let task_state = task_state?.unwrap_or_else(empty_object);

        let extraction = self.extractor.extract(&messages);
        let decisions = extract_decisions(&messages);
        let summary = (!messages.is_empty())
            .then(|| summarizer.summarize(&conversation_id, &messages));

        let artifacts: Vec<String> = {
            let mut paths: Vec<String> = Vec::new();
            for change in &self.file_changes {
                if change.op != FileChangeOp::Deleted && !paths.contains(&change.path) {
                    paths.push(change.path.clone());
                }
            }
            paths
        };

        let tier_entries = TierEntries {
            session: sorted_by_creation(session.entries()),
            summarized: sorted_by_creation(summarized.entries()),
            archival: sorted_by_creation(archival.entries()),
        };

        let total_content_size = messages.iter().map(|m| m.content.len()).sum::<usize>()
            + self.tool_outputs.iter().map(|o| o.output.len()).sum::<usize>();
        let statistics = SessionStatistics {
            message_count: messages.len(),
            user_message_count: messages
                .iter()
                .filter(|m| m.role == MessageRole::User)
                .count(),
            assistant_message_count: messages
                .iter()
                .filter(|m| m.role == MessageRole::Assistant)
                .count(),
            tool_call_count: tool_calls.len(),
            entity_count: extraction.entities.len(),
            decision_count: decisions.len(),
            fact_count: extraction.facts.len(),
            artifact_count: artifacts.len(),
            file_change_count: self.file_changes.len(),
            total_content_size,
            collection_duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            messages = statistics.message_count,
            entities = statistics.entity_count,
            decisions = statistics.decision_count,
            duration_ms = statistics.collection_duration_ms,
            "session data collected"
        );
        debug!(
            tool_outputs = self.tool_outputs.len(),
            file_changes = self.file_changes.len(),
            "recorded artifacts included"
        );

        Ok(SessionData {
            conversation_id,
            session_id: session.session_id().to_string(),
            collected_at: Utc::now(),
            messages,
            tool_calls,
            tool_outputs: self.tool_outputs.clone(),
            file_changes: self.file_changes.clone(),
            artifacts,
            entities: extraction.entities,
            relationships: extraction.relationships,
            facts: extraction.facts,
            decisions,
            summary,
            project_state,
            task_state,
            agent_state: None,
            tier_entries,
            statistics,
        })
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn sorted_by_creation(mut entries: Vec<&MemoryEntry>) -> Vec<MemoryEntry> {
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    entries.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use recall_memory::HeuristicSummarizer;

    use super::*;

    async fn collect_from(session: &SessionMemory, collector: &DataCollector) -> Result<SessionData> {
        let tmp = tempfile::tempdir()?;
        let store = FileStore::default();
        let layout = ConversationLayout::new(tmp.path(), session.conversation_id());
        layout.ensure().await?;
        let summarizer = HeuristicSummarizer::default();
        Ok(collector
            .collect(
                session,
                &SummarizedMemory::new(100),
                &ArchivalMemory::new(),
                &summarizer,
                &store,
                &layout,
            )
            .await?)
    }

    #[tokio::test]
    async fn statistics_reflect_the_collected_artifacts() -> Result<()> {
        let mut session = SessionMemory::new("conv", "sess", 100);
        session.add_message(MessageRole::User, "please fix src/engine.rs");
        session.add_message(MessageRole::Assistant, "Decided to use a rewrite of the loader.");
        session.add_tool_call(ToolCallRecord {
            id: "call-1".into(),
            name: "edit".into(),
            arguments: serde_json::json!({"path": "src/engine.rs"}),
            result: Some(serde_json::json!("ok")),
            success: true,
            duration_ms: Some(3),
            error: None,
        });

        let mut collector = DataCollector::new();
        collector.record_tool_output("call-1", "edit", "patched", true);
        collector.record_file_change(
            "src/engine.rs",
            FileChangeOp::Modified,
            2,
            BTreeMap::new(),
        );

        let data = collect_from(&session, &collector).await?;
        assert_eq!(data.statistics.message_count, 2);
        assert_eq!(data.statistics.user_message_count, 1);
        assert_eq!(data.statistics.assistant_message_count, 1);
        assert_eq!(data.statistics.tool_call_count, 1);
        assert_eq!(data.statistics.decision_count, 1);
        assert_eq!(data.statistics.file_change_count, 1);
        assert_eq!(data.artifacts, vec!["src/engine.rs".to_string()]);
        assert!(data.statistics.entity_count > 0);
        assert!(data.summary.is_some());
        assert_eq!(data.tier_entries.session.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn empty_session_collects_as_empty() -> Result<()> {
        let session = SessionMemory::new("conv", "sess", 100);
        let data = collect_from(&session, &DataCollector::new()).await?;
        assert!(data.is_empty());
        assert!(data.summary.is_none());
        assert_eq!(data.statistics.message_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_state_files_default_to_empty_objects() -> Result<()> {
        let session = SessionMemory::new("conv", "sess", 100);
        let data = collect_from(&session, &DataCollector::new()).await?;
        assert!(data.project_state.is_object());
        assert!(data.task_state.is_object());
        Ok(())
    }

    #[tokio::test]
    async fn deleted_files_are_not_artifacts() -> Result<()> {
        let session = SessionMemory::new("conv", "sess", 100);
        let mut collector = DataCollector::new();
        collector.record_file_change("gone.rs", FileChangeOp::Deleted, 1, BTreeMap::new());
        collector.record_file_change("kept.rs", FileChangeOp::Created, 1, BTreeMap::new());

        let data = collect_from(&session, &collector).await?;
        assert_eq!(data.artifacts, vec!["kept.rs".to_string()]);
        assert_eq!(data.statistics.file_change_count, 2);
        Ok(())
    }
}
