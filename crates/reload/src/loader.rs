//! Loading resume context from the best available source.
//!
//! Order of preference: a clean `context/resumable.json`, then the latest
//! snapshot (by filename epoch), then any valid snapshot. Snapshot loads go
//! through a fixed projection into the same hot/warm/cold shape the commit
//! pipeline produces, so downstream compilation is source-agnostic.

use serde::Serialize;
use tracing::{info, warn};

use recall_commit::{
    ColdContext, HotContext, ResumableContext, SessionSnapshot, WarmContext,
};
use recall_memory::{MessageRole, token_estimate};
use recall_store::{ConversationLayout, FileStore};

use crate::error::ReloadError;
use crate::integrity::{IntegrityChecker, IntegrityReport};

const PROJECTED_DECISIONS: usize = 5;
const PROJECTED_ENTITIES: usize = 10;
const PROJECTED_FACTS: usize = 5;
const PROJECTED_FILES: usize = 10;
const COLD_TOKEN_ESTIMATE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    Context,
    Snapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadedTokenEstimates {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedContext {
    pub hot: HotContext,
    pub warm: WarmContext,
    pub cold: ColdContext,
    pub source: ContextSource,
    pub version: String,
    /// `ok` when the preferred source loaded, `recovered` when a snapshot
    /// stood in for an unusable context file.
    pub integrity_status: String,
    pub token_estimates: LoadedTokenEstimates,
}

pub struct ContextLoader {
    store: FileStore,
    layout: ConversationLayout,
    max_snapshots_to_check: usize,
}

impl ContextLoader {
    pub fn new(store: FileStore, layout: ConversationLayout, max_snapshots_to_check: usize) -> Self {
        Self {
            store,
            layout,
            max_snapshots_to_check,
        }
    }

    pub async fn load(&self) -> Result<(LoadedContext, IntegrityReport), ReloadError> {
        let checker = IntegrityChecker::new(
            self.store.clone(),
            self.layout.clone(),
            self.max_snapshots_to_check,
        );
        let report = checker.check().await?;

        if !report.can_proceed {
            return Err(ReloadError::NoContextData);
        }

        if report.context_usable {
            let context: Option<ResumableContext> = self
                .store
                .read_json(self.layout.resumable_context_file())
                .await?;
            if let Some(context) = context {
                info!(commit_id = %context.commit_id, "context loaded from resumable file");
                let loaded = LoadedContext {
                    token_estimates: estimates(&context.hot, &context.warm),
                    hot: context.hot,
                    warm: context.warm,
                    cold: context.cold,
                    source: ContextSource::Context,
                    version: context.version,
                    integrity_status: "ok".to_string(),
                };
                return Ok((loaded, report));
            }
        }

        // Fall back to the best snapshot.
        let path = report
            .latest_snapshot
            .clone()
            .or_else(|| report.fallback_snapshot.clone())
            .ok_or(ReloadError::NoContextData)?;
        let snapshot: SessionSnapshot = self
            .store
            .read_json(&path)
            .await?
            .ok_or_else(|| ReloadError::Snapshot(format!("{} disappeared", path.display())))?;

        if !snapshot.verify() {
            warn!(snapshot = %snapshot.id, "snapshot checksum mismatch, loading anyway");
        }
        info!(snapshot = %snapshot.id, "context recovered from snapshot");

        let loaded = project_snapshot(&snapshot);
        Ok((loaded, report))
    }
}

/// Reshape a snapshot into hot/warm/cold resume context.
pub fn project_snapshot(snapshot: &SessionSnapshot) -> LoadedContext {
    let last_user_message = snapshot
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.clone());
    let last_assistant_message = snapshot
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
        .map(|m| m.content.clone())
        .or_else(|| snapshot.summary.as_ref().map(|s| s.content.clone()));

    let mut files: Vec<String> = snapshot.artifacts.clone();
    if let Some(summary) = &snapshot.summary {
        for file in &summary.files_modified {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
    }

    let hot = HotContext {
        last_user_message,
        last_assistant_message,
        current_task: snapshot
            .task_state
            .get("current_task")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        task_status: snapshot
            .task_state
            .get("status")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        recent_messages: Vec::new(),
        active_files: files.iter().take(PROJECTED_FILES).cloned().collect(),
        last_turn_number: snapshot.messages.last().map(|m| m.turn_number).unwrap_or(0),
    };

    let mut by_mentions: Vec<(&str, usize)> = snapshot
        .entities
        .iter()
        .map(|e| (e.name.as_str(), e.mentions.len()))
        .collect();
    by_mentions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let warm = WarmContext {
        session_summary: snapshot
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .unwrap_or_default(),
        recent_decisions: snapshot
            .key_decisions
            .iter()
            .rev()
            .take(PROJECTED_DECISIONS)
            .map(|d| d.title.clone())
            .collect(),
        active_entities: by_mentions
            .into_iter()
            .take(PROJECTED_ENTITIES)
            .map(|(name, _)| name.to_string())
            .collect(),
        key_facts: snapshot
            .learned_facts
            .iter()
            .take(PROJECTED_FACTS)
            .map(|f| f.content.clone())
            .collect(),
        conversation_topics: Vec::new(),
        resolved_errors: snapshot
            .summary
            .as_ref()
            .map(|s| s.errors.iter().map(|e| e.description.clone()).collect())
            .unwrap_or_default(),
        files_modified: files,
    };

    let cold = ColdContext {
        commit_id: snapshot.id.clone(),
        snapshot_path: format!("archives/snapshot-{}.json", snapshot.id),
        archive_dir: "archives".to_string(),
        entity_index_path: "knowledge/entities.json".to_string(),
        decision_log_path: "summaries/decisions.json".to_string(),
        total_messages: snapshot.messages.len(),
        total_entities: snapshot.entities.len(),
        session_duration_ms: match (snapshot.messages.first(), snapshot.messages.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_milliseconds().max(0) as u64
            }
            _ => 0,
        },
    };

    LoadedContext {
        token_estimates: estimates(&hot, &warm),
        hot,
        warm,
        cold,
        source: ContextSource::Snapshot,
        version: snapshot.version.clone(),
        integrity_status: "recovered".to_string(),
    }
}

fn estimates(hot: &HotContext, warm: &WarmContext) -> LoadedTokenEstimates {
    let hot_tokens = estimate_json(hot);
    let warm_tokens = estimate_json(warm);
    LoadedTokenEstimates {
        hot: hot_tokens,
        warm: warm_tokens,
        cold: COLD_TOKEN_ESTIMATE,
        total: hot_tokens + warm_tokens + COLD_TOKEN_ESTIMATE,
    }
}

fn estimate_json<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value)
        .map(|rendered| token_estimate(&rendered))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::Utc;

    use recall_commit::{
        ResumableContextGenerator, SessionData, SessionStatistics, TierEntries,
    };
    use recall_memory::{ConversationMessage, MessageRole};

    use super::*;

    fn sample_data() -> SessionData {
        let messages = vec![
            ConversationMessage::new(MessageRole::User, "Hello", 1),
            ConversationMessage::new(MessageRole::Assistant, "Hi, resuming context", 2),
        ];
        let statistics = SessionStatistics {
            message_count: messages.len(),
            ..Default::default()
        };
        SessionData {
            conversation_id: "conv".into(),
            session_id: "sess".into(),
            collected_at: Utc::now(),
            messages,
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
            file_changes: Vec::new(),
            artifacts: vec!["src/lib.rs".into()],
            entities: Vec::new(),
            relationships: Vec::new(),
            facts: Vec::new(),
            decisions: Vec::new(),
            summary: None,
            project_state: serde_json::json!({}),
            task_state: serde_json::json!({"current_task": "ship it", "status": "active"}),
            agent_state: None,
            tier_entries: TierEntries::default(),
            statistics,
        }
    }

    async fn loader(base: &std::path::Path) -> Result<(ContextLoader, ConversationLayout, FileStore)> {
        let store = FileStore::default();
        let layout = ConversationLayout::new(base, "conv");
        layout.ensure().await?;
        Ok((
            ContextLoader::new(store.clone(), layout.clone(), 10),
            layout,
            store,
        ))
    }

    #[tokio::test]
    async fn prefers_the_resumable_context_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let (loader, layout, store) = loader(tmp.path()).await?;
        let data = sample_data();
        let context = ResumableContextGenerator::new().generate("commit-3-ok", &data);
        store
            .write_json(layout.resumable_context_file(), &context)
            .await?;

        let (loaded, _) = loader.load().await?;
        assert_eq!(loaded.source, ContextSource::Context);
        assert_eq!(loaded.integrity_status, "ok");
        assert_eq!(loaded.hot.last_user_message.as_deref(), Some("Hello"));
        assert_eq!(loaded.cold.total_messages, 2);
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_context_recovers_from_a_snapshot() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let (loader, layout, store) = loader(tmp.path()).await?;
        let data = sample_data();

        tokio::fs::write(layout.resumable_context_file(), b"###").await?;
        let snapshot = SessionSnapshot::from_data("commit-44-snap", &data);
        store
            .write_json(layout.snapshot_file("commit-44-snap"), &snapshot)
            .await?;

        let (loaded, report) = loader.load().await?;
        assert_eq!(loaded.source, ContextSource::Snapshot);
        assert_eq!(loaded.integrity_status, "recovered");
        assert_eq!(loaded.hot.last_user_message.as_deref(), Some("Hello"));
        assert_eq!(loaded.hot.current_task.as_deref(), Some("ship it"));
        assert!(loaded.warm.files_modified.contains(&"src/lib.rs".to_string()));
        assert!(!report.context_usable);
        Ok(())
    }

    #[tokio::test]
    async fn nothing_on_disk_fails_with_no_context_data() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let (loader, _, _) = loader(tmp.path()).await?;
        match loader.load().await {
            Err(ReloadError::NoContextData) => Ok(()),
            other => anyhow::bail!("expected NoContextData, got {other:?}"),
        }
    }

    #[test]
    fn projection_fills_assistant_slot_from_summary_when_needed() {
        let mut data = sample_data();
        data.messages.retain(|m| m.role == MessageRole::User);
        data.summary = Some(recall_memory::Summary {
            id: "s".into(),
            conversation_id: "conv".into(),
            kind: recall_memory::SummaryKind::Session,
            content: "summary narrative".into(),
            key_points: Vec::new(),
            decisions: Vec::new(),
            errors: Vec::new(),
            files_modified: vec!["src/a.rs".into()],
            current_state: "mid-flight".into(),
            next_steps: Vec::new(),
            timestamp: Utc::now(),
            source_messages: 1,
            tokens: 5,
        });
        data.statistics.message_count = data.messages.len();

        let snapshot = SessionSnapshot::from_data("commit-5-proj", &data);
        let loaded = project_snapshot(&snapshot);

        assert_eq!(
            loaded.hot.last_assistant_message.as_deref(),
            Some("summary narrative")
        );
        assert_eq!(loaded.warm.session_summary, "summary narrative");
        assert!(loaded.hot.active_files.contains(&"src/a.rs".to_string()));
        assert_eq!(loaded.cold.commit_id, "commit-5-proj");
    }
}
