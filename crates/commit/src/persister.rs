//! WAL-protected multi-file commit persistence.
//!
//! Every commit journals its intent into `wal/<commit_id>.wal.json` before
//! touching data files. A commit that reaches `commit.complete` deletes its
//! WAL; one that does not is rolled back, either immediately on failure or
//! by [`CommitPersister::recover_from_wal`] at the next startup. Rollback
//! removes only commit-scoped artifacts (the snapshot and a resumable
//! context generated by this commit); shared files like `messages.json` are
//! left in place because they may legitimately pre-date the failed commit.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use recall_memory::EntityKind;
use recall_store::{ConversationLayout, FileStore};

use crate::collector::SessionData;
use crate::error::CommitError;
use crate::resumable::ResumableContext;
use crate::snapshot::{CommitMetadata, SessionSnapshot};

/// `commit-<epoch_ms>-<8 random chars>`.
pub fn new_commit_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("commit-{}-{}", Utc::now().timestamp_millis(), suffix)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op: String,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestPointer {
    pub commit_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub commit_id: String,
    pub files_written: Vec<String>,
}

pub struct CommitPersister {
    store: FileStore,
    layout: ConversationLayout,
    wal_enabled: bool,
}

impl CommitPersister {
    pub fn new(store: FileStore, layout: ConversationLayout, wal_enabled: bool) -> Self {
        Self {
            store,
            layout,
            wal_enabled,
        }
    }

    pub fn layout(&self) -> &ConversationLayout {
        &self.layout
    }

    // ── commit pointers ──────────────────────────────────────────────────

    pub async fn load_latest(&self) -> Result<Option<LatestPointer>, CommitError> {
        Ok(self.store.read_json(self.layout.latest_commit_file()).await?)
    }

    pub async fn load_metadata(
        &self,
        commit_id: &str,
    ) -> Result<Option<CommitMetadata>, CommitError> {
        Ok(self
            .store
            .read_json(self.layout.commit_metadata_file(commit_id))
            .await?)
    }

    pub async fn load_snapshot(
        &self,
        commit_id: &str,
    ) -> Result<Option<SessionSnapshot>, CommitError> {
        Ok(self
            .store
            .read_json(self.layout.snapshot_file(commit_id))
            .await?)
    }

    // ── persist ──────────────────────────────────────────────────────────

    pub async fn persist(
        &self,
        data: &SessionData,
        snapshot: &SessionSnapshot,
        metadata: &CommitMetadata,
        context: Option<&ResumableContext>,
    ) -> Result<PersistOutcome, CommitError> {
        let commit_id = metadata.commit_id.clone();
        let mut wal = Vec::new();

        match self
            .write_sequence(&commit_id, data, snapshot, metadata, context, &mut wal)
            .await
        {
            Ok(files_written) => {
                self.complete(&commit_id, &mut wal).await;
                info!(
                    commit_id = %commit_id,
                    files = files_written.len(),
                    "commit persisted"
                );
                Ok(PersistOutcome {
                    commit_id,
                    files_written,
                })
            }
            Err(error) => {
                warn!(commit_id = %commit_id, %error, "commit failed, rolling back");
                self.rollback_wal(&commit_id).await;
                Err(error)
            }
        }
    }

    async fn write_sequence(
        &self,
        commit_id: &str,
        data: &SessionData,
        snapshot: &SessionSnapshot,
        metadata: &CommitMetadata,
        context: Option<&ResumableContext>,
        wal: &mut Vec<WalEntry>,
    ) -> Result<Vec<String>, CommitError> {
        let layout = &self.layout;
        let mut files = Vec::new();

        self.log_wal(
            commit_id,
            wal,
            "commit.prepare",
            serde_json::json!({ "commit_id": commit_id }),
        )
        .await?;

        self.store
            .write_json(layout.snapshot_file(commit_id), snapshot)
            .await?;
        files.push(format!("archives/snapshot-{commit_id}.json"));
        self.log_wal(commit_id, wal, "commit.snapshot", serde_json::json!({}))
            .await?;

        self.store
            .write_json(layout.messages_file(), &data.messages)
            .await?;
        files.push("session/messages.json".to_string());
        self.log_wal(commit_id, wal, "commit.messages", serde_json::json!({}))
            .await?;

        self.store
            .write_json(layout.entities_file(), &data.entities)
            .await?;
        files.push("knowledge/entities.json".to_string());
        self.log_wal(commit_id, wal, "commit.entities", serde_json::json!({}))
            .await?;

        self.store
            .write_json(layout.decisions_file(), &data.decisions)
            .await?;
        files.push("summaries/decisions.json".to_string());
        self.log_wal(commit_id, wal, "commit.decisions", serde_json::json!({}))
            .await?;

        self.store
            .write_json(layout.facts_file(), &data.facts)
            .await?;
        files.push("knowledge/facts.json".to_string());
        self.store
            .write_json(layout.relationships_file(), &data.relationships)
            .await?;
        files.push("knowledge/relationships.json".to_string());

        let concepts: Vec<_> = data
            .entities
            .iter()
            .filter(|entity| entity.kind == EntityKind::Concept)
            .collect();
        if !concepts.is_empty() {
            self.store
                .write_json(layout.concepts_file(), &concepts)
                .await?;
            files.push("knowledge/concepts.json".to_string());
        }

        if !data.tool_calls.is_empty() {
            self.store
                .write_json(layout.tool_calls_file(), &data.tool_calls)
                .await?;
            files.push("session/tool-calls.json".to_string());
        }
        if !data.tool_outputs.is_empty() {
            self.store
                .write_json(layout.tool_outputs_file(), &data.tool_outputs)
                .await?;
            files.push("session/tool-outputs.json".to_string());
        }
        if !data.file_changes.is_empty() {
            self.store
                .write_json(layout.file_changes_file(), &data.file_changes)
                .await?;
            files.push("session/file-changes.json".to_string());
        }

        if let Some(summary) = &data.summary {
            self.store
                .write_json(layout.summary_file(), summary)
                .await?;
            files.push("summaries/summary.json".to_string());
            self.store
                .write_string(
                    layout.session_summary_markdown(),
                    &render_summary_markdown(summary),
                )
                .await?;
            files.push("summaries/session-summary.md".to_string());
        }

        self.store
            .write_json(layout.project_state_file(), &data.project_state)
            .await?;
        files.push("context/project-state.json".to_string());
        self.store
            .write_json(layout.task_state_file(), &data.task_state)
            .await?;
        files.push("context/task-state.json".to_string());

        if let Some(context) = context {
            self.store
                .write_json(layout.resumable_context_file(), context)
                .await?;
            files.push("context/resumable.json".to_string());
            self.log_wal(commit_id, wal, "commit.context", serde_json::json!({}))
                .await?;
        }

        self.store
            .write_json(layout.commit_metadata_file(commit_id), metadata)
            .await?;
        files.push(format!("commits/{commit_id}.json"));

        self.store
            .write_json(
                layout.latest_commit_file(),
                &LatestPointer {
                    commit_id: commit_id.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await?;
        files.push("commits/latest.json".to_string());

        Ok(files)
    }

    async fn complete(&self, commit_id: &str, wal: &mut Vec<WalEntry>) {
        // The commit is durable at this point; completion bookkeeping
        // failures are logged, and recovery treats an existing metadata file
        // as proof of completion.
        if let Err(error) = self
            .log_wal(commit_id, wal, "commit.complete", serde_json::json!({}))
            .await
        {
            warn!(commit_id, %error, "failed to journal commit completion");
        }
        if let Err(error) = self
            .store
            .remove_if_exists(self.layout.wal_file(commit_id))
            .await
        {
            warn!(commit_id, %error, "failed to remove commit WAL");
        }
    }

    async fn log_wal(
        &self,
        commit_id: &str,
        wal: &mut Vec<WalEntry>,
        op: &str,
        detail: serde_json::Value,
    ) -> Result<(), CommitError> {
        if !self.wal_enabled {
            return Ok(());
        }
        wal.push(WalEntry {
            op: op.to_string(),
            timestamp: Utc::now(),
            detail,
        });
        self.store
            .write_json(self.layout.wal_file(commit_id), wal)
            .await?;
        Ok(())
    }

    // ── rollback & recovery ──────────────────────────────────────────────

    /// Undo a commit's artifacts by walking its WAL in reverse. Only files
    /// owned by this commit are removed; a resumable context is deleted only
    /// when it was generated by this commit.
    pub async fn rollback_wal(&self, commit_id: &str) {
        let entries: Vec<WalEntry> = self
            .store
            .read_json(self.layout.wal_file(commit_id))
            .await
            .ok()
            .flatten()
            .unwrap_or_default();

        for entry in entries.iter().rev() {
            match entry.op.as_str() {
                "commit.snapshot" => {
                    let _ = self
                        .store
                        .remove_if_exists(self.layout.snapshot_file(commit_id))
                        .await;
                }
                "commit.context" => {
                    self.remove_context_if_owned(commit_id).await;
                }
                _ => {}
            }
        }
        // Even with an unreadable WAL, the snapshot file is commit-scoped by
        // name and safe to remove.
        if entries.is_empty() {
            let _ = self
                .store
                .remove_if_exists(self.layout.snapshot_file(commit_id))
                .await;
            self.remove_context_if_owned(commit_id).await;
        }

        let _ = self
            .store
            .remove_if_exists(self.layout.wal_file(commit_id))
            .await;
        debug!(commit_id, "rolled back incomplete commit");
    }

    async fn remove_context_if_owned(&self, commit_id: &str) {
        let owned = match self
            .store
            .read_value(self.layout.resumable_context_file())
            .await
        {
            Ok(Some(value)) => value
                .get("commit_id")
                .and_then(|id| id.as_str())
                .is_some_and(|id| id == commit_id),
            _ => false,
        };
        if owned {
            let _ = self
                .store
                .remove_if_exists(self.layout.resumable_context_file())
                .await;
        }
    }

    /// Startup recovery: roll back every WAL without a completion marker,
    /// then sweep temp-file residue from interrupted atomic writes.
    pub async fn recover_from_wal(&self) -> Result<usize, CommitError> {
        let mut recovered = 0;

        for path in self.layout.list_wal_files().await? {
            let Some(commit_id) = wal_commit_id(&path) else {
                continue;
            };

            let completed = match self.store.read_json::<Vec<WalEntry>>(&path).await {
                Ok(Some(entries)) => entries.iter().any(|entry| entry.op == "commit.complete"),
                // Unreadable or missing WAL content: treat as incomplete.
                _ => false,
            };

            // A metadata file proves the commit finished even if the WAL
            // lingered past completion.
            let has_metadata = self.load_metadata(&commit_id).await?.is_some();

            if completed || has_metadata {
                let _ = self.store.remove_if_exists(&path).await;
                continue;
            }

            warn!(commit_id = %commit_id, "recovering incomplete commit");
            self.rollback_wal(&commit_id).await;
            recovered += 1;
        }

        for dir in self.layout.all_dirs() {
            let _ = self.store.sweep_tmp_files(&dir).await;
        }

        if recovered > 0 {
            info!(commits = recovered, "WAL recovery rolled back incomplete commits");
        }
        Ok(recovered)
    }
}

fn wal_commit_id(path: &std::path::Path) -> Option<String> {
    path.file_name()?
        .to_str()?
        .strip_suffix(".wal.json")
        .map(str::to_string)
}

fn render_summary_markdown(summary: &recall_memory::Summary) -> String {
    let mut rendered = format!("# Session Summary\n\n{}\n", summary.content);

    if !summary.key_points.is_empty() {
        rendered.push_str("\n## Key Points\n\n");
        for point in &summary.key_points {
            rendered.push_str(&format!("- {point}\n"));
        }
    }
    if !summary.decisions.is_empty() {
        rendered.push_str("\n## Decisions\n\n");
        for decision in &summary.decisions {
            rendered.push_str(&format!("- {decision}\n"));
        }
    }
    if !summary.errors.is_empty() {
        rendered.push_str("\n## Errors\n\n");
        for error in &summary.errors {
            match &error.solution {
                Some(solution) => {
                    rendered.push_str(&format!("- {} ({solution})\n", error.description));
                }
                None => rendered.push_str(&format!("- {}\n", error.description)),
            }
        }
    }
    if !summary.files_modified.is_empty() {
        rendered.push_str("\n## Files\n\n");
        for file in &summary.files_modified {
            rendered.push_str(&format!("- `{file}`\n"));
        }
    }
    if !summary.current_state.is_empty() {
        rendered.push_str(&format!("\n## Current State\n\n{}\n", summary.current_state));
    }
    if !summary.next_steps.is_empty() {
        rendered.push_str("\n## Next Steps\n\n");
        for step in &summary.next_steps {
            rendered.push_str(&format!("- {step}\n"));
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::Utc;

    use recall_memory::{ConversationMessage, MessageRole};

    use super::*;
    use crate::collector::{SessionStatistics, TierEntries};
    use crate::resumable::ResumableContextGenerator;
    use crate::snapshot::CommitChecksums;
    use crate::validator::CommitValidator;

    fn sample_data(turns: usize) -> SessionData {
        let messages: Vec<ConversationMessage> = (0..turns)
            .map(|i| {
                ConversationMessage::new(
                    if i % 2 == 0 {
                        MessageRole::User
                    } else {
                        MessageRole::Assistant
                    },
                    format!("turn body {i}"),
                    i as u32 + 1,
                )
            })
            .collect();
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
            artifacts: Vec::new(),
            entities: Vec::new(),
            relationships: Vec::new(),
            facts: Vec::new(),
            decisions: Vec::new(),
            summary: None,
            project_state: serde_json::json!({}),
            task_state: serde_json::json!({}),
            agent_state: None,
            tier_entries: TierEntries::default(),
            statistics,
        }
    }

    fn metadata_for(commit_id: &str, data: &SessionData) -> CommitMetadata {
        CommitMetadata {
            commit_id: commit_id.to_string(),
            conversation_id: data.conversation_id.clone(),
            session_id: data.session_id.clone(),
            timestamp: Utc::now(),
            version: crate::snapshot::SNAPSHOT_VERSION.to_string(),
            previous_commit_id: None,
            checksums: CommitValidator::new()
                .calculate_all_checksums(data)
                .unwrap_or_else(|_| CommitChecksums::default()),
            statistics: data.statistics.clone(),
            paths: Default::default(),
        }
    }

    async fn persister(base: &std::path::Path) -> Result<CommitPersister> {
        let layout = ConversationLayout::new(base, "conv");
        layout.ensure().await?;
        Ok(CommitPersister::new(FileStore::default(), layout, true))
    }

    #[tokio::test]
    async fn successful_commit_leaves_no_wal_and_updates_latest() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let persister = persister(tmp.path()).await?;
        let data = sample_data(3);
        let commit_id = new_commit_id();
        let snapshot = SessionSnapshot::from_data(&commit_id, &data);
        let metadata = metadata_for(&commit_id, &data);
        let context = ResumableContextGenerator::new().generate(&commit_id, &data);

        let outcome = persister
            .persist(&data, &snapshot, &metadata, Some(&context))
            .await?;
        assert_eq!(outcome.commit_id, commit_id);

        let layout = persister.layout().clone();
        assert!(layout.snapshot_file(&commit_id).exists());
        assert!(layout.messages_file().exists());
        assert!(layout.resumable_context_file().exists());
        assert!(!layout.wal_file(&commit_id).exists());

        let latest = persister.load_latest().await?.expect("latest pointer");
        assert_eq!(latest.commit_id, commit_id);
        Ok(())
    }

    #[tokio::test]
    async fn empty_collections_write_no_optional_files() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let persister = persister(tmp.path()).await?;
        let data = sample_data(1);
        let commit_id = new_commit_id();
        let snapshot = SessionSnapshot::from_data(&commit_id, &data);
        let metadata = metadata_for(&commit_id, &data);

        persister.persist(&data, &snapshot, &metadata, None).await?;

        let layout = persister.layout();
        assert!(!layout.tool_calls_file().exists());
        assert!(!layout.tool_outputs_file().exists());
        assert!(!layout.file_changes_file().exists());
        assert!(!layout.resumable_context_file().exists());
        Ok(())
    }

    #[tokio::test]
    async fn mid_sequence_failure_rolls_back_the_snapshot() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let persister = persister(tmp.path()).await?;
        let layout = persister.layout().clone();

        // Force the messages write to fail: a directory squats on its path.
        tokio::fs::create_dir_all(layout.messages_file()).await?;

        let data = sample_data(2);
        let commit_id = new_commit_id();
        let snapshot = SessionSnapshot::from_data(&commit_id, &data);
        let metadata = metadata_for(&commit_id, &data);
        let context = ResumableContextGenerator::new().generate(&commit_id, &data);

        let result = persister
            .persist(&data, &snapshot, &metadata, Some(&context))
            .await;
        assert!(result.is_err());

        assert!(!layout.snapshot_file(&commit_id).exists());
        assert!(!layout.wal_file(&commit_id).exists());
        assert!(!layout.resumable_context_file().exists());
        assert!(persister.load_latest().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn recovery_rolls_back_incomplete_commits_only() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let persister = persister(tmp.path()).await?;
        let layout = persister.layout().clone();
        let store = FileStore::default();
        let data = sample_data(2);

        // A finished commit.
        let done_id = new_commit_id();
        let snapshot = SessionSnapshot::from_data(&done_id, &data);
        let metadata = metadata_for(&done_id, &data);
        persister.persist(&data, &snapshot, &metadata, None).await?;

        // A simulated crash: WAL without completion, snapshot on disk, and a
        // resumable context owned by the crashed commit.
        let crashed_id = "commit-1111-crashed";
        let crashed_snapshot = SessionSnapshot::from_data(crashed_id, &data);
        store
            .write_json(layout.snapshot_file(crashed_id), &crashed_snapshot)
            .await?;
        let crashed_context = ResumableContextGenerator::new().generate(crashed_id, &data);
        store
            .write_json(layout.resumable_context_file(), &crashed_context)
            .await?;
        store
            .write_json(
                layout.wal_file(crashed_id),
                &vec![
                    WalEntry {
                        op: "commit.prepare".into(),
                        timestamp: Utc::now(),
                        detail: serde_json::json!({}),
                    },
                    WalEntry {
                        op: "commit.snapshot".into(),
                        timestamp: Utc::now(),
                        detail: serde_json::json!({}),
                    },
                    WalEntry {
                        op: "commit.context".into(),
                        timestamp: Utc::now(),
                        detail: serde_json::json!({}),
                    },
                ],
            )
            .await?;

        let recovered = persister.recover_from_wal().await?;
        assert_eq!(recovered, 1);

        assert!(!layout.snapshot_file(crashed_id).exists());
        assert!(!layout.resumable_context_file().exists());
        assert!(!layout.wal_file(crashed_id).exists());

        // The earlier commit is untouched.
        assert!(layout.snapshot_file(&done_id).exists());
        assert_eq!(
            persister.load_latest().await?.expect("latest").commit_id,
            done_id
        );
        Ok(())
    }

    #[tokio::test]
    async fn recovery_keeps_context_belonging_to_an_earlier_commit() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let persister = persister(tmp.path()).await?;
        let layout = persister.layout().clone();
        let store = FileStore::default();
        let data = sample_data(2);

        // Commit A completes and owns the resumable context.
        let commit_a = new_commit_id();
        let snapshot_a = SessionSnapshot::from_data(&commit_a, &data);
        let metadata_a = metadata_for(&commit_a, &data);
        let context_a = ResumableContextGenerator::new().generate(&commit_a, &data);
        persister
            .persist(&data, &snapshot_a, &metadata_a, Some(&context_a))
            .await?;

        // Commit B crashes before writing its context.
        let commit_b = "commit-2222-crashed";
        store
            .write_json(
                layout.snapshot_file(commit_b),
                &SessionSnapshot::from_data(commit_b, &data),
            )
            .await?;
        store
            .write_json(
                layout.wal_file(commit_b),
                &vec![WalEntry {
                    op: "commit.snapshot".into(),
                    timestamp: Utc::now(),
                    detail: serde_json::json!({}),
                }],
            )
            .await?;

        persister.recover_from_wal().await?;

        assert!(!layout.snapshot_file(commit_b).exists());
        // Commit A's context survives B's rollback.
        let kept: Option<ResumableContext> =
            store.read_json(layout.resumable_context_file()).await?;
        assert_eq!(kept.expect("context kept").commit_id, commit_a);
        Ok(())
    }

    #[tokio::test]
    async fn recovery_deletes_stale_wal_of_a_completed_commit() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let persister = persister(tmp.path()).await?;
        let layout = persister.layout().clone();
        let store = FileStore::default();
        let data = sample_data(1);

        let commit_id = new_commit_id();
        let snapshot = SessionSnapshot::from_data(&commit_id, &data);
        let metadata = metadata_for(&commit_id, &data);
        persister.persist(&data, &snapshot, &metadata, None).await?;

        // Metadata exists, so even a lingering WAL must not trigger rollback.
        store
            .write_json(
                layout.wal_file(&commit_id),
                &vec![WalEntry {
                    op: "commit.snapshot".into(),
                    timestamp: Utc::now(),
                    detail: serde_json::json!({}),
                }],
            )
            .await?;

        let recovered = persister.recover_from_wal().await?;
        assert_eq!(recovered, 0);
        assert!(!layout.wal_file(&commit_id).exists());
        assert!(layout.snapshot_file(&commit_id).exists());
        Ok(())
    }

    #[test]
    fn commit_ids_follow_the_expected_shape() {
        let id = new_commit_id();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "commit");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
