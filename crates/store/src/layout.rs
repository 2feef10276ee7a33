//! On-disk layout for one conversation.
//!
//! ```text
//! <base>/<conversation_id>/
//!   session/    messages.json, tool-calls.json, tool-outputs.json, file-changes.json
//!   summaries/  summary.json, session-summary.md, decisions.json
//!   knowledge/  entities.json, facts.json, relationships.json, concepts.json
//!   context/    project-state.json, task-state.json, resumable.json
//!   archives/   snapshot-<id>.json
//!   events/     segment-<epoch_ms>.json
//!   commits/    <commit_id>.json, latest.json
//!   wal/        <commit_id>.wal.json
//! ```

use std::path::{Path, PathBuf};

use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct ConversationLayout {
    root: PathBuf,
    conversation_id: String,
}

impl ConversationLayout {
    pub fn new(base: impl AsRef<Path>, conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            root: base.as_ref().join(&conversation_id),
            conversation_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── directories ──────────────────────────────────────────────────────

    pub fn session_dir(&self) -> PathBuf {
        self.root.join("session")
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.root.join("summaries")
    }

    pub fn knowledge_dir(&self) -> PathBuf {
        self.root.join("knowledge")
    }

    pub fn context_dir(&self) -> PathBuf {
        self.root.join("context")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn commits_dir(&self) -> PathBuf {
        self.root.join("commits")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    pub fn all_dirs(&self) -> [PathBuf; 8] {
        [
            self.session_dir(),
            self.summaries_dir(),
            self.knowledge_dir(),
            self.context_dir(),
            self.archives_dir(),
            self.events_dir(),
            self.commits_dir(),
            self.wal_dir(),
        ]
    }

    /// Create every directory in the layout.
    pub async fn ensure(&self) -> Result<(), StoreError> {
        for dir in self.all_dirs() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    // ── session files ────────────────────────────────────────────────────

    pub fn messages_file(&self) -> PathBuf {
        self.session_dir().join("messages.json")
    }

    pub fn tool_calls_file(&self) -> PathBuf {
        self.session_dir().join("tool-calls.json")
    }

    pub fn tool_outputs_file(&self) -> PathBuf {
        self.session_dir().join("tool-outputs.json")
    }

    pub fn file_changes_file(&self) -> PathBuf {
        self.session_dir().join("file-changes.json")
    }

    // ── summaries ────────────────────────────────────────────────────────

    pub fn summary_file(&self) -> PathBuf {
        self.summaries_dir().join("summary.json")
    }

    pub fn session_summary_markdown(&self) -> PathBuf {
        self.summaries_dir().join("session-summary.md")
    }

    pub fn decisions_file(&self) -> PathBuf {
        self.summaries_dir().join("decisions.json")
    }

    // ── knowledge ────────────────────────────────────────────────────────

    pub fn entities_file(&self) -> PathBuf {
        self.knowledge_dir().join("entities.json")
    }

    pub fn facts_file(&self) -> PathBuf {
        self.knowledge_dir().join("facts.json")
    }

    pub fn relationships_file(&self) -> PathBuf {
        self.knowledge_dir().join("relationships.json")
    }

    pub fn concepts_file(&self) -> PathBuf {
        self.knowledge_dir().join("concepts.json")
    }

    // ── context ──────────────────────────────────────────────────────────

    pub fn project_state_file(&self) -> PathBuf {
        self.context_dir().join("project-state.json")
    }

    pub fn task_state_file(&self) -> PathBuf {
        self.context_dir().join("task-state.json")
    }

    pub fn resumable_context_file(&self) -> PathBuf {
        self.context_dir().join("resumable.json")
    }

    // ── archives / commits / wal / events ────────────────────────────────

    pub fn snapshot_file(&self, commit_id: &str) -> PathBuf {
        self.archives_dir().join(format!("snapshot-{commit_id}.json"))
    }

    pub fn commit_metadata_file(&self, commit_id: &str) -> PathBuf {
        self.commits_dir().join(format!("{commit_id}.json"))
    }

    pub fn latest_commit_file(&self) -> PathBuf {
        self.commits_dir().join("latest.json")
    }

    pub fn wal_file(&self, commit_id: &str) -> PathBuf {
        self.wal_dir().join(format!("{commit_id}.wal.json"))
    }

    pub fn segment_file(&self, epoch_ms: i64) -> PathBuf {
        self.events_dir().join(format!("segment-{epoch_ms}.json"))
    }

    /// All `snapshot-*.json` files under `archives/`, newest filename first.
    pub async fn list_snapshots(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut found = list_with(&self.archives_dir(), |name| {
            name.starts_with("snapshot-") && name.ends_with(".json")
        })
        .await?;
        found.sort();
        found.reverse();
        Ok(found)
    }

    /// All event segments, oldest first (filenames embed the epoch).
    pub async fn list_segments(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut found = list_with(&self.events_dir(), |name| {
            name.starts_with("segment-") && name.ends_with(".json")
        })
        .await?;
        found.sort();
        Ok(found)
    }

    pub async fn list_wal_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut found = list_with(&self.wal_dir(), |name| name.ends_with(".wal.json")).await?;
        found.sort();
        Ok(found)
    }
}

async fn list_with(
    dir: &Path,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(dir, e))?
    {
        let name = entry.file_name();
        if let Some(name) = name.to_str()
            && keep(name)
        {
            found.push(entry.path());
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::ConversationLayout;

    #[test]
    fn paths_follow_conversation_root() {
        let layout = ConversationLayout::new("/data/brain", "conv-1");
        assert_eq!(
            layout.messages_file(),
            std::path::PathBuf::from("/data/brain/conv-1/session/messages.json")
        );
        assert_eq!(
            layout.wal_file("commit-170000-abcd1234"),
            std::path::PathBuf::from("/data/brain/conv-1/wal/commit-170000-abcd1234.wal.json")
        );
        assert_eq!(
            layout.snapshot_file("c1"),
            std::path::PathBuf::from("/data/brain/conv-1/archives/snapshot-c1.json")
        );
    }

    #[tokio::test]
    async fn ensure_creates_all_directories() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = ConversationLayout::new(tmp.path(), "conv-2");
        layout.ensure().await?;
        for dir in layout.all_dirs() {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        Ok(())
    }

    #[tokio::test]
    async fn listing_missing_directories_is_empty_not_an_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = ConversationLayout::new(tmp.path(), "conv-3");
        assert!(layout.list_snapshots().await?.is_empty());
        assert!(layout.list_segments().await?.is_empty());
        Ok(())
    }
}
