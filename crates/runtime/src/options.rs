//! Request and result envelopes for the engine's public operations.
//!
//! Every top-level operation returns one of these values with `success` and
//! `error` populated instead of propagating errors across the public
//! boundary.

use chrono::{DateTime, Utc};
use serde::Serialize;

use recall_memory::MemoryTier;
use recall_reload::{CompiledContext, LoadedContext, PromptBundle, ReloadMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub mode: CommitMode,
    pub skip_if_empty: bool,
    pub validate: bool,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            mode: CommitMode::Full,
            skip_if_empty: false,
            validate: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitOutcome {
    pub success: bool,
    /// Empty when the commit was skipped (nothing to persist).
    pub commit_id: String,
    pub error: Option<String>,
    pub files_written: Vec<String>,
    pub duration_ms: u64,
    pub validation_warnings: Vec<String>,
}

impl CommitOutcome {
    pub fn skipped(duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReloadRequest {
    pub mode: ReloadMode,
    pub snapshot_id: Option<String>,
    pub tiers: Vec<MemoryTier>,
    pub from_timestamp: Option<DateTime<Utc>>,
    pub validate: bool,
    pub backup_current: bool,
}

impl Default for ReloadRequest {
    fn default() -> Self {
        Self {
            mode: ReloadMode::Full,
            snapshot_id: None,
            tiers: Vec::new(),
            from_timestamp: None,
            validate: true,
            backup_current: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// `no_data` when nothing was available to reload from.
    pub error_kind: Option<String>,
    pub snapshot_id: String,
    /// `ok` when the requested source was used, `recovered` when a fallback
    /// snapshot stood in.
    pub integrity_status: String,
    pub reloaded: usize,
    pub preserved: usize,
    pub discarded: usize,
    pub merged: usize,
}

/// Result of the loader → compiler → prompt-builder chain.
#[derive(Debug, Default)]
pub struct SessionReloadOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub loaded: Option<LoadedContext>,
    pub compiled: Option<CompiledContext>,
    pub prompt: Option<PromptBundle>,
    pub formatted_status: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidateOutcome {
    pub promoted: usize,
    pub summarized: bool,
    pub entities_indexed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyOutcome {
    pub success: bool,
    pub commit_id: String,
    pub snapshot_checksum_ok: bool,
    pub metadata_present: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub conversation_id: String,
    pub session_id: String,
    pub immediate_entries: usize,
    pub immediate_tokens: usize,
    pub session_entries: usize,
    pub session_messages: usize,
    pub summarized_entries: usize,
    pub archival_entries: usize,
    pub archival_entities: usize,
    pub last_commit_id: Option<String>,
    pub last_commit_at: Option<DateTime<Utc>>,
}
