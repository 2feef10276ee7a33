//! Engine configuration: a TOML file with full defaults.
//!
//! Every section is `#[serde(default)]` so a partial (or absent) config file
//! always yields a usable [`EngineConfig`]. The base directory resolves, in
//! order: explicit config value, `RECALL_BASE_DIR`, then
//! `$HOME/.gemini/antigravity/brain` (or `/memory` when no home directory is
//! available, e.g. inside a sandbox).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per conversation.
    /// Empty string means "resolve from environment".
    pub base_dir: String,
    /// Pretty-print persisted JSON (2-space indent). Compact otherwise.
    pub pretty_json: bool,
    /// Copy an existing file to `<name>.backup.<epoch_ms>` before overwrite.
    pub backup_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: String::new(),
            pretty_json: false,
            backup_on_write: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub immediate_max_tokens: usize,
    pub immediate_max_entries: usize,
    pub session_max_entries: usize,
    pub summarized_max_entries: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            immediate_max_tokens: 4000,
            immediate_max_entries: 20,
            session_max_entries: 500,
            summarized_max_entries: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Below this many messages only a minimal one-line summary is produced.
    pub min_messages_for_summary: usize,
    /// Greedy chunking cap, in estimated tokens (~4 chars per token).
    pub chunk_size_tokens: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            min_messages_for_summary: 10,
            chunk_size_tokens: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub events_per_segment: usize,
    /// Buffered events are flushed once the buffer reaches this size.
    pub flush_threshold: usize,
    pub flush_interval_ms: u64,
    pub retention_days: i64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            events_per_segment: 1000,
            flush_threshold: 100,
            flush_interval_ms: 5000,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Write-ahead-log protection for the multi-file commit sequence.
    pub wal_enabled: bool,
    /// Strict validation fails the commit on any error; lenient mode only
    /// on errors tagged CRITICAL.
    pub strict_validation: bool,
    /// Auto-save after this many `add_message` calls. 0 disables.
    pub auto_save_interval: usize,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            wal_enabled: true,
            strict_validation: true,
            auto_save_interval: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub max_snapshots_to_check: usize,
    pub max_token_budget: usize,
    pub hot_token_budget: usize,
    pub warm_token_budget: usize,
    pub cold_token_budget: usize,
    /// One of `light`, `moderate`, `aggressive`.
    pub compression_level: String,
    pub compression_enabled: bool,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            max_snapshots_to_check: 10,
            max_token_budget: 4000,
            hot_token_budget: 500,
            warm_token_budget: 2000,
            cold_token_budget: 200,
            compression_level: "moderate".to_string(),
            compression_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub threshold: f64,
    pub max_items: usize,
    pub recency_weight: f64,
    pub frequency_weight: f64,
    pub importance_weight: f64,
    pub relevance_weight: f64,
    pub connections_weight: f64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.4,
            max_items: 20,
            recency_weight: 0.25,
            frequency_weight: 0.15,
            importance_weight: 0.30,
            relevance_weight: 0.20,
            connections_weight: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub tiers: TierConfig,
    pub summarizer: SummarizerConfig,
    pub events: EventLogConfig,
    pub commit: CommitConfig,
    pub reload: ReloadConfig,
    pub relevance: RelevanceConfig,
}

impl EngineConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolve the effective base directory for conversation storage.
    pub fn resolve_base_dir(&self) -> PathBuf {
        if !self.storage.base_dir.is_empty() {
            return PathBuf::from(&self.storage.base_dir);
        }
        if let Ok(value) = env::var("RECALL_BASE_DIR")
            && !value.is_empty()
        {
            return PathBuf::from(value);
        }
        match env::var("HOME") {
            Ok(home) if !home.is_empty() => PathBuf::from(home)
                .join(".gemini")
                .join("antigravity")
                .join("brain"),
            _ => PathBuf::from("/memory"),
        }
    }
}
