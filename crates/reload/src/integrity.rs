//! Pre-flight validation before a reload touches any live state.
//!
//! Checks run in a fixed order: resumable context file, snapshot inventory,
//! version compatibility, embedded checksum. The report tells the loader
//! which source to trust: a clean context file, the latest snapshot (by the
//! commit epoch embedded in its filename), or any valid snapshot as a last
//! resort.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use recall_commit::ResumableContext;
use recall_store::{ConversationLayout, FileStore, StoreError};

pub const SUPPORTED_VERSIONS: [&str; 3] = ["1.0.0", "1.1.0", "2.0.0"];
pub const CURRENT_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl IntegrityIssue {
    fn new(code: &str, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            recoverable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    UseFallback,
    SkipValidation,
    CreateNew,
    ManualFix,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOption {
    pub id: String,
    pub label: String,
    pub action: RecoveryAction,
    pub risk: String,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub valid: bool,
    pub can_proceed: bool,
    /// The context file parses, matches its checksum, and carries a
    /// compatible version.
    pub context_usable: bool,
    pub context_version: Option<String>,
    pub context_size: Option<u64>,
    pub context_modified: Option<DateTime<Utc>>,
    pub latest_snapshot: Option<PathBuf>,
    pub fallback_snapshot: Option<PathBuf>,
    pub warnings: Vec<IntegrityIssue>,
    pub errors: Vec<IntegrityIssue>,
    pub recovery_options: Vec<RecoveryOption>,
}

pub struct IntegrityChecker {
    store: FileStore,
    layout: ConversationLayout,
    max_snapshots_to_check: usize,
}

impl IntegrityChecker {
    pub fn new(store: FileStore, layout: ConversationLayout, max_snapshots_to_check: usize) -> Self {
        Self {
            store,
            layout,
            max_snapshots_to_check,
        }
    }

    pub async fn check(&self) -> Result<IntegrityReport, StoreError> {
        let mut report = IntegrityReport::default();

        self.check_context_file(&mut report).await?;
        self.check_snapshots(&mut report).await?;

        let has_snapshot =
            report.latest_snapshot.is_some() || report.fallback_snapshot.is_some();
        if !report.context_usable && !has_snapshot {
            report.errors.push(IntegrityIssue::new(
                "NO_CONTEXT_DATA",
                "neither a resumable context nor a valid snapshot exists",
                false,
            ));
        }

        report.valid = report.errors.is_empty() && report.warnings.is_empty();
        report.can_proceed = report.context_usable || has_snapshot;
        self.build_recovery_options(&mut report, has_snapshot);

        debug!(
            context_usable = report.context_usable,
            can_proceed = report.can_proceed,
            warnings = report.warnings.len(),
            errors = report.errors.len(),
            "integrity check complete"
        );
        Ok(report)
    }

    async fn check_context_file(&self, report: &mut IntegrityReport) -> Result<(), StoreError> {
        let path = self.layout.resumable_context_file();

        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                report.context_size = Some(meta.len());
                report.context_modified = meta.modified().ok().map(DateTime::from);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.warnings.push(IntegrityIssue::new(
                    "CONTEXT_MISSING",
                    "no resumable context file",
                    true,
                ));
                return Ok(());
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        let value = match self.store.read_value(&path).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(()),
            Err(error) if error.is_corruption() => {
                warn!(path = %path.display(), "resumable context is corrupted JSON");
                report.errors.push(IntegrityIssue::new(
                    "CONTEXT_CORRUPTED",
                    format!("resumable context is not valid JSON: {error}"),
                    true,
                ));
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        // Version compatibility.
        let version = value
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        report.context_version = Some(version.clone());

        let version_compatible = if version == CURRENT_VERSION {
            true
        } else if SUPPORTED_VERSIONS.contains(&version.as_str()) {
            report.warnings.push(IntegrityIssue::new(
                "VERSION_MIGRATION_NEEDED",
                format!(
                    "context version {version} needs migration: {}",
                    migration_path(&version).join(" -> ")
                ),
                true,
            ));
            true
        } else {
            report.errors.push(IntegrityIssue::new(
                "VERSION_INCOMPATIBLE",
                format!("context version '{version}' is not supported"),
                // Recoverable iff a snapshot can stand in; patched below
                // once snapshots are inventoried.
                true,
            ));
            false
        };

        // Embedded checksum.
        let embedded = value
            .get("checksum")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let checksum_ok = !embedded.is_empty()
            && ResumableContext::checksum_of_value(&value) == embedded;
        if !checksum_ok {
            report.warnings.push(IntegrityIssue::new(
                "CHECKSUM_MISMATCH",
                "resumable context checksum does not match its content",
                true,
            ));
        }

        report.context_usable = version_compatible && checksum_ok;
        Ok(())
    }

    async fn check_snapshots(&self, report: &mut IntegrityReport) -> Result<(), StoreError> {
        let snapshots = self.layout.list_snapshots().await?;
        let mut valid: Vec<(PathBuf, Option<DateTime<Utc>>)> = Vec::new();

        for path in snapshots.iter().take(self.max_snapshots_to_check) {
            match self.store.read_value(path).await {
                Ok(Some(value)) => {
                    if value.get("checksum").and_then(|v| v.as_str()).is_none() {
                        report.warnings.push(IntegrityIssue::new(
                            "SNAPSHOT_SUSPECT",
                            format!("snapshot {} has no checksum", display_name(path)),
                            true,
                        ));
                        continue;
                    }
                    let modified = tokio::fs::metadata(path)
                        .await
                        .ok()
                        .and_then(|meta| meta.modified().ok())
                        .map(DateTime::from);
                    valid.push((path.clone(), modified));
                }
                Ok(None) => {}
                Err(error) if error.is_corruption() => {
                    report.warnings.push(IntegrityIssue::new(
                        "SNAPSHOT_CORRUPTED",
                        format!("snapshot {} is not valid JSON", display_name(path)),
                        true,
                    ));
                }
                Err(error) => return Err(error),
            }
        }

        // Latest = highest commit epoch embedded in the filename.
        report.latest_snapshot = valid
            .iter()
            .filter_map(|(path, _)| snapshot_epoch(path).map(|epoch| (epoch, path.clone())))
            .max_by_key(|(epoch, _)| *epoch)
            .map(|(_, path)| path);

        // Fallback = any valid snapshot, newest mtime first.
        report.fallback_snapshot = valid
            .iter()
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path.clone());

        // An incompatible context version is only recoverable with a
        // snapshot to fall back to.
        let has_snapshot = report.latest_snapshot.is_some();
        for error in &mut report.errors {
            if error.code == "VERSION_INCOMPATIBLE" {
                error.recoverable = has_snapshot;
            }
        }
        Ok(())
    }

    fn build_recovery_options(&self, report: &mut IntegrityReport, has_snapshot: bool) {
        if report.context_usable && report.warnings.is_empty() {
            return;
        }

        if has_snapshot {
            report.recovery_options.push(RecoveryOption {
                id: "use-fallback".into(),
                label: "Reload from the most recent valid snapshot".into(),
                action: RecoveryAction::UseFallback,
                risk: "low".into(),
            });
        }
        if report
            .warnings
            .iter()
            .any(|issue| issue.code == "CHECKSUM_MISMATCH")
        {
            report.recovery_options.push(RecoveryOption {
                id: "skip-validation".into(),
                label: "Trust the context file despite its checksum".into(),
                action: RecoveryAction::SkipValidation,
                risk: "medium".into(),
            });
        }
        if report
            .errors
            .iter()
            .any(|issue| issue.code == "CONTEXT_CORRUPTED")
        {
            report.recovery_options.push(RecoveryOption {
                id: "manual-fix".into(),
                label: "Repair context/resumable.json by hand".into(),
                action: RecoveryAction::ManualFix,
                risk: "low".into(),
            });
        }
        report.recovery_options.push(RecoveryOption {
            id: "create-new".into(),
            label: "Start a fresh session without restored context".into(),
            action: RecoveryAction::CreateNew,
            risk: "high: discards persisted context".into(),
        });
    }
}

/// The linear migration chain from `from` to the current version.
pub fn migration_path(from: &str) -> Vec<String> {
    let start = SUPPORTED_VERSIONS
        .iter()
        .position(|v| *v == from)
        .unwrap_or(0);
    SUPPORTED_VERSIONS[start..]
        .iter()
        .map(|v| v.to_string())
        .collect()
}

/// `snapshot-commit-<epoch>-<rand>.json` → epoch.
fn snapshot_epoch(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let rest = name
        .strip_prefix("snapshot-commit-")?
        .strip_suffix(".json")?;
    rest.split('-').next()?.parse().ok()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
