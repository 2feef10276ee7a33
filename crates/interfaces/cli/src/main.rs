//! `recall`: operate the session memory engine from the shell.
//!
//! Exit codes: 0 success; 1 recoverable (reload succeeded from a fallback
//! source); 2 fatal integrity or commit failure; 3 no data available.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use recall_config::EngineConfig;
use recall_memory::MemoryTier;
use recall_reload::ReloadMode;
use recall_runtime::{CommitMode, CommitOptions, MemoryEngine, ReloadRequest};

const EXIT_OK: u8 = 0;
const EXIT_RECOVERED: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_NO_DATA: u8 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "recall",
    version,
    about = "Crash-safe session memory for long-running assistant conversations"
)]
struct Cli {
    /// Conversation whose memory directory to operate on.
    #[arg(long, global = true, default_value = "default")]
    conversation: String,

    /// Base storage directory (defaults to config / environment).
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Persist the current session as an atomic snapshot commit.
    Commit {
        #[arg(long, value_enum, default_value = "full")]
        mode: CliCommitMode,
        /// Succeed without writing anything when there is no session content.
        #[arg(long)]
        skip_empty: bool,
    },
    /// Restore memory state from a snapshot.
    Reload {
        #[arg(long, value_enum, default_value = "full")]
        mode: CliReloadMode,
        /// Reload from a specific commit instead of the latest snapshot.
        #[arg(long)]
        snapshot_id: Option<String>,
        /// Tiers to replace in selective mode (comma separated).
        #[arg(long, value_delimiter = ',')]
        tiers: Vec<String>,
        /// Rollback cutoff as an RFC 3339 timestamp.
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        no_validate: bool,
        #[arg(long)]
        no_backup: bool,
    },
    /// Build and print the LLM-ready resume prompt.
    Resume,
    /// Check a commit's snapshot checksum and metadata.
    VerifyIntegrity {
        #[arg(value_name = "COMMIT_ID")]
        commit_id: String,
    },
    /// List archived snapshots, newest first.
    ListSnapshots,
    /// Show tier occupancy and the latest commit.
    Stats,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliCommitMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliReloadMode {
    Full,
    Selective,
    Rollback,
    Merge,
}

impl From<CliCommitMode> for CommitMode {
    fn from(mode: CliCommitMode) -> Self {
        match mode {
            CliCommitMode::Full => Self::Full,
            CliCommitMode::Incremental => Self::Incremental,
        }
    }
}

impl From<CliReloadMode> for ReloadMode {
    fn from(mode: CliReloadMode) -> Self {
        match mode {
            CliReloadMode::Full => Self::Full,
            CliReloadMode::Selective => Self::Selective,
            CliReloadMode::Rollback => Self::Rollback,
            CliReloadMode::Merge => Self::Merge,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = load_config(&cli)?;
    if let Some(base) = &cli.base {
        config.storage.base_dir = base.to_string_lossy().into_owned();
    }

    let session_id = format!("session-{}", Uuid::new_v4());
    let mut engine = MemoryEngine::new(&cli.conversation, session_id, config);
    engine
        .initialize()
        .await
        .context("engine initialization failed")?;

    let code = match cli.command {
        Commands::Commit { mode, skip_empty } => {
            let outcome = engine
                .commit(CommitOptions {
                    mode: mode.into(),
                    skip_if_empty: skip_empty,
                    validate: true,
                })
                .await;
            if outcome.success {
                if outcome.commit_id.is_empty() {
                    println!("nothing to commit");
                } else {
                    println!(
                        "committed {} ({} files, {}ms)",
                        outcome.commit_id,
                        outcome.files_written.len(),
                        outcome.duration_ms
                    );
                }
                for warning in &outcome.validation_warnings {
                    println!("warning: {warning}");
                }
                EXIT_OK
            } else {
                eprintln!(
                    "commit failed: {}",
                    outcome.error.as_deref().unwrap_or("unknown")
                );
                EXIT_FATAL
            }
        }

        Commands::Reload {
            mode,
            snapshot_id,
            tiers,
            from,
            no_validate,
            no_backup,
        } => {
            let tiers = parse_tiers(&tiers)?;
            let from_timestamp = match from {
                Some(raw) => Some(parse_timestamp(&raw)?),
                None => None,
            };

            let outcome = engine
                .reload(ReloadRequest {
                    mode: mode.into(),
                    snapshot_id,
                    tiers,
                    from_timestamp,
                    validate: !no_validate,
                    backup_current: !no_backup,
                })
                .await;

            if outcome.success {
                println!(
                    "reloaded {} entries from {} ({} preserved, {} discarded)",
                    outcome.reloaded, outcome.snapshot_id, outcome.preserved, outcome.discarded
                );
                if outcome.integrity_status == "recovered" {
                    println!("note: restored from a fallback snapshot");
                    EXIT_RECOVERED
                } else {
                    EXIT_OK
                }
            } else if outcome.error_kind.as_deref() == Some("no_data") {
                eprintln!("no snapshot or context data to reload from");
                EXIT_NO_DATA
            } else {
                eprintln!(
                    "reload failed: {}",
                    outcome.error.as_deref().unwrap_or("unknown")
                );
                EXIT_FATAL
            }
        }

        Commands::Resume => {
            let outcome = engine.reload_session().await;
            println!("{}", outcome.formatted_status);
            if outcome.success {
                if let Some(prompt) = &outcome.prompt {
                    println!("\n{}", prompt.full_prompt);
                }
                let recovered = outcome
                    .loaded
                    .as_ref()
                    .is_some_and(|loaded| loaded.integrity_status == "recovered");
                if recovered { EXIT_RECOVERED } else { EXIT_OK }
            } else if outcome.error_kind.as_deref() == Some("no_data") {
                EXIT_NO_DATA
            } else {
                EXIT_FATAL
            }
        }

        Commands::VerifyIntegrity { commit_id } => {
            let outcome = engine.verify_commit(&commit_id).await;
            println!(
                "commit {}: snapshot checksum {}, metadata {}",
                outcome.commit_id,
                if outcome.snapshot_checksum_ok { "ok" } else { "MISMATCH" },
                if outcome.metadata_present { "present" } else { "MISSING" },
            );
            if let Some(error) = &outcome.error {
                eprintln!("error: {error}");
            }
            if outcome.success { EXIT_OK } else { EXIT_FATAL }
        }

        Commands::ListSnapshots => {
            let snapshots = engine.layout().list_snapshots().await?;
            if snapshots.is_empty() {
                println!("no snapshots");
                EXIT_NO_DATA
            } else {
                for path in snapshots {
                    let size = tokio::fs::metadata(&path)
                        .await
                        .map(|meta| meta.len())
                        .unwrap_or(0);
                    if let Some(name) = path.file_name() {
                        println!("{}  {size} bytes", name.to_string_lossy());
                    }
                }
                EXIT_OK
            }
        }

        Commands::Stats => {
            let stats = engine.stats().await;
            println!("conversation: {}", stats.conversation_id);
            println!(
                "immediate: {} entries, {} tokens",
                stats.immediate_entries, stats.immediate_tokens
            );
            println!(
                "session: {} entries, {} messages",
                stats.session_entries, stats.session_messages
            );
            println!("summarized: {} entries", stats.summarized_entries);
            println!(
                "archival: {} entries, {} entities",
                stats.archival_entries, stats.archival_entities
            );
            match stats.last_commit_id {
                Some(commit_id) => println!("last commit: {commit_id}"),
                None => println!("last commit: none"),
            }
            EXIT_OK
        }
    };

    engine.shutdown().await;
    Ok(code)
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    // The config file lives at the base root; --base overrides where we look.
    let mut probe = EngineConfig::default();
    if let Some(base) = &cli.base {
        probe.storage.base_dir = base.to_string_lossy().into_owned();
    }
    let path = probe.resolve_base_dir().join("recall.toml");
    EngineConfig::load_from(&path).with_context(|| format!("loading config {}", path.display()))
}

fn parse_tiers(raw: &[String]) -> Result<Vec<MemoryTier>> {
    raw.iter()
        .map(|name| {
            MemoryTier::parse(name).with_context(|| format!("unknown tier '{name}'"))
        })
        .collect()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .with_context(|| format!("invalid timestamp '{raw}' (expected RFC 3339)"))
}
