//! The memory engine: owner of the four tiers and every pipeline
//! collaborator.
//!
//! The engine is single-writer: all mutation goes through `&mut self`
//! methods, and the only background task is the event-log flush timer,
//! cancelled at shutdown through a watch channel. Top-level operations
//! (`commit`, `reload`, `reload_session`, `verify_commit`) return outcome
//! values and never propagate errors to the caller; auto-save failures are
//! logged and swallowed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use recall_commit::{
    CommitError, CommitPersister, CommitValidator, DataCollector, ResumableContextGenerator,
    SessionSnapshot, new_commit_id,
};
use recall_config::EngineConfig;
use recall_events::{EventEmitter, EventLog};
use recall_memory::{
    ArchivalMemory, ConversationMessage, FileChangeOp, HeuristicSummarizer, ImmediateMemory,
    LearnedFact, MemoryEntry, MemoryTier, MessageRole, RelevanceScorer, RetrieveOptions,
    SessionMemory, Summarize, SummarizedMemory, TierRetrieve, ToolCallRecord,
    tiers::archival::SnapshotRecord,
};
use recall_reload::{
    ContextCompiler, ContextLoader, IntegrityChecker, PromptBuilder, ReloadError, ReloadMode,
    ReloadOptions, ReloadPlan, StateHistory, apply_strategy,
};
use recall_store::{ConversationLayout, FileStore, file_store::FileStoreOptions};

use crate::options::{
    CommitMode, CommitOptions, CommitOutcome, ConsolidateOutcome, EngineStats, ReloadOutcome,
    ReloadRequest, SessionReloadOutcome, VerifyOutcome,
};

pub struct MemoryEngine {
    config: EngineConfig,
    store: FileStore,
    layout: ConversationLayout,
    session_id: String,

    immediate: ImmediateMemory,
    session: SessionMemory,
    summarized: SummarizedMemory,
    archival: ArchivalMemory,

    collector: DataCollector,
    summarizer: Box<dyn Summarize>,
    scorer: RelevanceScorer,
    validator: CommitValidator,
    persister: CommitPersister,
    emitter: EventEmitter,
    event_log: Option<Arc<Mutex<EventLog>>>,
    history: StateHistory,

    message_counter: usize,
    last_save_counter: usize,
    flush_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MemoryEngine {
    pub fn new(
        conversation_id: impl Into<String>,
        session_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        let store = FileStore::new(FileStoreOptions {
            pretty: config.storage.pretty_json,
            backup_on_write: config.storage.backup_on_write,
        });
        let conversation_id = conversation_id.into();
        let session_id = session_id.into();
        let layout = ConversationLayout::new(config.resolve_base_dir(), &conversation_id);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            immediate: ImmediateMemory::new(
                config.tiers.immediate_max_tokens,
                config.tiers.immediate_max_entries,
            ),
            session: SessionMemory::new(
                &conversation_id,
                &session_id,
                config.tiers.session_max_entries,
            ),
            summarized: SummarizedMemory::new(config.tiers.summarized_max_entries),
            archival: ArchivalMemory::new(),
            collector: DataCollector::new(),
            summarizer: Box::new(HeuristicSummarizer::new(&config.summarizer)),
            scorer: RelevanceScorer::new(config.relevance.clone()),
            validator: CommitValidator::new(),
            persister: CommitPersister::new(store.clone(), layout.clone(), config.commit.wal_enabled),
            emitter: EventEmitter::new(),
            event_log: None,
            history: StateHistory::default(),
            message_counter: 0,
            last_save_counter: 0,
            flush_task: None,
            shutdown_tx,
            session_id,
            store,
            layout,
            config,
        }
    }

    /// Swap in an external summarizer (e.g. LLM-backed).
    pub fn set_summarizer(&mut self, summarizer: Box<dyn Summarize>) {
        self.summarizer = summarizer;
    }

    pub fn emitter_mut(&mut self) -> &mut EventEmitter {
        &mut self.emitter
    }

    pub fn layout(&self) -> &ConversationLayout {
        &self.layout
    }

    pub fn scorer(&self) -> &RelevanceScorer {
        &self.scorer
    }

    /// Prepare the engine: build the directory layout, recover any commits
    /// interrupted mid-write, open the event log, and start the flush timer.
    /// WAL recovery always runs before any new commit is possible.
    pub async fn initialize(&mut self) -> Result<(), CommitError> {
        self.layout.ensure().await?;
        let recovered = self.persister.recover_from_wal().await?;
        if recovered > 0 {
            warn!(commits = recovered, "rolled back incomplete commits at startup");
        }

        let log = EventLog::open(
            self.store.clone(),
            self.layout.clone(),
            self.session_id.clone(),
            self.config.events.clone(),
        )
        .await
        .map_err(|e| match e {
            recall_events::EventLogError::Store(inner) => CommitError::Store(inner),
            other => CommitError::Validation(other.to_string()),
        })?;
        let log = Arc::new(Mutex::new(log));
        if let Err(error) = log.lock().await.apply_retention().await {
            warn!(%error, "event retention failed at startup");
        }
        self.event_log = Some(log.clone());
        self.spawn_flush_timer(log);

        info!(
            conversation = self.layout.conversation_id(),
            session = %self.session_id,
            "memory engine initialized"
        );
        Ok(())
    }

    fn spawn_flush_timer(&mut self, log: Arc<Mutex<EventLog>>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.events.flush_interval_ms.max(1));
        self.flush_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = log.lock().await.flush().await {
                            warn!(%error, "timed event log flush failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    /// Flush buffers and stop the background flush timer.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.flush_task.take() {
            let _ = task.await;
        }
        if let Some(log) = &self.event_log
            && let Err(error) = log.lock().await.shutdown().await
        {
            warn!(%error, "event log flush at shutdown failed");
        }
    }

    async fn emit(&self, kind: &str, payload: serde_json::Value) {
        if let Some(log) = &self.event_log {
            match log.lock().await.append(kind, payload).await {
                Ok(event) => self.emitter.emit(&event).await,
                Err(error) => warn!(kind, %error, "event append failed"),
            }
        }
    }

    // ── ingestion ────────────────────────────────────────────────────────

    /// Record a message: assigns the next turn number, mirrors it into the
    /// session and immediate tiers, and auto-saves every N messages.
    pub async fn add_message(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
    ) -> ConversationMessage {
        let message = self.session.add_message(role, content);
        if let Some(entry) = self.session.get(&message.id).cloned() {
            self.immediate.add(entry.copy_to_tier(MemoryTier::Immediate));
        }
        self.message_counter += 1;

        self.emit(
            "message.added",
            serde_json::json!({
                "id": message.id.clone(),
                "turn_number": message.turn_number,
            }),
        )
        .await;

        let interval = self.config.commit.auto_save_interval;
        if interval > 0 && self.message_counter - self.last_save_counter >= interval {
            self.last_save_counter = self.message_counter;
            self.auto_save();
        }
        message
    }

    /// Fire-and-forget persistence of the live transcript. Failures log and
    /// never reach the caller.
    fn auto_save(&self) {
        let store = self.store.clone();
        let layout = self.layout.clone();
        let messages = self.session.messages().to_vec();
        let tool_calls = self.session.tool_calls().to_vec();

        tokio::spawn(async move {
            if let Err(error) = store.write_json(layout.messages_file(), &messages).await {
                warn!(%error, "auto-save of messages failed");
            }
            if !tool_calls.is_empty()
                && let Err(error) = store.write_json(layout.tool_calls_file(), &tool_calls).await
            {
                warn!(%error, "auto-save of tool calls failed");
            }
            debug!(messages = messages.len(), "auto-save complete");
        });
    }

    pub async fn add_tool_call(&mut self, call: ToolCallRecord) {
        let call_id = call.id.clone();
        self.session.add_tool_call(call);
        if let Some(entry) = self.session.get(&call_id).cloned() {
            self.immediate.add(entry.copy_to_tier(MemoryTier::Immediate));
        }
        self.emit("entry.tool_call", serde_json::json!({ "id": call_id }))
            .await;
    }

    pub fn record_tool_output(
        &mut self,
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        success: bool,
    ) {
        self.collector
            .record_tool_output(call_id, name, output, success);
    }

    pub fn record_file_change(
        &mut self,
        path: impl Into<String>,
        op: FileChangeOp,
        turn_number: u32,
    ) {
        self.collector
            .record_file_change(path, op, turn_number, Default::default());
    }

    // ── retrieval ────────────────────────────────────────────────────────

    pub fn retrieve(
        &self,
        tiers: Option<&[MemoryTier]>,
        options: &RetrieveOptions,
    ) -> Vec<MemoryEntry> {
        let wants = |tier: MemoryTier| tiers.is_none_or(|list| list.contains(&tier));
        let mut entries = Vec::new();
        if wants(MemoryTier::Immediate) {
            entries.extend(self.immediate.retrieve(options));
        }
        if wants(MemoryTier::Session) {
            entries.extend(self.session.retrieve(options));
        }
        if wants(MemoryTier::Summarized) {
            entries.extend(self.summarized.retrieve(options));
        }
        if wants(MemoryTier::Archival) {
            entries.extend(self.archival.retrieve(options));
        }

        entries.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.id.clone()));
        if let Some(limit) = options.limit {
            entries.truncate(limit);
        }
        entries
    }

    /// Lexical search across the session and archival tiers.
    pub fn search(&self, query: &str, limit: usize) -> Vec<MemoryEntry> {
        let mut scored: Vec<(MemoryEntry, f64)> = self.session.search(query, limit);
        scored.extend(
            self.archival
                .search(query, limit)
                .into_iter()
                .map(|(entry, count)| (entry, count as f64)),
        );

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa).then_with(|| b.created_at.cmp(&a.created_at))
        });
        let mut seen = HashSet::new();
        scored.retain(|(entry, _)| seen.insert(entry.id.clone()));
        scored.truncate(limit);
        scored.into_iter().map(|(entry, _)| entry).collect()
    }

    /// Rank the archived entity graph and summarized knowledge against the
    /// current task context.
    pub fn score_knowledge(
        &self,
        context: &recall_memory::RelevanceContext,
    ) -> recall_memory::relevance::RankedKnowledge {
        let entities: Vec<_> = self.archival.entities().cloned().collect();
        let decisions: Vec<_> = self.summarized.decisions().cloned().collect();
        let facts: Vec<_> = self.summarized.facts().cloned().collect();
        self.scorer
            .score_all(&entities, &decisions, &facts, context)
    }

    // ── consolidation ────────────────────────────────────────────────────

    /// Promote immediate-tier overflow into the session tier and compress
    /// the session into summaries, decisions, facts, and entities.
    pub async fn consolidate(&mut self) -> ConsolidateOutcome {
        let mut outcome = ConsolidateOutcome::default();

        for candidate in self.immediate.promotion_candidates() {
            self.immediate.remove(&candidate.id);
            self.session
                .insert_entry(candidate.copy_to_tier(MemoryTier::Session));
            outcome.promoted += 1;
        }

        let messages = self.session.messages().to_vec();
        if messages.len() >= self.config.summarizer.min_messages_for_summary {
            let summary = self
                .summarizer
                .summarize(self.layout.conversation_id(), &messages);
            self.summarized.add_summary(summary);
            outcome.summarized = true;

            for decision in recall_memory::extract_decisions(&messages) {
                self.summarized.add_decision(decision);
            }
            let extraction = recall_memory::KnowledgeExtractor::new().extract(&messages);
            for fact in extraction.facts {
                self.summarized.add_fact(fact);
            }
            for entity in extraction.entities {
                self.archival.upsert_entity(entity);
                outcome.entities_indexed += 1;
            }
        }

        self.emit(
            "tier.consolidated",
            serde_json::json!({
                "promoted": outcome.promoted,
                "summarized": outcome.summarized,
            }),
        )
        .await;
        outcome
    }

    // ── commit ───────────────────────────────────────────────────────────

    pub async fn commit(&mut self, options: CommitOptions) -> CommitOutcome {
        let started = Instant::now();
        match self.commit_inner(&options, started).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.emit(
                    "commit.rollback",
                    serde_json::json!({ "error": error.to_string() }),
                )
                .await;
                CommitOutcome {
                    success: false,
                    error: Some(error.to_string()),
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                }
            }
        }
    }

    async fn commit_inner(
        &mut self,
        options: &CommitOptions,
        started: Instant,
    ) -> Result<CommitOutcome, CommitError> {
        let data = self
            .collector
            .collect(
                &self.session,
                &self.summarized,
                &self.archival,
                self.summarizer.as_ref(),
                &self.store,
                &self.layout,
            )
            .await?;

        if options.skip_if_empty && data.is_empty() {
            debug!("commit skipped: no session content");
            return Ok(CommitOutcome::skipped(started.elapsed().as_millis() as u64));
        }

        let previous = self.persister.load_latest().await?;
        if options.mode == CommitMode::Incremental
            && let Some(previous) = &previous
            && let Some(metadata) = self.persister.load_metadata(&previous.commit_id).await?
            && metadata.statistics.message_count == data.statistics.message_count
            && metadata.statistics.tool_call_count == data.statistics.tool_call_count
            && options.skip_if_empty
        {
            debug!(previous = %previous.commit_id, "incremental commit skipped: no new content");
            return Ok(CommitOutcome::skipped(started.elapsed().as_millis() as u64));
        }

        let mut validation_warnings = Vec::new();
        if options.validate {
            let report = self.validator.validate(&data);
            validation_warnings = report.warnings.clone();
            if !report.passes(self.config.commit.strict_validation) {
                let details = report
                    .errors
                    .iter()
                    .map(|issue| issue.message.clone())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(CommitError::Validation(details));
            }
        }

        let commit_id = new_commit_id();
        self.emit(
            "commit.prepare",
            serde_json::json!({ "commit_id": commit_id.clone() }),
        )
        .await;

        let checksums = self.validator.calculate_all_checksums(&data)?;
        let snapshot = SessionSnapshot::from_data(&commit_id, &data);
        let context = ResumableContextGenerator::new().generate(&commit_id, &data);

        let mut paths = std::collections::BTreeMap::new();
        paths.insert(
            "snapshot".to_string(),
            format!("archives/snapshot-{commit_id}.json"),
        );
        paths.insert("messages".to_string(), "session/messages.json".to_string());
        paths.insert(
            "entities".to_string(),
            "knowledge/entities.json".to_string(),
        );
        paths.insert(
            "decisions".to_string(),
            "summaries/decisions.json".to_string(),
        );
        paths.insert("facts".to_string(), "knowledge/facts.json".to_string());
        paths.insert(
            "context".to_string(),
            "context/resumable.json".to_string(),
        );

        let metadata = recall_commit::CommitMetadata {
            commit_id: commit_id.clone(),
            conversation_id: data.conversation_id.clone(),
            session_id: data.session_id.clone(),
            timestamp: Utc::now(),
            version: recall_commit::SNAPSHOT_VERSION.to_string(),
            previous_commit_id: previous.map(|pointer| pointer.commit_id),
            checksums,
            statistics: data.statistics.clone(),
            paths,
        };

        let outcome = self
            .persister
            .persist(&data, &snapshot, &metadata, Some(&context))
            .await?;

        // Snapshot taken: session and summarized entries gain archival
        // copies, and the entity graph absorbs this commit's extraction.
        for entry in self.session.entries().into_iter().cloned().collect::<Vec<_>>() {
            self.archival.add_entry(entry.copy_to_tier(MemoryTier::Archival));
        }
        for entry in self
            .summarized
            .entries()
            .into_iter()
            .cloned()
            .collect::<Vec<_>>()
        {
            self.archival.add_entry(entry.copy_to_tier(MemoryTier::Archival));
        }
        for entity in &data.entities {
            self.archival.upsert_entity(entity.clone());
        }
        self.archival.record_snapshot(SnapshotRecord {
            id: commit_id.clone(),
            timestamp: snapshot.timestamp,
            message_count: data.statistics.message_count,
        });

        self.last_save_counter = self.message_counter;
        self.emit(
            "commit.complete",
            serde_json::json!({
                "commit_id": commit_id.clone(),
                "files": outcome.files_written.len(),
            }),
        )
        .await;

        Ok(CommitOutcome {
            success: true,
            commit_id,
            error: None,
            files_written: outcome.files_written,
            duration_ms: started.elapsed().as_millis() as u64,
            validation_warnings,
        })
    }

    pub async fn get_last_commit(&self) -> Option<recall_commit::CommitMetadata> {
        let pointer = self.persister.load_latest().await.ok().flatten()?;
        self.persister
            .load_metadata(&pointer.commit_id)
            .await
            .ok()
            .flatten()
    }

    pub async fn verify_commit(&self, commit_id: &str) -> VerifyOutcome {
        let mut outcome = VerifyOutcome {
            commit_id: commit_id.to_string(),
            ..Default::default()
        };

        match self.persister.load_snapshot(commit_id).await {
            Ok(Some(snapshot)) => outcome.snapshot_checksum_ok = snapshot.verify(),
            Ok(None) => outcome.error = Some("snapshot not found".to_string()),
            Err(error) => outcome.error = Some(error.to_string()),
        }
        match self.persister.load_metadata(commit_id).await {
            Ok(metadata) => outcome.metadata_present = metadata.is_some(),
            Err(error) => outcome.error = Some(error.to_string()),
        }

        outcome.success = outcome.snapshot_checksum_ok && outcome.metadata_present;
        outcome
    }

    // ── reload (strategy path) ───────────────────────────────────────────

    pub async fn reload(&mut self, request: ReloadRequest) -> ReloadOutcome {
        self.emit(
            "reload.started",
            serde_json::json!({ "mode": format!("{:?}", request.mode) }),
        )
        .await;

        match self.reload_inner(&request).await {
            Ok(outcome) => {
                self.emit(
                    "reload.completed",
                    serde_json::json!({
                        "snapshot_id": outcome.snapshot_id.clone(),
                        "reloaded": outcome.reloaded,
                    }),
                )
                .await;
                outcome
            }
            Err((error, kind)) => {
                self.emit("reload.failed", serde_json::json!({ "error": error }))
                    .await;
                ReloadOutcome {
                    success: false,
                    error: Some(error),
                    error_kind: kind,
                    ..Default::default()
                }
            }
        }
    }

    async fn reload_inner(
        &mut self,
        request: &ReloadRequest,
    ) -> Result<ReloadOutcome, (String, Option<String>)> {
        let (snapshot, integrity_status) = self.find_snapshot(request).await?;

        if request.validate && !snapshot.verify() {
            return Err((
                format!("snapshot {} failed checksum verification", snapshot.id),
                Some("integrity".to_string()),
            ));
        }

        let current = self.current_entries();
        if request.backup_current {
            self.history.push(current.clone());
        }

        let options = ReloadOptions {
            tiers: request.tiers.clone(),
            from_timestamp: request.from_timestamp,
            preserve_local: true,
        };
        let plan = apply_strategy(request.mode, &snapshot, &current, &options);
        let outcome = ReloadOutcome {
            success: true,
            error: None,
            error_kind: None,
            snapshot_id: snapshot.id.clone(),
            integrity_status,
            reloaded: plan.reloaded.len(),
            preserved: plan.preserved.len(),
            discarded: plan.discarded.len(),
            merged: plan.merged.len(),
        };
        self.install_plan(&snapshot, &plan, request.mode, &request.tiers);

        info!(
            snapshot = %snapshot.id,
            mode = ?request.mode,
            reloaded = outcome.reloaded,
            "reload applied"
        );
        Ok(outcome)
    }

    async fn find_snapshot(
        &self,
        request: &ReloadRequest,
    ) -> Result<(SessionSnapshot, String), (String, Option<String>)> {
        if let Some(id) = &request.snapshot_id {
            let snapshot = self
                .persister
                .load_snapshot(id)
                .await
                .map_err(|e| (e.to_string(), None))?
                .ok_or_else(|| {
                    (
                        format!("snapshot '{id}' not found"),
                        Some("no_data".to_string()),
                    )
                })?;
            return Ok((snapshot, "ok".to_string()));
        }

        let checker = IntegrityChecker::new(
            self.store.clone(),
            self.layout.clone(),
            self.config.reload.max_snapshots_to_check,
        );
        let report = checker.check().await.map_err(|e| (e.to_string(), None))?;
        let path = report
            .latest_snapshot
            .or(report.fallback_snapshot)
            .ok_or_else(|| {
                (
                    "no snapshot available to reload from".to_string(),
                    Some("no_data".to_string()),
                )
            })?;
        let snapshot: SessionSnapshot = self
            .store
            .read_json(&path)
            .await
            .map_err(|e| (e.to_string(), None))?
            .ok_or_else(|| {
                (
                    format!("snapshot at {} disappeared", path.display()),
                    Some("no_data".to_string()),
                )
            })?;

        let status = if report.context_usable && report.valid {
            "ok".to_string()
        } else {
            "recovered".to_string()
        };
        Ok((snapshot, status))
    }

    fn current_entries(&self) -> HashMap<String, MemoryEntry> {
        let mut current = HashMap::new();
        for entry in self
            .immediate
            .entries()
            .into_iter()
            .chain(self.session.entries())
            .chain(self.summarized.entries())
            .chain(self.archival.entries())
        {
            current.insert(entry.id.clone(), entry.clone());
        }
        current
    }

    fn install_plan(
        &mut self,
        snapshot: &SessionSnapshot,
        plan: &ReloadPlan,
        mode: ReloadMode,
        tiers: &[MemoryTier],
    ) {
        let touches = |tier: MemoryTier| match mode {
            ReloadMode::Selective => tiers.contains(&tier),
            _ => true,
        };
        let final_entries = plan.final_entries();
        let final_ids: HashSet<&str> = final_entries.iter().map(|e| e.id.as_str()).collect();

        if touches(MemoryTier::Session) {
            if mode != ReloadMode::Merge {
                self.session.clear();
            }
            let existing: HashSet<String> = self
                .session
                .messages()
                .iter()
                .map(|m| m.id.clone())
                .collect();
            for message in &snapshot.messages {
                if final_ids.contains(message.id.as_str()) && !existing.contains(&message.id) {
                    self.session.restore_message(message.clone());
                }
            }
            let existing_calls: HashSet<String> = self
                .session
                .tool_calls()
                .iter()
                .map(|c| c.id.clone())
                .collect();
            for call in &snapshot.tool_calls {
                if !existing_calls.contains(&call.id) {
                    self.session.restore_tool_call(call.clone());
                }
            }
        }

        if touches(MemoryTier::Summarized) {
            if mode != ReloadMode::Merge {
                self.summarized.clear();
            }
            if let Some(summary) = &snapshot.summary {
                self.summarized.add_summary(summary.clone());
            }
            for decision in &snapshot.key_decisions {
                if final_ids.contains(decision.id.as_str()) {
                    self.summarized.add_decision(decision.clone());
                }
            }
            for fact in &snapshot.learned_facts {
                if final_ids.contains(fact.id.as_str()) {
                    self.summarized.add_fact(fact.clone());
                }
            }
        }

        if touches(MemoryTier::Archival) {
            if matches!(mode, ReloadMode::Full | ReloadMode::Rollback) {
                self.archival.clear();
            }
            for entity in &snapshot.entities {
                if final_ids.contains(entity.id.as_str()) {
                    self.archival.upsert_entity(entity.clone());
                }
            }
        }

        if touches(MemoryTier::Immediate) && mode != ReloadMode::Merge {
            self.immediate.clear();
        }

        for entry in final_entries {
            match entry.tier {
                MemoryTier::Session if touches(MemoryTier::Session) => {
                    self.session.insert_entry(entry);
                }
                MemoryTier::Summarized if touches(MemoryTier::Summarized) => {
                    self.summarized.restore_entry(entry);
                }
                MemoryTier::Archival if touches(MemoryTier::Archival) => {
                    self.archival.add_entry(entry);
                }
                MemoryTier::Immediate if touches(MemoryTier::Immediate) => {
                    self.immediate.add(entry);
                }
                _ => {}
            }
        }
    }

    /// Undo the most recent reload by restoring the saved entry map.
    pub async fn rollback_last_reload(&mut self) -> bool {
        let Some(previous) = self.history.pop() else {
            return false;
        };

        self.immediate.clear();
        self.session.clear();
        self.summarized.clear();
        self.archival.clear();
        for entry in previous.into_values() {
            match entry.tier {
                MemoryTier::Immediate => {
                    self.immediate.add(entry);
                }
                MemoryTier::Session => self.session.insert_entry(entry),
                MemoryTier::Summarized => self.summarized.restore_entry(entry),
                MemoryTier::Archival => self.archival.add_entry(entry),
            }
        }

        self.emit("reload.rollback", serde_json::json!({})).await;
        true
    }

    // ── reload (prompt path) ─────────────────────────────────────────────

    /// Loader → compiler → prompt builder, producing an LLM-ready resume
    /// prompt from the best available source.
    pub async fn reload_session(&mut self) -> SessionReloadOutcome {
        let loader = ContextLoader::new(
            self.store.clone(),
            self.layout.clone(),
            self.config.reload.max_snapshots_to_check,
        );

        match loader.load().await {
            Ok((loaded, _report)) => {
                let compiled = ContextCompiler::new(self.config.reload.clone()).compile(&loaded);
                let bundle = PromptBuilder::new().build(&loaded, &compiled);
                let formatted_status = format!(
                    "Resumed from {} (integrity: {}), {} tokens, quality {:.2} ({})",
                    bundle.metadata.source,
                    loaded.integrity_status,
                    bundle.metadata.token_total,
                    compiled.quality.score,
                    compiled.quality.loss,
                );

                self.emit(
                    "reload.completed",
                    serde_json::json!({
                        "source": bundle.metadata.source.clone(),
                        "tokens": bundle.metadata.token_total,
                    }),
                )
                .await;

                SessionReloadOutcome {
                    success: true,
                    error: None,
                    error_kind: None,
                    loaded: Some(loaded),
                    compiled: Some(compiled),
                    prompt: Some(bundle),
                    formatted_status,
                }
            }
            Err(error) => {
                let kind = match &error {
                    ReloadError::NoContextData => Some("no_data".to_string()),
                    _ => Some("integrity".to_string()),
                };
                self.emit(
                    "reload.failed",
                    serde_json::json!({ "error": error.to_string() }),
                )
                .await;
                SessionReloadOutcome {
                    success: false,
                    formatted_status: format!("Reload failed: {error}"),
                    error: Some(error.to_string()),
                    error_kind: kind,
                    ..Default::default()
                }
            }
        }
    }

    // ── stats ────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> EngineStats {
        let last = self.get_last_commit().await;
        EngineStats {
            conversation_id: self.layout.conversation_id().to_string(),
            session_id: self.session_id.clone(),
            immediate_entries: self.immediate.len(),
            immediate_tokens: self.immediate.tokens_used(),
            session_entries: self.session.len(),
            session_messages: self.session.messages().len(),
            summarized_entries: self.summarized.len(),
            archival_entries: self.archival.len(),
            archival_entities: self.archival.entities().count(),
            last_commit_id: last.as_ref().map(|m| m.commit_id.clone()),
            last_commit_at: last.map(|m| m.timestamp),
        }
    }
}
