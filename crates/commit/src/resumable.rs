//! Three-tier resume context generation.
//!
//! Hot carries what the next turn needs verbatim, warm carries session
//! knowledge worth re-reading, cold carries pointers back into the archive.
//! The Markdown renderings are produced here at commit time so a resuming
//! process can inject them without any further processing.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use recall_memory::{MessageRole, token_estimate};
use recall_store::checksum_value;

use crate::collector::SessionData;
use crate::snapshot::SNAPSHOT_VERSION;

const MAX_MESSAGE_CHARS: usize = 500;
const RECENT_MESSAGES: usize = 5;
const RECENT_MESSAGE_CHARS: usize = 200;
const MAX_ACTIVE_FILES: usize = 10;
const MAX_DECISIONS: usize = 10;
const MAX_ENTITIES: usize = 15;
const MAX_FACTS: usize = 10;
const MAX_TOPICS: usize = 10;
const MAX_ERRORS: usize = 5;
const MAX_FILES_MODIFIED: usize = 20;
const COLD_TOKEN_ESTIMATE: usize = 50;

static ACTIVE_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[\w.-]+)+\.\w+").expect("active file pattern"));

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HotContext {
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
    pub current_task: Option<String>,
    pub task_status: Option<String>,
    pub recent_messages: Vec<RecentMessage>,
    pub active_files: Vec<String>,
    pub last_turn_number: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmContext {
    pub session_summary: String,
    pub recent_decisions: Vec<String>,
    pub active_entities: Vec<String>,
    pub key_facts: Vec<String>,
    pub conversation_topics: Vec<String>,
    pub resolved_errors: Vec<String>,
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdContext {
    pub commit_id: String,
    pub snapshot_path: String,
    pub archive_dir: String,
    pub entity_index_path: String,
    pub decision_log_path: String,
    pub total_messages: usize,
    pub total_entities: usize,
    pub session_duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormattedContext {
    pub hot_prompt: String,
    pub warm_prompt: String,
    pub full_prompt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenEstimates {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumableContext {
    pub version: String,
    pub conversation_id: String,
    pub session_id: String,
    pub commit_id: String,
    pub generated_at: DateTime<Utc>,
    pub hot: HotContext,
    pub warm: WarmContext,
    pub cold: ColdContext,
    pub formatted: FormattedContext,
    pub token_estimates: TokenEstimates,
    /// Hash of this record with the field itself blanked; verified before
    /// reload trusts the file.
    pub checksum: String,
}

impl ResumableContext {
    /// Checksum of a context document with its `checksum` field removed.
    pub fn checksum_of_value(value: &serde_json::Value) -> String {
        let mut stripped = value.clone();
        if let Some(object) = stripped.as_object_mut() {
            object.remove("checksum");
        }
        checksum_value(&stripped)
    }

    fn seal(mut self) -> Self {
        self.checksum = String::new();
        let value = serde_json::to_value(&self).expect("context serializes");
        self.checksum = Self::checksum_of_value(&value);
        self
    }

    pub fn verify(&self) -> bool {
        let value = serde_json::to_value(self).expect("context serializes");
        Self::checksum_of_value(&value) == self.checksum
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResumableContextGenerator;

impl ResumableContextGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, commit_id: &str, data: &SessionData) -> ResumableContext {
        let hot = self.hot(data);
        let warm = self.warm(data);
        let cold = self.cold(commit_id, data);
        let formatted = self.format(&hot, &warm, &cold);

        let token_estimates = {
            let hot_tokens = estimate_json(&hot);
            let warm_tokens = estimate_json(&warm);
            TokenEstimates {
                hot: hot_tokens,
                warm: warm_tokens,
                cold: COLD_TOKEN_ESTIMATE,
                total: hot_tokens + warm_tokens + COLD_TOKEN_ESTIMATE,
            }
        };
        debug!(
            hot = token_estimates.hot,
            warm = token_estimates.warm,
            "resumable context generated"
        );

        ResumableContext {
            version: SNAPSHOT_VERSION.to_string(),
            conversation_id: data.conversation_id.clone(),
            session_id: data.session_id.clone(),
            commit_id: commit_id.to_string(),
            generated_at: Utc::now(),
            hot,
            warm,
            cold,
            formatted,
            token_estimates,
            checksum: String::new(),
        }
        .seal()
    }

    fn hot(&self, data: &SessionData) -> HotContext {
        let last_user_message = data
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| truncate(&m.content, MAX_MESSAGE_CHARS));
        let last_assistant_message = data
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| truncate(&m.content, MAX_MESSAGE_CHARS));

        let recent_messages = data
            .messages
            .iter()
            .rev()
            .take(RECENT_MESSAGES)
            .map(|m| RecentMessage {
                role: role_name(m.role).to_string(),
                content: truncate(&m.content, RECENT_MESSAGE_CHARS),
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let mut active_files = Vec::new();
        for message in data.messages.iter().rev().take(MAX_ACTIVE_FILES) {
            for found in ACTIVE_FILE.find_iter(&message.content) {
                let path = found.as_str().to_string();
                if !active_files.contains(&path) {
                    active_files.push(path);
                }
                if active_files.len() >= MAX_ACTIVE_FILES {
                    break;
                }
            }
            if active_files.len() >= MAX_ACTIVE_FILES {
                break;
            }
        }

        HotContext {
            last_user_message,
            last_assistant_message,
            current_task: state_string(&data.task_state, "current_task"),
            task_status: state_string(&data.task_state, "status"),
            recent_messages,
            active_files,
            last_turn_number: data.messages.last().map(|m| m.turn_number).unwrap_or(0),
        }
    }

    fn warm(&self, data: &SessionData) -> WarmContext {
        let session_summary = data
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .unwrap_or_default();

        let mut recent_decisions: Vec<String> = data
            .decisions
            .iter()
            .rev()
            .take(MAX_DECISIONS)
            .map(|d| d.title.clone())
            .collect();
        recent_decisions.reverse();

        // Most-mentioned entities first.
        let mut by_mentions: Vec<(&str, usize)> = data
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e.mentions.len()))
            .collect();
        by_mentions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let active_entities = by_mentions
            .into_iter()
            .take(MAX_ENTITIES)
            .map(|(name, _)| name.to_string())
            .collect();

        let key_facts = data
            .facts
            .iter()
            .take(MAX_FACTS)
            .map(|f| f.content.clone())
            .collect();

        let conversation_topics = data
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .take(MAX_TOPICS)
            .map(|m| truncate(first_line(&m.content), 80))
            .collect();

        let mut resolved_errors = Vec::new();
        for message in &data.messages {
            for line in message.content.lines() {
                if line.to_lowercase().contains("error") {
                    let described = truncate(line.trim(), 160);
                    if !resolved_errors.contains(&described) {
                        resolved_errors.push(described);
                    }
                }
                if resolved_errors.len() >= MAX_ERRORS {
                    break;
                }
            }
            if resolved_errors.len() >= MAX_ERRORS {
                break;
            }
        }

        let mut files_modified = Vec::new();
        for change in &data.file_changes {
            if !files_modified.contains(&change.path) {
                files_modified.push(change.path.clone());
            }
            if files_modified.len() >= MAX_FILES_MODIFIED {
                break;
            }
        }

        WarmContext {
            session_summary,
            recent_decisions,
            active_entities,
            key_facts,
            conversation_topics,
            resolved_errors,
            files_modified,
        }
    }

    fn cold(&self, commit_id: &str, data: &SessionData) -> ColdContext {
        let duration_ms = match (data.messages.first(), data.messages.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp)
                .num_milliseconds()
                .max(0) as u64,
            _ => 0,
        };

        ColdContext {
            commit_id: commit_id.to_string(),
            snapshot_path: format!("archives/snapshot-{commit_id}.json"),
            archive_dir: "archives".to_string(),
            entity_index_path: "knowledge/entities.json".to_string(),
            decision_log_path: "summaries/decisions.json".to_string(),
            total_messages: data.messages.len(),
            total_entities: data.entities.len(),
            session_duration_ms: duration_ms,
        }
    }

    fn format(&self, hot: &HotContext, warm: &WarmContext, cold: &ColdContext) -> FormattedContext {
        let mut hot_prompt = String::from("## Session Resume Context (Hot)\n");
        if let Some(task) = &hot.current_task {
            hot_prompt.push_str(&format!(
                "\n**Current task**: {task} ({})\n",
                hot.task_status.as_deref().unwrap_or("unknown")
            ));
        }
        if let Some(message) = &hot.last_user_message {
            hot_prompt.push_str(&format!("\n**Last user message**: {message}\n"));
        }
        if let Some(message) = &hot.last_assistant_message {
            hot_prompt.push_str(&format!("\n**Last assistant message**: {message}\n"));
        }
        if !hot.recent_messages.is_empty() {
            hot_prompt.push_str("\n**Recent messages**:\n");
            for recent in &hot.recent_messages {
                hot_prompt.push_str(&format!("- [{}] {}\n", recent.role, recent.content));
            }
        }
        if !hot.active_files.is_empty() {
            hot_prompt.push_str("\n**Active files**:\n");
            for path in &hot.active_files {
                hot_prompt.push_str(&format!("- {path}\n"));
            }
        }
        hot_prompt.push_str(&format!("\nLast turn: {}\n", hot.last_turn_number));

        let mut warm_prompt = String::from("## Session Context (Warm)\n");
        if !warm.session_summary.is_empty() {
            warm_prompt.push_str(&format!("\n**Summary**: {}\n", warm.session_summary));
        }
        push_list(&mut warm_prompt, "Recent decisions", &warm.recent_decisions);
        push_list(&mut warm_prompt, "Active entities", &warm.active_entities);
        push_list(&mut warm_prompt, "Key facts", &warm.key_facts);
        push_list(&mut warm_prompt, "Topics", &warm.conversation_topics);
        push_list(&mut warm_prompt, "Known errors", &warm.resolved_errors);
        push_list(&mut warm_prompt, "Files modified", &warm.files_modified);

        let full_prompt = format!(
            "{hot_prompt}\n{warm_prompt}\n## Archive References (Cold)\n\n\
             - Commit: {}\n- Snapshot: {}\n- Messages: {}\n- Entities: {}\n",
            cold.commit_id, cold.snapshot_path, cold.total_messages, cold.total_entities
        );

        FormattedContext {
            hot_prompt,
            warm_prompt,
            full_prompt,
        }
    }
}

fn push_list(target: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    target.push_str(&format!("\n**{heading}**:\n"));
    for item in items {
        target.push_str(&format!("- {item}\n"));
    }
}

fn estimate_json<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value)
        .map(|rendered| token_estimate(&rendered))
        .unwrap_or(0)
}

fn state_string(state: &serde_json::Value, key: &str) -> Option<String> {
    state
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use recall_memory::ConversationMessage;

    use super::*;
    use crate::collector::{SessionStatistics, TierEntries};

    fn message(role: MessageRole, content: &str, turn: u32) -> ConversationMessage {
        ConversationMessage::new(role, content, turn)
    }

    fn data(messages: Vec<ConversationMessage>) -> SessionData {
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
            task_state: serde_json::json!({"current_task": "wire the loader", "status": "in_progress"}),
            agent_state: None,
            tier_entries: TierEntries::default(),
            statistics,
        }
    }

    #[test]
    fn hot_context_carries_last_messages_task_and_files() {
        let context = ResumableContextGenerator::new().generate(
            "commit-1-abcd",
            &data(vec![
                message(MessageRole::User, "please edit /src/loader/context.rs", 1),
                message(MessageRole::Assistant, "done, the loader builds", 2),
            ]),
        );

        assert_eq!(
            context.hot.last_user_message.as_deref(),
            Some("please edit /src/loader/context.rs")
        );
        assert_eq!(
            context.hot.last_assistant_message.as_deref(),
            Some("done, the loader builds")
        );
        assert_eq!(context.hot.current_task.as_deref(), Some("wire the loader"));
        assert_eq!(context.hot.active_files, vec!["/src/loader/context.rs"]);
        assert_eq!(context.hot.last_turn_number, 2);
        assert_eq!(context.hot.recent_messages.len(), 2);
    }

    #[test]
    fn long_messages_are_truncated_for_hot() {
        let long = "x".repeat(900);
        let context = ResumableContextGenerator::new()
            .generate("c", &data(vec![message(MessageRole::User, &long, 1)]));
        assert_eq!(
            context.hot.last_user_message.map(|m| m.chars().count()),
            Some(500)
        );
        assert_eq!(context.hot.recent_messages[0].content.chars().count(), 200);
    }

    #[test]
    fn cold_context_points_back_into_the_archive() {
        let mut first = message(MessageRole::User, "start", 1);
        first.timestamp = Utc::now() - chrono::Duration::seconds(90);
        let context = ResumableContextGenerator::new().generate(
            "commit-9-zzzz",
            &data(vec![first, message(MessageRole::Assistant, "end", 2)]),
        );

        assert_eq!(context.cold.commit_id, "commit-9-zzzz");
        assert_eq!(
            context.cold.snapshot_path,
            "archives/snapshot-commit-9-zzzz.json"
        );
        assert_eq!(context.cold.total_messages, 2);
        assert!(context.cold.session_duration_ms >= 89_000);
        assert_eq!(context.token_estimates.cold, 50);
    }

    #[test]
    fn formatted_prompts_use_the_markdown_headings() {
        let context = ResumableContextGenerator::new().generate(
            "c",
            &data(vec![message(MessageRole::User, "hello", 1)]),
        );
        assert!(context
            .formatted
            .hot_prompt
            .starts_with("## Session Resume Context (Hot)"));
        assert!(context
            .formatted
            .warm_prompt
            .starts_with("## Session Context (Warm)"));
        assert!(context.formatted.full_prompt.contains("(Hot)"));
        assert!(context.formatted.full_prompt.contains("(Warm)"));
        assert!(context.formatted.full_prompt.contains("(Cold)"));
    }

    #[test]
    fn sealed_contexts_verify_and_detect_tampering() {
        let context = ResumableContextGenerator::new().generate(
            "c",
            &data(vec![message(MessageRole::User, "hello", 1)]),
        );
        assert!(context.verify());

        let mut tampered = context;
        tampered.hot.last_user_message = Some("forged".into());
        assert!(!tampered.verify());
    }
}
