//! Heuristic summarization over conversation messages.
//!
//! [`Summarize`] is the seam for external summarizers (an LLM-backed one
//! plugs in here); [`HeuristicSummarizer`] is the built-in implementation the
//! engine ships with. Given identical input it produces identical output
//! (ids are derived from turn numbers, not random), which the commit
//! round-trip property relies on.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use recall_config::SummarizerConfig;

use crate::schema::{
    ConversationMessage, ErrorNote, ImpactLevel, KeyDecision, MessageRole, Summary, SummaryKind,
    token_estimate,
};

static DECISION_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(decided to|chose to|will use|going with|selected|recommendation:)")
        .expect("decision cue pattern")
});

static FILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\.{0,2}/)?(?:[\w.-]+/)+[\w.-]+\.\w+").expect("file path pattern")
});

static NEXT_STEP_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(next steps?|todo|remaining|follow[ -]?up)\b").expect("next step pattern")
});

static RESOLUTION_CUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(fix(ed)?|resolv|solv|workaround)").expect("resolution"));

pub trait Summarize: Send + Sync {
    fn summarize(&self, conversation_id: &str, messages: &[ConversationMessage]) -> Summary;
}

// ── Decision extraction ──────────────────────────────────────────────────────

/// Scan assistant messages for decision cues. Each matching line yields a
/// [`KeyDecision`] whose rationale is the following line; impact is derived
/// from keywords on the matched line.
pub fn extract_decisions(messages: &[ConversationMessage]) -> Vec<KeyDecision> {
    let mut decisions = Vec::new();

    for message in messages {
        if message.role != MessageRole::Assistant {
            continue;
        }

        let lines: Vec<&str> = message.content.lines().collect();
        let mut index_in_turn = 0;
        for (line_no, line) in lines.iter().enumerate() {
            if !DECISION_CUE.is_match(line) {
                continue;
            }

            let title = truncate(line.trim(), 80);
            let rationale = lines
                .get(line_no + 1)
                .map(|next| next.trim().to_string())
                .unwrap_or_default();

            decisions.push(KeyDecision {
                id: format!("decision-{}-{}", message.turn_number, index_in_turn),
                title,
                description: line.trim().to_string(),
                rationale,
                alternatives: Vec::new(),
                timestamp: message.timestamp,
                turn_number: message.turn_number,
                impact: impact_of(line),
            });
            index_in_turn += 1;
        }
    }

    debug!(count = decisions.len(), "extracted decisions");
    decisions
}

fn impact_of(line: &str) -> ImpactLevel {
    let lower = line.to_lowercase();
    if lower.contains("critical") || lower.contains("breaking") {
        ImpactLevel::Critical
    } else if lower.contains("important") || lower.contains("major") {
        ImpactLevel::High
    } else if lower.contains("minor") || lower.contains("small") {
        ImpactLevel::Low
    } else {
        ImpactLevel::Medium
    }
}

// ── Heuristic summarizer ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeuristicSummarizer {
    min_messages: usize,
    chunk_size_tokens: usize,
}

impl Default for HeuristicSummarizer {
    fn default() -> Self {
        Self::new(&SummarizerConfig::default())
    }
}

impl HeuristicSummarizer {
    pub fn new(config: &SummarizerConfig) -> Self {
        Self {
            min_messages: config.min_messages_for_summary,
            chunk_size_tokens: config.chunk_size_tokens.max(1),
        }
    }

    fn minimal_summary(&self, conversation_id: &str, messages: &[ConversationMessage]) -> Summary {
        let latest = messages
            .last()
            .map(|m| truncate(first_line(&m.content), 100))
            .unwrap_or_default();
        let content = if messages.is_empty() {
            "Empty session with no messages yet.".to_string()
        } else {
            format!(
                "Brief session with {} messages; latest: {latest}",
                messages.len()
            )
        };

        Summary {
            id: summary_id(conversation_id, messages),
            conversation_id: conversation_id.to_string(),
            kind: SummaryKind::Session,
            tokens: token_estimate(&joined_content(messages)),
            content,
            key_points: Vec::new(),
            decisions: Vec::new(),
            errors: Vec::new(),
            files_modified: Vec::new(),
            current_state: String::new(),
            next_steps: Vec::new(),
            timestamp: summary_timestamp(messages),
            source_messages: messages.len(),
        }
    }

    /// Greedy fill: consecutive messages go into the current chunk until its
    /// estimated token count would exceed the cap.
    fn chunk<'a>(&self, messages: &'a [ConversationMessage]) -> Vec<&'a [ConversationMessage]> {
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut used = 0;

        for (index, message) in messages.iter().enumerate() {
            let cost = token_estimate(&message.content);
            if used + cost > self.chunk_size_tokens && index > start {
                chunks.push(&messages[start..index]);
                start = index;
                used = 0;
            }
            used += cost;
        }
        if start < messages.len() {
            chunks.push(&messages[start..]);
        }
        chunks
    }

    fn summarize_chunk(
        &self,
        conversation_id: &str,
        messages: &[ConversationMessage],
        kind: SummaryKind,
    ) -> Summary {
        let user_count = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count();
        let assistant_count = messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .count();
        let first_turn = messages.first().map(|m| m.turn_number).unwrap_or(0);
        let last_turn = messages.last().map(|m| m.turn_number).unwrap_or(0);

        let opening_topic = messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| truncate(first_line(&m.content), 120))
            .unwrap_or_default();
        let content = if opening_topic.is_empty() {
            format!(
                "Turns {first_turn}-{last_turn}: {user_count} user and {assistant_count} assistant messages."
            )
        } else {
            format!(
                "Turns {first_turn}-{last_turn}: {user_count} user and {assistant_count} assistant messages, opening with: {opening_topic}"
            )
        };

        let mut key_points = Vec::new();
        for message in messages {
            if message.role != MessageRole::Assistant {
                continue;
            }
            let sentence = first_sentence(&message.content);
            if sentence.chars().count() > 40 && !key_points.contains(&sentence) {
                key_points.push(sentence);
            }
            if key_points.len() >= 10 {
                break;
            }
        }

        let decisions = extract_decisions(messages)
            .into_iter()
            .map(|d| d.title)
            .collect();

        let mut errors: Vec<ErrorNote> = Vec::new();
        for message in messages {
            let lines: Vec<&str> = message.content.lines().collect();
            for (line_no, line) in lines.iter().enumerate() {
                if !line.to_lowercase().contains("error") {
                    continue;
                }
                let description = truncate(line.trim(), 200);
                if errors.iter().any(|e| e.description == description) {
                    continue;
                }
                let solution = lines
                    .get(line_no + 1)
                    .filter(|next| RESOLUTION_CUE.is_match(next))
                    .map(|next| next.trim().to_string());
                errors.push(ErrorNote {
                    description,
                    solution,
                });
            }
        }

        let mut files_modified = Vec::new();
        for message in messages {
            for found in FILE_PATH.find_iter(&message.content) {
                let path = found.as_str().to_string();
                if !files_modified.contains(&path) {
                    files_modified.push(path);
                }
            }
        }

        let current_state = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| truncate(first_line(&m.content), 200))
            .unwrap_or_default();

        let mut next_steps = Vec::new();
        for message in messages.iter().rev().take(4) {
            for line in message.content.lines() {
                if NEXT_STEP_CUE.is_match(line) && !next_steps.contains(&line.trim().to_string()) {
                    next_steps.push(line.trim().to_string());
                }
            }
        }
        next_steps.truncate(5);

        Summary {
            id: summary_id(conversation_id, messages),
            conversation_id: conversation_id.to_string(),
            kind,
            tokens: token_estimate(&joined_content(messages)),
            content,
            key_points,
            decisions,
            errors,
            files_modified,
            current_state,
            next_steps,
            timestamp: summary_timestamp(messages),
            source_messages: messages.len(),
        }
    }

    fn merge_chunk_summaries(
        &self,
        conversation_id: &str,
        messages: &[ConversationMessage],
        chunks: Vec<Summary>,
    ) -> Summary {
        let mut content_parts = Vec::new();
        let mut key_points = Vec::new();
        let mut decisions: Vec<String> = Vec::new();
        let mut errors = Vec::new();
        let mut files_modified = Vec::new();

        for chunk in &chunks {
            content_parts.push(chunk.content.clone());
            for point in &chunk.key_points {
                if !key_points.contains(point) {
                    key_points.push(point.clone());
                }
            }
            for decision in &chunk.decisions {
                // Dedup by the first 30 characters of the title.
                let prefix: String = decision.chars().take(30).collect();
                if !decisions
                    .iter()
                    .any(|existing| existing.chars().take(30).collect::<String>() == prefix)
                {
                    decisions.push(decision.clone());
                }
            }
            for error in &chunk.errors {
                if !errors.contains(error) {
                    errors.push(error.clone());
                }
            }
            for file in &chunk.files_modified {
                if !files_modified.contains(file) {
                    files_modified.push(file.clone());
                }
            }
        }

        let last = chunks.last().expect("at least one chunk");
        Summary {
            id: summary_id(conversation_id, messages),
            conversation_id: conversation_id.to_string(),
            kind: SummaryKind::Merged,
            tokens: token_estimate(&joined_content(messages)),
            content: content_parts.join("\n\n"),
            key_points,
            decisions,
            errors,
            files_modified,
            current_state: last.current_state.clone(),
            next_steps: last.next_steps.clone(),
            timestamp: summary_timestamp(messages),
            source_messages: messages.len(),
        }
    }
}

impl Summarize for HeuristicSummarizer {
    fn summarize(&self, conversation_id: &str, messages: &[ConversationMessage]) -> Summary {
        if messages.len() < self.min_messages {
            return self.minimal_summary(conversation_id, messages);
        }

        let chunks = self.chunk(messages);
        if chunks.len() == 1 {
            return self.summarize_chunk(conversation_id, chunks[0], SummaryKind::Session);
        }

        let chunk_summaries: Vec<Summary> = chunks
            .iter()
            .map(|chunk| self.summarize_chunk(conversation_id, chunk, SummaryKind::Chunk))
            .collect();
        self.merge_chunk_summaries(conversation_id, messages, chunk_summaries)
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn summary_id(conversation_id: &str, messages: &[ConversationMessage]) -> String {
    let first = messages.first().map(|m| m.turn_number).unwrap_or(0);
    let last = messages.last().map(|m| m.turn_number).unwrap_or(0);
    format!("summary-{conversation_id}-{first}-{last}")
}

/// Summaries are timestamped from their newest source message so identical
/// input always yields an identical record.
fn summary_timestamp(messages: &[ConversationMessage]) -> chrono::DateTime<Utc> {
    messages
        .last()
        .map(|message| message.timestamp)
        .unwrap_or_else(Utc::now)
}

fn joined_content(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn first_sentence(text: &str) -> String {
    let line = first_line(text);
    match line.find(". ") {
        Some(position) => line[..position + 1].to_string(),
        None => line.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ConversationMessage;

    fn message(role: MessageRole, content: &str, turn: u32) -> ConversationMessage {
        ConversationMessage::new(role, content, turn)
    }

    fn conversation(pairs: usize) -> Vec<ConversationMessage> {
        let mut messages = Vec::new();
        let mut turn = 1;
        for i in 0..pairs {
            messages.push(message(
                MessageRole::User,
                &format!("Please look into module {i} and its failures"),
                turn,
            ));
            turn += 1;
            messages.push(message(
                MessageRole::Assistant,
                &format!(
                    "I inspected module {i} carefully and found the initialization order problem.\n\
                     Decided to use lazy statics for module {i}.\nBecause init order was undefined."
                ),
                turn,
            ));
            turn += 1;
        }
        messages
    }

    #[test]
    fn short_conversations_get_a_minimal_summary() {
        let summarizer = HeuristicSummarizer::default();
        let summary = summarizer.summarize("conv", &conversation(2));
        assert_eq!(summary.kind, SummaryKind::Session);
        assert!(summary.content.starts_with("Brief session with 4 messages"));
        assert_eq!(summary.source_messages, 4);
    }

    #[test]
    fn full_summary_collects_decisions_and_key_points() {
        let summarizer = HeuristicSummarizer::default();
        let messages = conversation(6);
        let summary = summarizer.summarize("conv", &messages);

        assert_eq!(summary.kind, SummaryKind::Session);
        assert!(!summary.key_points.is_empty());
        assert!(!summary.decisions.is_empty());
        assert!(summary.decisions[0].contains("Decided to use"));
        assert!(!summary.current_state.is_empty());
    }

    #[test]
    fn chunked_conversations_merge_with_last_state_winning() {
        let summarizer = HeuristicSummarizer::new(&SummarizerConfig {
            min_messages_for_summary: 2,
            chunk_size_tokens: 40,
        });
        let messages = conversation(6);
        let summary = summarizer.summarize("conv", &messages);

        assert_eq!(summary.kind, SummaryKind::Merged);
        assert!(summary.content.contains("\n\n"));
        assert_eq!(summary.source_messages, messages.len());
    }

    #[test]
    fn summaries_are_deterministic_for_fixed_input() {
        let summarizer = HeuristicSummarizer::default();
        let messages = conversation(6);
        let a = summarizer.summarize("conv", &messages);
        let b = summarizer.summarize("conv", &messages);
        assert_eq!(a.id, b.id);
        assert_eq!(a.content, b.content);
        assert_eq!(a.key_points, b.key_points);
        assert_eq!(a.decisions, b.decisions);
    }

    #[test]
    fn decision_extraction_reads_cue_rationale_and_impact() {
        let messages = vec![message(
            MessageRole::Assistant,
            "After profiling, decided to use an arena allocator (important change).\n\
             Allocation pressure dominated the hot path.\n\
             Also going with a minor tweak to logging.",
            3,
        )];

        let decisions = extract_decisions(&messages);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].impact, ImpactLevel::High);
        assert_eq!(decisions[0].turn_number, 3);
        assert_eq!(decisions[0].id, "decision-3-0");
        assert!(decisions[0].rationale.contains("Allocation pressure"));
        assert_eq!(decisions[1].impact, ImpactLevel::Low);
    }

    #[test]
    fn user_messages_never_produce_decisions() {
        let messages = vec![message(
            MessageRole::User,
            "I decided to use vim keybindings",
            1,
        )];
        assert!(extract_decisions(&messages).is_empty());
    }

    #[test]
    fn errors_and_files_are_captured() {
        let summarizer = HeuristicSummarizer::new(&SummarizerConfig {
            min_messages_for_summary: 1,
            chunk_size_tokens: 50_000,
        });
        let messages = vec![message(
            MessageRole::Assistant,
            "Hit a segfault error in src/runtime/engine.rs during startup.\n\
             Fixed by reordering the initializers.",
            1,
        )];

        let summary = summarizer.summarize("conv", &messages);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].solution.as_deref().unwrap_or("").contains("reordering"));
        assert_eq!(summary.files_modified, vec!["src/runtime/engine.rs".to_string()]);
    }
}
