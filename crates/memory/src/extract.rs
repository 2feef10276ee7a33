//! Regex-driven knowledge extraction from conversation messages.
//!
//! The pattern set below is fixed and part of the observable contract: the
//! same input always yields the same entities, facts, and relationship edges
//! (ids derive from kind + normalized name, never from randomness), so
//! extraction survives commit/reload round trips byte-identically.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use crate::schema::{
    ConversationMessage, EntityKind, EntityMention, EntityRelationship, ExtractedEntity,
    LearnedFact, MessageRole, RelationKind,
};

/// Characters of surrounding context captured with each mention.
const CONTEXT_RADIUS: usize = 30;
/// Two mentions within this many bytes of each other co-occur.
const COOCCURRENCE_WINDOW: usize = 60;
const FACT_CONFIDENCE: f64 = 0.8;

static ENTITY_PATTERNS: LazyLock<Vec<(EntityKind, Regex)>> = LazyLock::new(|| {
    let compile = |pattern: &str| Regex::new(pattern).expect("entity pattern");
    vec![
        (
            EntityKind::File,
            compile(r"((?:\.{0,2}/)?(?:[\w.-]+/)*[\w-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|rb|c|h|cpp|hpp|json|toml|yaml|yml|md|sh|sql|css|html))\b"),
        ),
        (
            EntityKind::Function,
            compile(r"\b(?:fn|function|def|func|method)\s+([A-Za-z_][A-Za-z0-9_]*)"),
        ),
        (
            EntityKind::Function,
            compile(r"\b([a-z_][a-z0-9_]{2,})\(\)"),
        ),
        (
            EntityKind::Class,
            compile(r"\b(?:class|struct|trait|interface|enum)\s+([A-Z][A-Za-z0-9_]*)"),
        ),
        (
            EntityKind::Concept,
            compile(r"`([^`\n]{4,40})`"),
        ),
        (
            EntityKind::Decision,
            compile(r"(?i)(?:decided to|chose to|going with|selected)\s+([^.\n]{3,60})"),
        ),
        (
            EntityKind::Bug,
            compile(r"(?i)\b((?:bug|issue|defect)\s*#?\d+)\b"),
        ),
        (
            EntityKind::Feature,
            compile(r"(?i)\b(?:feature|implement(?:ed|ing)?|support for)\s+([a-z][\w-]{2,40})"),
        ),
        (
            EntityKind::Person,
            compile(r"@([A-Za-z][A-Za-z0-9_-]{1,30})"),
        ),
        (
            EntityKind::Tool,
            compile(r"\b(cargo|rustc|clippy|git|docker|kubectl|npm|pnpm|yarn|pip|pytest|make|cmake|gdb|curl|grep|sed|awk)\b"),
        ),
        (
            EntityKind::Config,
            compile(r"\b([A-Z][A-Z0-9]*(?:_[A-Z0-9]+)+)\b"),
        ),
        (
            EntityKind::Dependency,
            compile(r"(?i)\b(?:crate|package|library|dependency)\s+`?([a-z][a-z0-9_-]{1,40})`?"),
        ),
    ]
});

static FACT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:note|important|remember|key point):\s*(.+)$").expect("fact marker")
});
static BLOCKQUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*>\s+(.+)$").expect("blockquote"));
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("bold"));

static RELATION_VERBS: LazyLock<Vec<(RelationKind, Regex)>> = LazyLock::new(|| {
    let compile = |pattern: &str| Regex::new(pattern).expect("relation verb pattern");
    vec![
        (RelationKind::Imports, compile(r"(?i)\bimports?\b")),
        (RelationKind::Extends, compile(r"(?i)\bextends?\b|\binherits?\b")),
        (RelationKind::Implements, compile(r"(?i)\bimplements?\b")),
        (RelationKind::Uses, compile(r"(?i)\buses?\b|\busing\b")),
        (RelationKind::Calls, compile(r"(?i)\bcalls?\b|\binvokes?\b")),
        (RelationKind::Creates, compile(r"(?i)\bcreates?\b|\bconstructs?\b")),
        (RelationKind::Modifies, compile(r"(?i)\bmodif(?:y|ies)\b|\bupdates?\b|\bchanges?\b")),
        (RelationKind::DependsOn, compile(r"(?i)\bdepends?\s+on\b|\brequires?\b")),
        (RelationKind::Contains, compile(r"(?i)\bcontains?\b|\bincludes?\b")),
        (RelationKind::PartOf, compile(r"(?i)\bpart\s+of\b|\bbelongs\s+to\b")),
    ]
});

#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub facts: Vec<LearnedFact>,
    pub relationships: Vec<EntityRelationship>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KnowledgeExtractor;

impl KnowledgeExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, messages: &[ConversationMessage]) -> ExtractionResult {
        let mut entities: BTreeMap<(EntityKind, String), ExtractedEntity> = BTreeMap::new();
        // Mention spans per message index, for co-occurrence detection.
        let mut spans: Vec<Vec<(String, usize, usize)>> = vec![Vec::new(); messages.len()];

        for (message_index, message) in messages.iter().enumerate() {
            for (kind, pattern) in ENTITY_PATTERNS.iter() {
                for captures in pattern.captures_iter(&message.content) {
                    let matched = match captures.get(1) {
                        Some(group) => group,
                        None => continue,
                    };
                    let name = matched.as_str().trim().to_string();
                    if name.is_empty() {
                        continue;
                    }

                    let id = entity_id(*kind, &name);
                    let mention = EntityMention {
                        turn_number: message.turn_number,
                        start_offset: matched.start(),
                        end_offset: matched.end(),
                        context: context_window(
                            &message.content,
                            matched.start(),
                            matched.end(),
                        ),
                    };
                    spans[message_index].push((id.clone(), matched.start(), matched.end()));

                    let now = Utc::now();
                    let candidate = ExtractedEntity {
                        id,
                        name: name.clone(),
                        kind: *kind,
                        properties: BTreeMap::new(),
                        mentions: vec![mention],
                        relationships: Vec::new(),
                        created_at: now,
                        updated_at: now,
                    };
                    entities
                        .entry((*kind, name.to_lowercase()))
                        .and_modify(|existing| existing.merge(&candidate))
                        .or_insert(candidate);
                }
            }
        }

        let relationships = self.link_entities(messages, &spans);
        for edge in &relationships {
            if let Some(entity) = entities
                .values_mut()
                .find(|candidate| candidate.id == edge.from_entity_id)
            {
                entity.add_relationship(edge.clone());
            }
        }

        let facts = self.extract_facts(messages);
        let result = ExtractionResult {
            entities: entities.into_values().collect(),
            facts,
            relationships,
        };
        debug!(
            entities = result.entities.len(),
            facts = result.facts.len(),
            relationships = result.relationships.len(),
            "knowledge extraction complete"
        );
        result
    }

    /// Facts are assistant lines carrying an explicit marker, a blockquote,
    /// or a bold run longer than ten characters.
    pub fn extract_facts(&self, messages: &[ConversationMessage]) -> Vec<LearnedFact> {
        let mut facts = Vec::new();

        for message in messages {
            if message.role != MessageRole::Assistant {
                continue;
            }

            let mut index_in_turn = 0;
            let mut push_fact = |content: &str, facts: &mut Vec<LearnedFact>| {
                let content = content.trim();
                if content.is_empty() {
                    return;
                }
                facts.push(LearnedFact {
                    id: format!("fact-{}-{}", message.turn_number, index_in_turn),
                    content: content.to_string(),
                    source: format!("turn-{}", message.turn_number),
                    confidence: FACT_CONFIDENCE,
                    category: categorize(content).to_string(),
                    timestamp: message.timestamp,
                });
                index_in_turn += 1;
            };

            for line in message.content.lines() {
                if let Some(captures) = FACT_MARKER.captures(line) {
                    push_fact(&captures[1], &mut facts);
                } else if let Some(captures) = BLOCKQUOTE.captures(line) {
                    push_fact(&captures[1], &mut facts);
                } else {
                    for captures in BOLD.captures_iter(line) {
                        if captures[1].chars().count() > 10 {
                            push_fact(&captures[1], &mut facts);
                        }
                    }
                }
            }
        }
        facts
    }

    /// Entities co-occurring within a 60-byte window form a `related_to`
    /// edge, refined to a specific kind by the first verb pattern found in
    /// the text between them.
    fn link_entities(
        &self,
        messages: &[ConversationMessage],
        spans: &[Vec<(String, usize, usize)>],
    ) -> Vec<EntityRelationship> {
        let mut edges: BTreeMap<(String, RelationKind, String), EntityRelationship> =
            BTreeMap::new();

        for (message_index, message_spans) in spans.iter().enumerate() {
            let content = &messages[message_index].content;
            let mut ordered = message_spans.clone();
            ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

            for (left_index, (from_id, from_start, from_end)) in ordered.iter().enumerate() {
                for (to_id, to_start, _) in ordered.iter().skip(left_index + 1) {
                    if from_id == to_id {
                        continue;
                    }
                    if to_start.saturating_sub(*from_start) > COOCCURRENCE_WINDOW {
                        break;
                    }

                    let between = slice_on_boundaries(content, *from_end, *to_start);
                    let kind = RELATION_VERBS
                        .iter()
                        .find(|(_, pattern)| pattern.is_match(between))
                        .map(|(kind, _)| *kind)
                        .unwrap_or(RelationKind::RelatedTo);

                    let key = (from_id.clone(), kind, to_id.clone());
                    edges
                        .entry(key)
                        .and_modify(|edge| edge.weight += 1.0)
                        .or_insert(EntityRelationship {
                            from_entity_id: from_id.clone(),
                            to_entity_id: to_id.clone(),
                            kind,
                            weight: 1.0,
                        });
                }
            }
        }

        edges.into_values().collect()
    }
}

fn entity_id(kind: EntityKind, name: &str) -> String {
    let normalized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("entity-{}-{}", kind.slug(), normalized)
}

fn categorize(content: &str) -> &'static str {
    let lower = content.to_lowercase();
    if ["error", "bug", "fix", "crash", "fail"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "troubleshooting"
    } else if ["slow", "fast", "latency", "performance", "optimi"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "performance"
    } else if ["auth", "token", "secur", "vulnerab", "password"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "security"
    } else if ["api", "endpoint", "request", "response"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "api"
    } else if ["config", "setting", "environment variable", "flag"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "configuration"
    } else {
        "general"
    }
}

/// Slice `text[start..end]` nudging both ends outward/inward to the nearest
/// character boundaries.
fn slice_on_boundaries(text: &str, mut start: usize, mut end: usize) -> &str {
    if start > end {
        return "";
    }
    start = start.min(text.len());
    end = end.min(text.len());
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    if start > end { "" } else { &text[start..end] }
}

fn context_window(text: &str, start: usize, end: usize) -> String {
    let window_start = start.saturating_sub(CONTEXT_RADIUS);
    let window_end = (end + CONTEXT_RADIUS).min(text.len());
    slice_on_boundaries(text, window_start, window_end).to_string()
}
