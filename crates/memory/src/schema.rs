//! Core data model shared by every tier and pipeline stage.
//!
//! Each record serializes with struct fields in declaration order; the
//! commit validator hashes the serialized form, so field order here is part
//! of the persisted contract.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Uniform token estimate used everywhere: one token per four characters,
/// rounded up.
pub fn token_estimate(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

// ── Tiers, kinds, roles ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Immediate,
    Session,
    Summarized,
    Archival,
}

impl MemoryTier {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Session => "session",
            Self::Summarized => "summarized",
            Self::Archival => "archival",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "immediate" => Some(Self::Immediate),
            "session" => Some(Self::Session),
            "summarized" => Some(Self::Summarized),
            "archival" => Some(Self::Archival),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Message,
    ToolCall,
    ToolResult,
    Decision,
    Error,
    Artifact,
    Summary,
    Fact,
    Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    User,
    Assistant,
    System,
    Tool,
}

impl From<MessageRole> for EntrySource {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
            MessageRole::System => Self::System,
        }
    }
}

// ── MemoryEntry ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryMetadata {
    pub conversation_id: String,
    pub session_id: String,
    pub turn_number: Option<u32>,
    pub source: Option<EntrySource>,
    pub tags: Vec<String>,
    pub entities: Vec<String>,
    pub references: Vec<String>,
}

/// The universal record stored in every tier. `tier` always names the tier
/// holding this copy; promotion across tiers clones the entry and rewrites
/// the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub tier: MemoryTier,
    pub kind: EntryKind,
    pub content: String,
    pub metadata: EntryMetadata,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub importance: f64,
    pub tokens: Option<usize>,
}

impl MemoryEntry {
    pub fn new(tier: MemoryTier, kind: EntryKind, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tier,
            kind,
            content: content.into(),
            metadata: EntryMetadata::default(),
            created_at: now,
            accessed_at: now,
            importance: 0.5,
            tokens: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn set_importance(&mut self, importance: f64) {
        self.importance = importance.clamp(0.0, 1.0);
    }

    /// Fill in the token estimate if absent, returning it either way.
    pub fn ensure_tokens(&mut self) -> usize {
        let tokens = self.tokens.unwrap_or_else(|| token_estimate(&self.content));
        self.tokens = Some(tokens);
        tokens
    }

    pub fn touch(&mut self) {
        self.accessed_at = Utc::now();
    }

    /// Clone into another tier, rewriting the `tier` field on the copy.
    pub fn copy_to_tier(&self, tier: MemoryTier) -> Self {
        let mut copy = self.clone();
        copy.tier = tier;
        copy
    }
}

// ── Conversation records ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub turn_number: u32,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, turn_number: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            turn_number,
            tool_calls: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Output recorded for a tool call, keyed back to the call by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutputRecord {
    pub tool_call_id: String,
    pub name: String,
    pub output: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeOp {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangeRecord {
    pub path: String,
    pub op: FileChangeOp,
    pub turn_number: u32,
    pub timestamp: DateTime<Utc>,
    pub details: BTreeMap<String, serde_json::Value>,
}

// ── Knowledge records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    File,
    Function,
    Class,
    Concept,
    Decision,
    Bug,
    Feature,
    Person,
    Tool,
    Config,
    Dependency,
}

impl EntityKind {
    pub fn slug(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Function => "function",
            Self::Class => "class",
            Self::Concept => "concept",
            Self::Decision => "decision",
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Person => "person",
            Self::Tool => "tool",
            Self::Config => "config",
            Self::Dependency => "dependency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    RelatedTo,
    Imports,
    Extends,
    Implements,
    Uses,
    Calls,
    Creates,
    Modifies,
    DependsOn,
    Contains,
    PartOf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub turn_number: u32,
    pub start_offset: usize,
    pub end_offset: usize,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub from_entity_id: String,
    pub to_entity_id: String,
    pub kind: RelationKind,
    pub weight: f64,
}

/// A named thing extracted from the conversation. Entities form a directed
/// graph: nodes here, edges in `relationships` resolved by id lookup,
/// never by pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub mentions: Vec<EntityMention>,
    pub relationships: Vec<EntityRelationship>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractedEntity {
    /// Uniqueness key: kind plus case-folded name.
    pub fn dedup_key(&self) -> (EntityKind, String) {
        (self.kind, self.name.to_lowercase())
    }

    /// Fold `other` into this entity: union mentions (by turn + offsets) and
    /// relationships (by from/kind/to, summing weight).
    pub fn merge(&mut self, other: &ExtractedEntity) {
        for mention in &other.mentions {
            let duplicate = self.mentions.iter().any(|m| {
                m.turn_number == mention.turn_number
                    && m.start_offset == mention.start_offset
                    && m.end_offset == mention.end_offset
            });
            if !duplicate {
                self.mentions.push(mention.clone());
            }
        }
        for relationship in &other.relationships {
            self.add_relationship(relationship.clone());
        }
        if other.updated_at > self.updated_at {
            self.updated_at = other.updated_at;
        }
    }

    pub fn add_relationship(&mut self, relationship: EntityRelationship) {
        if let Some(existing) = self.relationships.iter_mut().find(|r| {
            r.from_entity_id == relationship.from_entity_id
                && r.to_entity_id == relationship.to_entity_id
                && r.kind == relationship.kind
        }) {
            existing.weight += relationship.weight;
        } else {
            self.relationships.push(relationship);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDecision {
    pub id: String,
    pub title: String,
    pub description: String,
    pub rationale: String,
    pub alternatives: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub turn_number: u32,
    pub impact: ImpactLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedFact {
    pub id: String,
    pub content: String,
    pub source: String,
    pub confidence: f64,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

// ── Summaries ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    Session,
    Chunk,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNote {
    pub description: String,
    pub solution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub conversation_id: String,
    pub kind: SummaryKind,
    pub content: String,
    pub key_points: Vec<String>,
    pub decisions: Vec<String>,
    pub errors: Vec<ErrorNote>,
    pub files_modified: Vec<String>,
    pub current_state: String,
    pub next_steps: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub source_messages: usize,
    pub tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(token_estimate(""), 0);
        assert_eq!(token_estimate("abc"), 1);
        assert_eq!(token_estimate("abcd"), 1);
        assert_eq!(token_estimate("abcde"), 2);
    }

    #[test]
    fn importance_is_clamped() {
        let entry = MemoryEntry::new(MemoryTier::Immediate, EntryKind::Message, "hi")
            .with_importance(3.0);
        assert_eq!(entry.importance, 1.0);
        let entry = entry.with_importance(-1.0);
        assert_eq!(entry.importance, 0.0);
    }

    #[test]
    fn tier_copy_rewrites_only_the_tier_field() {
        let entry = MemoryEntry::new(MemoryTier::Session, EntryKind::Message, "hello")
            .with_importance(0.4);
        let archived = entry.copy_to_tier(MemoryTier::Archival);
        assert_eq!(archived.tier, MemoryTier::Archival);
        assert_eq!(archived.id, entry.id);
        assert_eq!(archived.content, entry.content);
    }

    #[test]
    fn entity_merge_dedups_mentions_and_sums_relationship_weight() {
        let now = Utc::now();
        let mention = EntityMention {
            turn_number: 1,
            start_offset: 4,
            end_offset: 10,
            context: "around".into(),
        };
        let edge = EntityRelationship {
            from_entity_id: "a".into(),
            to_entity_id: "b".into(),
            kind: RelationKind::Uses,
            weight: 1.0,
        };
        let mut left = ExtractedEntity {
            id: "a".into(),
            name: "parser".into(),
            kind: EntityKind::Function,
            properties: BTreeMap::new(),
            mentions: vec![mention.clone()],
            relationships: vec![edge.clone()],
            created_at: now,
            updated_at: now,
        };
        let right = ExtractedEntity {
            mentions: vec![
                mention,
                EntityMention {
                    turn_number: 2,
                    start_offset: 0,
                    end_offset: 6,
                    context: "again".into(),
                },
            ],
            relationships: vec![edge],
            ..left.clone()
        };

        left.merge(&right);
        assert_eq!(left.mentions.len(), 2);
        assert_eq!(left.relationships.len(), 1);
        assert_eq!(left.relationships[0].weight, 2.0);
    }

    #[test]
    fn tier_slugs_round_trip() {
        for tier in [
            MemoryTier::Immediate,
            MemoryTier::Session,
            MemoryTier::Summarized,
            MemoryTier::Archival,
        ] {
            assert_eq!(MemoryTier::parse(tier.slug()), Some(tier));
        }
        assert_eq!(MemoryTier::parse("bogus"), None);
    }
}
