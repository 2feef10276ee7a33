pub mod extract;
pub mod relevance;
pub mod schema;
pub mod summarize;
pub mod tiers;

pub use extract::{ExtractionResult, KnowledgeExtractor};
pub use relevance::{RankedKnowledge, RelevanceContext, RelevanceScorer, ScoredItem};
pub use schema::{
    ConversationMessage, EntityKind, EntityMention, EntityRelationship, EntryKind, EntryMetadata,
    EntrySource, ErrorNote, ExtractedEntity, FileChangeOp, FileChangeRecord, ImpactLevel,
    KeyDecision, LearnedFact, MemoryEntry, MemoryTier, MessageRole, RelationKind, Summary,
    SummaryKind, ToolCallRecord, ToolOutputRecord, token_estimate,
};
pub use summarize::{HeuristicSummarizer, Summarize, extract_decisions};
pub use tiers::{
    RetrieveOptions, TierRetrieve, archival::ArchivalMemory, immediate::ImmediateMemory,
    session::SessionMemory, summarized::SummarizedMemory,
};
