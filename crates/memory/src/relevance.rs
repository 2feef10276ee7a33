//! Relevance ranking of entities, decisions, and facts against the current
//! task context.
//!
//! Five factors, each in [0,1], combine under configurable weights
//! (defaults: recency 0.25, frequency 0.15, importance 0.30, relevance 0.20,
//! connections 0.10). Items below the threshold are dropped and the result
//! is capped at `max_items`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use recall_config::RelevanceConfig;

use crate::schema::{EntityKind, ExtractedEntity, ImpactLevel, KeyDecision, LearnedFact};

#[derive(Debug, Clone, Default)]
pub struct RelevanceContext {
    pub current_task: Option<String>,
    pub active_files: Vec<String>,
    pub recent_topics: Vec<String>,
    pub conversation_keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreFactors {
    pub recency: f64,
    pub frequency: f64,
    pub importance: f64,
    pub relevance: f64,
    pub connections: f64,
}

#[derive(Debug, Clone)]
pub struct ScoredItem<T> {
    pub item: T,
    pub score: f64,
    pub factors: ScoreFactors,
}

#[derive(Debug, Clone, Default)]
pub struct RankedKnowledge {
    pub entities: Vec<ScoredItem<ExtractedEntity>>,
    pub decisions: Vec<ScoredItem<KeyDecision>>,
    pub facts: Vec<ScoredItem<LearnedFact>>,
}

#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    config: RelevanceConfig,
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        Self::new(RelevanceConfig::default())
    }
}

impl RelevanceScorer {
    pub fn new(config: RelevanceConfig) -> Self {
        Self { config }
    }

    pub fn score_all(
        &self,
        entities: &[ExtractedEntity],
        decisions: &[KeyDecision],
        facts: &[LearnedFact],
        context: &RelevanceContext,
    ) -> RankedKnowledge {
        RankedKnowledge {
            entities: self.score_entities(entities, context),
            decisions: self.score_decisions(decisions, context),
            facts: self.score_facts(facts, context),
        }
    }

    pub fn score_entities(
        &self,
        entities: &[ExtractedEntity],
        context: &RelevanceContext,
    ) -> Vec<ScoredItem<ExtractedEntity>> {
        let now = Utc::now();
        self.rank(entities.iter().map(|entity| {
            let factors = ScoreFactors {
                recency: recency_score(entity.updated_at, now),
                frequency: log_scale(entity.mentions.len(), 100.0),
                importance: entity_importance(entity.kind),
                relevance: context_overlap(&entity.name, context),
                connections: log_scale(entity.relationships.len(), 20.0),
            };
            (entity.clone(), factors)
        }))
    }

    pub fn score_decisions(
        &self,
        decisions: &[KeyDecision],
        context: &RelevanceContext,
    ) -> Vec<ScoredItem<KeyDecision>> {
        let now = Utc::now();
        self.rank(decisions.iter().map(|decision| {
            let text = format!("{} {}", decision.title, decision.description);
            let factors = ScoreFactors {
                recency: recency_score(decision.timestamp, now),
                frequency: log_scale(1, 100.0),
                importance: decision_importance(decision, context),
                relevance: context_overlap(&text, context),
                connections: 0.0,
            };
            (decision.clone(), factors)
        }))
    }

    pub fn score_facts(
        &self,
        facts: &[LearnedFact],
        context: &RelevanceContext,
    ) -> Vec<ScoredItem<LearnedFact>> {
        let now = Utc::now();
        self.rank(facts.iter().map(|fact| {
            let factors = ScoreFactors {
                recency: recency_score(fact.timestamp, now),
                frequency: log_scale(1, 100.0),
                importance: fact.confidence.clamp(0.0, 1.0),
                relevance: context_overlap(&fact.content, context),
                connections: 0.0,
            };
            (fact.clone(), factors)
        }))
    }

    fn rank<T>(
        &self,
        scored: impl Iterator<Item = (T, ScoreFactors)>,
    ) -> Vec<ScoredItem<T>> {
        let mut ranked: Vec<ScoredItem<T>> = scored
            .map(|(item, factors)| ScoredItem {
                score: self.weighted(factors),
                item,
                factors,
            })
            .filter(|scored| scored.score >= self.config.threshold)
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.config.max_items);
        ranked
    }

    fn weighted(&self, factors: ScoreFactors) -> f64 {
        factors.recency * self.config.recency_weight
            + factors.frequency * self.config.frequency_weight
            + factors.importance * self.config.importance_weight
            + factors.relevance * self.config.relevance_weight
            + factors.connections * self.config.connections_weight
    }
}

/// Linear decay over 24 hours: 1.0 now, 0.1 at a day or older.
fn recency_score(at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_secs = (now - at).num_seconds().max(0) as f64;
    let fraction = (age_secs / 86_400.0).min(1.0);
    1.0 - 0.9 * fraction
}

fn log_scale(count: usize, ceiling: f64) -> f64 {
    ((count as f64 + 1.0).log10() / ceiling.log10()).clamp(0.0, 1.0)
}

fn entity_importance(kind: EntityKind) -> f64 {
    match kind {
        EntityKind::Class => 0.9,
        EntityKind::Decision => 0.85,
        EntityKind::Function => 0.8,
        EntityKind::Bug => 0.8,
        EntityKind::Feature => 0.75,
        EntityKind::File => 0.7,
        EntityKind::Dependency => 0.65,
        EntityKind::Concept => 0.6,
        EntityKind::Config => 0.6,
        EntityKind::Person => 0.6,
        EntityKind::Tool => 0.5,
    }
}

fn decision_importance(decision: &KeyDecision, context: &RelevanceContext) -> f64 {
    let mut score: f64 = 0.5;
    match decision.impact {
        ImpactLevel::Critical => score += 0.3,
        ImpactLevel::High => score += 0.2,
        _ => {}
    }
    if decision.rationale.chars().count() > 100 {
        score += 0.2;
    }
    let title = decision.title.to_lowercase();
    if context
        .conversation_keywords
        .iter()
        .any(|keyword| title.contains(&keyword.to_lowercase()))
    {
        score += 0.1;
    }
    score.min(1.0)
}

/// Token-overlap ratio averaged over the context slots that were supplied;
/// 0.5 when no context is available at all.
fn context_overlap(text: &str, context: &RelevanceContext) -> f64 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0.0;
    }

    let mut slot_scores = Vec::new();
    if let Some(task) = &context.current_task {
        slot_scores.push(overlap_ratio(&tokens, &tokenize(task)));
    }
    if !context.active_files.is_empty() {
        slot_scores.push(overlap_ratio(
            &tokens,
            &tokenize(&context.active_files.join(" ")),
        ));
    }
    if !context.recent_topics.is_empty() {
        slot_scores.push(overlap_ratio(
            &tokens,
            &tokenize(&context.recent_topics.join(" ")),
        ));
    }
    if !context.conversation_keywords.is_empty() {
        slot_scores.push(overlap_ratio(
            &tokens,
            &tokenize(&context.conversation_keywords.join(" ")),
        ));
    }

    if slot_scores.is_empty() {
        return 0.5;
    }
    slot_scores.iter().sum::<f64>() / slot_scores.len() as f64
}

fn overlap_ratio(tokens: &BTreeSet<String>, other: &BTreeSet<String>) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    tokens.intersection(other).count() as f64 / tokens.len() as f64
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|token| token.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}
