//! Final prompt assembly from loaded + compiled context.
//!
//! Sections follow a canonical order so resumed sessions always read the
//! same way: TL;DR, Current Task, Recent Decisions, Active Entities, Pending
//! Actions, Known Issues, References.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use recall_memory::token_estimate;

use crate::compiler::CompiledContext;
use crate::loader::LoadedContext;

#[derive(Debug, Clone, Serialize)]
pub struct PromptSection {
    pub title: String,
    pub content: String,
    pub tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptMetadata {
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub version: String,
    pub token_total: usize,
    pub compression_applied: bool,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptBundle {
    pub full_prompt: String,
    pub sections: Vec<PromptSection>,
    pub token_breakdown: BTreeMap<String, usize>,
    pub metadata: PromptMetadata,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, loaded: &LoadedContext, compiled: &CompiledContext) -> PromptBundle {
        let mut sections = Vec::new();

        sections.push(section("TL;DR", self.tldr(loaded)));
        if let Some(task) = &loaded.hot.current_task {
            sections.push(section(
                "Current Task",
                format!(
                    "{task} ({})",
                    loaded.hot.task_status.as_deref().unwrap_or("unknown")
                ),
            ));
        }
        if !loaded.warm.recent_decisions.is_empty() {
            sections.push(section(
                "Recent Decisions",
                bullet_list(&loaded.warm.recent_decisions),
            ));
        }
        if !loaded.warm.active_entities.is_empty() {
            sections.push(section(
                "Active Entities",
                bullet_list(&loaded.warm.active_entities),
            ));
        }

        let pending = self.pending_actions(loaded);
        if !pending.is_empty() {
            sections.push(section("Pending Actions", bullet_list(&pending)));
        }
        if !loaded.warm.resolved_errors.is_empty() {
            sections.push(section(
                "Known Issues",
                bullet_list(&loaded.warm.resolved_errors),
            ));
        }
        sections.push(section("References", self.references(loaded)));

        let full_prompt = sections
            .iter()
            .map(|s| format!("## {}\n\n{}", s.title, s.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut token_breakdown: BTreeMap<String, usize> = sections
            .iter()
            .map(|s| (s.title.clone(), s.tokens))
            .collect();
        let token_total = token_estimate(&full_prompt);
        token_breakdown.insert("total".to_string(), token_total);

        PromptBundle {
            full_prompt,
            sections,
            token_breakdown,
            metadata: PromptMetadata {
                generated_at: Utc::now(),
                source: format!("{:?}", loaded.source).to_lowercase(),
                version: loaded.version.clone(),
                token_total,
                compression_applied: compiled.compression_applied,
                quality_score: compiled.quality.score,
            },
        }
    }

    fn tldr(&self, loaded: &LoadedContext) -> String {
        let mut parts = Vec::new();
        if !loaded.warm.session_summary.is_empty() {
            parts.push(loaded.warm.session_summary.clone());
        }
        if let Some(message) = &loaded.hot.last_user_message {
            parts.push(format!("Last request: {message}"));
        }
        if parts.is_empty() {
            parts.push(format!(
                "Resumed session at turn {} from {} source.",
                loaded.hot.last_turn_number, loaded.integrity_status
            ));
        }
        parts.join("\n\n")
    }

    /// Pending work comes from the task state plus any recent-context line
    /// that mentions an open item.
    fn pending_actions(&self, loaded: &LoadedContext) -> Vec<String> {
        let mut pending = Vec::new();
        if let Some(task) = &loaded.hot.current_task {
            let status = loaded.hot.task_status.as_deref().unwrap_or_default();
            if status != "done" && status != "completed" {
                pending.push(format!("Resume: {task}"));
            }
        }
        for recent in &loaded.hot.recent_messages {
            let lower = recent.content.to_lowercase();
            if lower.contains("todo") || lower.contains("next") || lower.contains("pending") {
                pending.push(recent.content.clone());
            }
        }
        pending
    }

    fn references(&self, loaded: &LoadedContext) -> String {
        let cold = &loaded.cold;
        format!(
            "- Commit: {}\n- Snapshot: {}\n- Entity index: {}\n- Decision log: {}\n\
             - Messages archived: {}\n- Entities tracked: {}",
            cold.commit_id,
            cold.snapshot_path,
            cold.entity_index_path,
            cold.decision_log_path,
            cold.total_messages,
            cold.total_entities
        )
    }
}

fn section(title: &str, content: String) -> PromptSection {
    PromptSection {
        title: title.to_string(),
        tokens: token_estimate(&content),
        content,
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use recall_commit::{ColdContext, HotContext, RecentMessage, WarmContext};
    use recall_config::ReloadConfig;

    use super::*;
    use crate::compiler::ContextCompiler;
    use crate::loader::{ContextSource, LoadedTokenEstimates};

    fn loaded() -> LoadedContext {
        LoadedContext {
            hot: HotContext {
                current_task: Some("port the scheduler".into()),
                task_status: Some("in_progress".into()),
                last_user_message: Some("carry on with the port".into()),
                recent_messages: vec![RecentMessage {
                    role: "assistant".into(),
                    content: "TODO: revisit the retry backoff".into(),
                }],
                ..Default::default()
            },
            warm: WarmContext {
                session_summary: "Porting the scheduler to the new runtime.".into(),
                recent_decisions: vec!["use a single worker".into()],
                active_entities: vec!["Scheduler".into()],
                resolved_errors: vec!["error: missed tick deadline".into()],
                ..Default::default()
            },
            cold: ColdContext {
                commit_id: "commit-7-xy".into(),
                snapshot_path: "archives/snapshot-commit-7-xy.json".into(),
                entity_index_path: "knowledge/entities.json".into(),
                decision_log_path: "summaries/decisions.json".into(),
                total_messages: 12,
                total_entities: 4,
                ..Default::default()
            },
            source: ContextSource::Context,
            version: "2.0.0".into(),
            integrity_status: "ok".into(),
            token_estimates: LoadedTokenEstimates::default(),
        }
    }

    fn build(context: &LoadedContext) -> PromptBundle {
        let compiled = ContextCompiler::new(ReloadConfig::default()).compile(context);
        PromptBuilder::new().build(context, &compiled)
    }

    #[test]
    fn sections_appear_in_canonical_order() {
        let bundle = build(&loaded());
        let titles: Vec<&str> = bundle.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "TL;DR",
                "Current Task",
                "Recent Decisions",
                "Active Entities",
                "Pending Actions",
                "Known Issues",
                "References"
            ]
        );
    }

    #[test]
    fn pending_actions_collect_task_and_todo_lines() {
        let bundle = build(&loaded());
        let pending = bundle
            .sections
            .iter()
            .find(|s| s.title == "Pending Actions")
            .expect("pending section");
        assert!(pending.content.contains("Resume: port the scheduler"));
        assert!(pending.content.contains("TODO: revisit the retry backoff"));
    }

    #[test]
    fn token_breakdown_includes_every_section_and_a_total() {
        let bundle = build(&loaded());
        for section in &bundle.sections {
            assert_eq!(bundle.token_breakdown[&section.title], section.tokens);
        }
        assert!(bundle.token_breakdown["total"] > 0);
        assert_eq!(bundle.metadata.token_total, bundle.token_breakdown["total"]);
        assert_eq!(bundle.metadata.source, "context");
        assert_eq!(bundle.metadata.version, "2.0.0");
    }

    #[test]
    fn empty_context_still_produces_tldr_and_references() {
        let context = LoadedContext {
            hot: HotContext::default(),
            warm: WarmContext::default(),
            cold: ColdContext::default(),
            source: ContextSource::Snapshot,
            version: "2.0.0".into(),
            integrity_status: "recovered".into(),
            token_estimates: LoadedTokenEstimates::default(),
        };
        let bundle = build(&context);
        let titles: Vec<&str> = bundle.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["TL;DR", "References"]);
        assert!(bundle.full_prompt.contains("recovered"));
        assert_eq!(bundle.metadata.source, "snapshot");
    }
}
