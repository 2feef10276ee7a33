//! Token-budgeted compilation of loaded context into prompt-ready Markdown.
//!
//! Compilation renders each tier with per-item length caps, then enforces
//! the token budget: the configured compression level is applied first
//! (light drops cold, moderate also trims warm to 60% of its lines,
//! aggressive hard-truncates warm to its budget), and a final enforcement
//! pass guarantees the compiled total never exceeds the budget.

use serde::Serialize;
use tracing::debug;

use recall_config::ReloadConfig;
use recall_memory::token_estimate;

use crate::loader::LoadedContext;

const SUMMARY_CAP: usize = 300;
const DECISION_CAP: usize = 100;
const ENTITY_CAP: usize = 80;
const FACT_CAP: usize = 100;

const DISPLAY_DECISIONS: usize = 10;
const DISPLAY_ENTITIES: usize = 15;
const DISPLAY_FACTS: usize = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenCounts {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityReport {
    pub score: f64,
    /// `none`, `minimal`, `moderate`, or `significant`.
    pub loss: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledContext {
    pub system_prompt: String,
    pub user_prompt: String,
    pub structured: serde_json::Value,
    pub token_count: TokenCounts,
    pub quality: QualityReport,
    pub compression_applied: bool,
}

pub struct ContextCompiler {
    config: ReloadConfig,
}

impl ContextCompiler {
    pub fn new(config: ReloadConfig) -> Self {
        Self { config }
    }

    pub fn compile(&self, loaded: &LoadedContext) -> CompiledContext {
        let hot_md = self.compile_hot(loaded);
        let mut warm_md = self.compile_warm(loaded);
        let mut cold_md = Some(self.compile_cold(loaded));

        let budget = self.config.max_token_budget.max(1);
        let mut warnings = Vec::new();
        let mut compression_applied = false;

        let total_of = |hot: &str, warm: &str, cold: &Option<String>| {
            token_estimate(hot)
                + token_estimate(warm)
                + cold.as_deref().map(token_estimate).unwrap_or(0)
        };

        if total_of(&hot_md, &warm_md, &cold_md) > budget && self.config.compression_enabled {
            compression_applied = true;
            let level = self.config.compression_level.as_str();

            // light and above: the cold tier goes first.
            cold_md = None;

            // moderate and above: keep only 60% of warm lines.
            if matches!(level, "moderate" | "aggressive")
                && total_of(&hot_md, &warm_md, &cold_md) > budget
            {
                let lines: Vec<&str> = warm_md.lines().collect();
                let keep = (lines.len() * 6).div_ceil(10);
                warm_md = lines[..keep.min(lines.len())].join("\n");
            }

            // aggressive: hard cap warm at its own budget.
            if level == "aggressive" && total_of(&hot_md, &warm_md, &cold_md) > budget {
                warm_md = truncate(&warm_md, self.config.warm_token_budget * 4);
            }

            warnings.push(format!("Applied {level} compression to fit budget"));
        }

        // Final enforcement: whatever the level, the compiled output never
        // exceeds the budget.
        let mut hot_md = hot_md;
        if self.config.compression_enabled
            && total_of(&hot_md, &warm_md, &cold_md) > budget
        {
            cold_md = None;
            let hot_tokens = token_estimate(&hot_md);
            if hot_tokens >= budget {
                hot_md = truncate(&hot_md, budget.saturating_sub(1) * 4);
                warm_md = String::new();
            } else {
                warm_md = truncate(&warm_md, (budget - hot_tokens).saturating_sub(1) * 4);
            }
        } else if total_of(&hot_md, &warm_md, &cold_md) > budget {
            warnings.push("Compiled context exceeds the token budget".to_string());
        }

        let token_count = TokenCounts {
            hot: token_estimate(&hot_md),
            warm: token_estimate(&warm_md),
            cold: cold_md.as_deref().map(token_estimate).unwrap_or(0),
            total: total_of(&hot_md, &warm_md, &cold_md),
        };

        let quality = self.quality(loaded, &token_count, budget, warnings);

        let mut system_prompt = hot_md;
        if !warm_md.is_empty() {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&warm_md);
        }
        if let Some(cold) = &cold_md {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(cold);
        }

        let user_prompt = match &loaded.hot.current_task {
            Some(task) => format!(
                "Continue working on: {task}.\nPick up exactly where the restored context leaves off."
            ),
            None => "Continue the session using the restored context above.".to_string(),
        };

        let structured = serde_json::json!({
            "source": loaded.source,
            "version": loaded.version,
            "integrity_status": loaded.integrity_status,
            "current_task": loaded.hot.current_task,
            "last_turn_number": loaded.hot.last_turn_number,
            "decisions": loaded.warm.recent_decisions,
            "entities": loaded.warm.active_entities,
            "facts": loaded.warm.key_facts,
            "files": loaded.warm.files_modified,
        });

        debug!(
            total = token_count.total,
            budget,
            compression_applied,
            quality = quality.score,
            "context compiled"
        );

        CompiledContext {
            system_prompt,
            user_prompt,
            structured,
            token_count,
            quality,
            compression_applied,
        }
    }

    fn compile_hot(&self, loaded: &LoadedContext) -> String {
        let hot = &loaded.hot;
        let mut rendered = String::from("## Session Resume Context (Hot)\n");
        if let Some(task) = &hot.current_task {
            rendered.push_str(&format!(
                "\n**Current task**: {task} ({})\n",
                hot.task_status.as_deref().unwrap_or("unknown")
            ));
        }
        if let Some(message) = &hot.last_user_message {
            rendered.push_str(&format!("\n**Last user message**: {message}\n"));
        }
        if let Some(message) = &hot.last_assistant_message {
            rendered.push_str(&format!("\n**Last assistant message**: {message}\n"));
        }
        for recent in &hot.recent_messages {
            rendered.push_str(&format!("- [{}] {}\n", recent.role, recent.content));
        }
        if !hot.active_files.is_empty() {
            rendered.push_str("\n**Active files**:\n");
            for file in &hot.active_files {
                rendered.push_str(&format!("- {file}\n"));
            }
        }
        rendered
    }

    fn compile_warm(&self, loaded: &LoadedContext) -> String {
        let warm = &loaded.warm;
        let mut rendered = String::from("## Session Context (Warm)\n");
        if !warm.session_summary.is_empty() {
            rendered.push_str(&format!(
                "\n**Summary**: {}\n",
                truncate(&warm.session_summary, SUMMARY_CAP)
            ));
        }
        if !warm.recent_decisions.is_empty() {
            rendered.push_str("\n**Decisions**:\n");
            for decision in warm.recent_decisions.iter().take(DISPLAY_DECISIONS) {
                rendered.push_str(&format!("- {}\n", truncate(decision, DECISION_CAP)));
            }
        }
        if !warm.active_entities.is_empty() {
            rendered.push_str("\n**Entities**:\n");
            for entity in warm.active_entities.iter().take(DISPLAY_ENTITIES) {
                rendered.push_str(&format!("- {}\n", truncate(entity, ENTITY_CAP)));
            }
        }
        if !warm.key_facts.is_empty() {
            rendered.push_str("\n**Facts**:\n");
            for fact in warm.key_facts.iter().take(DISPLAY_FACTS) {
                rendered.push_str(&format!("- {}\n", truncate(fact, FACT_CAP)));
            }
        }
        if !warm.resolved_errors.is_empty() {
            rendered.push_str("\n**Known errors**:\n");
            for error in &warm.resolved_errors {
                rendered.push_str(&format!("- {error}\n"));
            }
        }
        if !warm.files_modified.is_empty() {
            rendered.push_str("\n**Files modified**:\n");
            for file in &warm.files_modified {
                rendered.push_str(&format!("- {file}\n"));
            }
        }
        rendered
    }

    fn compile_cold(&self, loaded: &LoadedContext) -> String {
        let cold = &loaded.cold;
        format!(
            "## Archive References (Cold)\n\n- Commit: {}\n- Snapshot: {}\n\
             - Entity index: {}\n- Decision log: {}\n- Total messages: {}\n",
            cold.commit_id,
            cold.snapshot_path,
            cold.entity_index_path,
            cold.decision_log_path,
            cold.total_messages
        )
    }

    fn quality(
        &self,
        loaded: &LoadedContext,
        tokens: &TokenCounts,
        budget: usize,
        warnings: Vec<String>,
    ) -> QualityReport {
        let mut score: f64 = 1.0;

        if loaded.hot.current_task.is_none() {
            score -= 0.2;
        }
        score -= overflow_penalty(loaded.warm.recent_decisions.len(), DISPLAY_DECISIONS);
        score -= overflow_penalty(loaded.warm.active_entities.len(), DISPLAY_ENTITIES);
        score -= overflow_penalty(loaded.warm.key_facts.len(), DISPLAY_FACTS);

        let utilization = tokens.total as f64 / budget as f64;
        if utilization > 0.95 {
            score -= 0.1;
        }

        let score = score.clamp(0.0, 1.0);
        let loss = if score >= 0.95 {
            "none"
        } else if score >= 0.85 {
            "minimal"
        } else if score >= 0.70 {
            "moderate"
        } else {
            "significant"
        };

        QualityReport {
            score,
            loss: loss.to_string(),
            warnings,
        }
    }
}

fn overflow_penalty(count: usize, cap: usize) -> f64 {
    if count <= cap {
        return 0.0;
    }
    let ratio = (count - cap) as f64 / cap as f64;
    0.05 * ratio.min(1.0)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use recall_commit::{ColdContext, HotContext, WarmContext};

    use super::*;
    use crate::loader::{ContextSource, LoadedContext, LoadedTokenEstimates};

    fn loaded(warm_facts: usize, fact_len: usize) -> LoadedContext {
        LoadedContext {
            hot: HotContext {
                current_task: Some("finish the compiler".into()),
                task_status: Some("active".into()),
                last_user_message: Some("keep going".into()),
                ..Default::default()
            },
            warm: WarmContext {
                session_summary: "working through the budget logic".into(),
                key_facts: (0..warm_facts)
                    .map(|i| format!("fact {i} {}", "x".repeat(fact_len)))
                    .collect(),
                ..Default::default()
            },
            cold: ColdContext {
                commit_id: "commit-1-aa".into(),
                snapshot_path: "archives/snapshot-commit-1-aa.json".into(),
                ..Default::default()
            },
            source: ContextSource::Context,
            version: "2.0.0".into(),
            integrity_status: "ok".into(),
            token_estimates: LoadedTokenEstimates::default(),
        }
    }

    fn config(budget: usize, level: &str) -> ReloadConfig {
        ReloadConfig {
            max_token_budget: budget,
            compression_level: level.into(),
            ..Default::default()
        }
    }

    #[test]
    fn small_contexts_compile_without_compression() {
        let compiled = ContextCompiler::new(config(4000, "moderate")).compile(&loaded(3, 10));
        assert!(!compiled.compression_applied);
        assert!(compiled.token_count.total <= 4000);
        assert!(compiled.token_count.cold > 0);
        assert!(compiled.system_prompt.contains("(Hot)"));
        assert!(compiled.system_prompt.contains("(Warm)"));
        assert!(compiled.user_prompt.contains("finish the compiler"));
        assert_eq!(compiled.quality.loss, "none");
    }

    fn with_bulky_errors(mut context: LoadedContext) -> LoadedContext {
        context.warm.resolved_errors = (0..20)
            .map(|i| format!("error {i}: {}", "stack ".repeat(70)))
            .collect();
        context
    }

    #[test]
    fn oversized_warm_tier_is_compressed_under_budget() {
        // Raw warm tier far beyond the budget.
        let context = with_bulky_errors(loaded(10, 200));
        let compiled = ContextCompiler::new(config(500, "moderate")).compile(&context);
        assert!(compiled.compression_applied);
        assert!(
            compiled.token_count.total <= 500,
            "total {} over budget",
            compiled.token_count.total
        );
        assert_eq!(compiled.token_count.cold, 0);
        assert!(compiled
            .quality
            .warnings
            .iter()
            .any(|w| w.contains("compression to fit budget")));
    }

    #[test]
    fn aggressive_compression_caps_warm_at_its_budget() {
        let mut cfg = config(300, "aggressive");
        cfg.warm_token_budget = 100;
        let context = with_bulky_errors(loaded(10, 200));
        let compiled = ContextCompiler::new(cfg).compile(&context);
        assert!(compiled.compression_applied);
        assert!(compiled.token_count.warm <= 100);
        assert!(compiled.token_count.total <= 300);
    }

    #[test]
    fn missing_task_lowers_quality() {
        let mut context = loaded(1, 10);
        context.hot.current_task = None;
        let compiled = ContextCompiler::new(config(4000, "moderate")).compile(&context);
        assert!(compiled.quality.score <= 0.8);
        assert_ne!(compiled.quality.loss, "none");
        assert!(compiled.user_prompt.contains("restored context"));
    }

    #[test]
    fn disabled_compression_warns_instead_of_truncating() {
        let mut cfg = config(100, "moderate");
        cfg.compression_enabled = false;
        let compiled =
            ContextCompiler::new(cfg).compile(&with_bulky_errors(loaded(10, 200)));
        assert!(!compiled.compression_applied);
        assert!(compiled.token_count.total > 100);
        assert!(compiled
            .quality
            .warnings
            .iter()
            .any(|w| w.contains("exceeds the token budget")));
    }
}
