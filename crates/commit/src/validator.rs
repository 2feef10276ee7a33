//! Structural and referential validation plus content hashing for commits.
//!
//! Per-message hashes act as Merkle leaves: the messages component hash is
//! computed over the ordered leaf hashes, so any single-message change
//! changes the component hash, which changes the global hash.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use recall_store::{checksum_bytes, checksum_of, checksum_value};

use crate::collector::SessionData;
use crate::error::CommitError;
use crate::snapshot::CommitChecksums;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub message: String,
}

impl ValidationIssue {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.message.contains("CRITICAL")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Strict mode fails on any error; lenient mode only on CRITICAL ones.
    pub fn passes(&self, strict: bool) -> bool {
        if strict {
            self.errors.is_empty()
        } else {
            !self.errors.iter().any(ValidationIssue::is_critical)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommitValidator;

impl CommitValidator {
    pub fn new() -> Self {
        Self
    }

    // ── hashing ──────────────────────────────────────────────────────────

    /// Per-message Merkle leaves feeding the messages component hash.
    pub fn message_leaf_hashes(&self, data: &SessionData) -> Result<Vec<String>, CommitError> {
        data.messages
            .iter()
            .map(|message| checksum_of(message).map_err(CommitError::from))
            .collect()
    }

    pub fn calculate_all_checksums(
        &self,
        data: &SessionData,
    ) -> Result<CommitChecksums, CommitError> {
        let mut components = BTreeMap::new();

        let leaves = self.message_leaf_hashes(data)?;
        components.insert(
            "messages".to_string(),
            checksum_bytes(leaves.join("").as_bytes()),
        );
        components.insert("tool_calls".to_string(), checksum_of(&data.tool_calls)?);
        components.insert("tool_outputs".to_string(), checksum_of(&data.tool_outputs)?);
        components.insert("file_changes".to_string(), checksum_of(&data.file_changes)?);
        components.insert("entities".to_string(), checksum_of(&data.entities)?);
        components.insert(
            "relationships".to_string(),
            checksum_of(&data.relationships)?,
        );
        components.insert("decisions".to_string(), checksum_of(&data.decisions)?);
        components.insert("facts".to_string(), checksum_of(&data.facts)?);
        components.insert("summary".to_string(), checksum_of(&data.summary)?);
        components.insert(
            "project_state".to_string(),
            checksum_value(&data.project_state),
        );
        components.insert("task_state".to_string(), checksum_value(&data.task_state));

        let global = checksum_value(&serde_json::json!({
            "conversation_id": data.conversation_id,
            "session_id": data.session_id,
            "message_count": data.messages.len(),
            "components": components,
        }));

        debug!(components = components.len(), "checksums calculated");
        Ok(CommitChecksums { components, global })
    }

    // ── validation ───────────────────────────────────────────────────────

    pub fn validate(&self, data: &SessionData) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.validate_identity(data, &mut report);
        self.validate_messages(data, &mut report);
        self.validate_entities(data, &mut report);
        self.validate_references(data, &mut report);
        self.validate_consistency(data, &mut report);

        debug!(
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "validation complete"
        );
        report
    }

    fn validate_identity(&self, data: &SessionData, report: &mut ValidationReport) {
        if data.conversation_id.is_empty() {
            report
                .errors
                .push(ValidationIssue::new("CRITICAL: conversation_id is missing"));
        }
        if data.session_id.is_empty() {
            report
                .errors
                .push(ValidationIssue::new("CRITICAL: session_id is missing"));
        }
    }

    fn validate_messages(&self, data: &SessionData, report: &mut ValidationReport) {
        let mut seen_ids = HashSet::new();
        let mut previous_turn = 0u32;

        for (index, message) in data.messages.iter().enumerate() {
            if message.id.is_empty() {
                report
                    .errors
                    .push(ValidationIssue::new(format!("message {index} has no id")));
            }
            if message.content.is_empty() {
                report.errors.push(ValidationIssue::new(format!(
                    "message {index} has empty content"
                )));
            }
            if !message.id.is_empty() && !seen_ids.insert(message.id.clone()) {
                report.errors.push(ValidationIssue::new(format!(
                    "duplicate message id '{}'",
                    message.id
                )));
            }
            if message.turn_number < previous_turn {
                report.warnings.push(format!(
                    "turn numbers decrease at message {index} ({} after {previous_turn})",
                    message.turn_number
                ));
            }
            previous_turn = message.turn_number;
        }
    }

    fn validate_entities(&self, data: &SessionData, report: &mut ValidationReport) {
        let mut seen_ids = HashSet::new();
        for entity in &data.entities {
            if entity.id.is_empty() || entity.name.is_empty() {
                report.errors.push(ValidationIssue::new(format!(
                    "entity '{}' is missing required fields",
                    entity.id
                )));
            }
            if !entity.id.is_empty() && !seen_ids.insert(entity.id.clone()) {
                report
                    .warnings
                    .push(format!("duplicate entity id '{}'", entity.id));
            }
            if entity.mentions.is_empty() {
                report
                    .warnings
                    .push(format!("entity '{}' has no mentions", entity.name));
            }
        }
    }

    fn validate_references(&self, data: &SessionData, report: &mut ValidationReport) {
        let turns: HashSet<u32> = data.messages.iter().map(|m| m.turn_number).collect();
        let call_ids: HashSet<&str> = data.tool_calls.iter().map(|c| c.id.as_str()).collect();

        for entity in &data.entities {
            for mention in &entity.mentions {
                if !turns.contains(&mention.turn_number) {
                    report.errors.push(ValidationIssue::new(format!(
                        "entity '{}' mentions unknown turn {}",
                        entity.name, mention.turn_number
                    )));
                }
            }
        }
        for decision in &data.decisions {
            if !turns.contains(&decision.turn_number) {
                report.errors.push(ValidationIssue::new(format!(
                    "decision '{}' references unknown turn {}",
                    decision.title, decision.turn_number
                )));
            }
        }
        for output in &data.tool_outputs {
            if !call_ids.contains(output.tool_call_id.as_str()) {
                report.errors.push(ValidationIssue::new(format!(
                    "tool output references unknown call '{}'",
                    output.tool_call_id
                )));
            }
        }
    }

    fn validate_consistency(&self, data: &SessionData, report: &mut ValidationReport) {
        if data.statistics.message_count != data.messages.len() {
            report.errors.push(ValidationIssue::new(format!(
                "statistics claim {} messages but {} are present",
                data.statistics.message_count,
                data.messages.len()
            )));
        }
        if data.statistics.tool_call_count != data.tool_calls.len() {
            report.warnings.push(format!(
                "statistics claim {} tool calls but {} are present",
                data.statistics.tool_call_count,
                data.tool_calls.len()
            ));
        }
        if data.statistics.entity_count != data.entities.len() {
            report.warnings.push(format!(
                "statistics claim {} entities but {} are present",
                data.statistics.entity_count,
                data.entities.len()
            ));
        }
    }
}
