//! Event records and filter/cursor types for streaming reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry in the append-only per-conversation log. `sequence` is globally
/// monotonic within the conversation and assigned at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub conversation_id: String,
    pub session_id: String,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub payload: serde_json::Value,
}

impl SessionEvent {
    pub fn new(
        kind: impl Into<String>,
        sequence: u64,
        conversation_id: impl Into<String>,
        session_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            timestamp: Utc::now(),
            sequence,
            conversation_id: conversation_id.into(),
            session_id: session_id.into(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Option<Vec<String>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_sequence: Option<u64>,
    pub end_sequence: Option<u64>,
    pub correlation_id: Option<String>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn matches(&self, event: &SessionEvent) -> bool {
        if let Some(kinds) = &self.kinds
            && !kinds.iter().any(|kind| kind == &event.kind)
        {
            return false;
        }
        if let Some(start) = self.start_time
            && event.timestamp < start
        {
            return false;
        }
        if let Some(end) = self.end_time
            && event.timestamp > end
        {
            return false;
        }
        if let Some(start) = self.start_sequence
            && event.sequence < start
        {
            return false;
        }
        if let Some(end) = self.end_sequence
            && event.sequence > end
        {
            return false;
        }
        if let Some(correlation) = &self.correlation_id
            && event.correlation_id.as_deref() != Some(correlation.as_str())
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCursor {
    pub last_sequence: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<SessionEvent>,
    pub cursor: EventCursor,
}
