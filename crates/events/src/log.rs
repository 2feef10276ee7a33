//! Append-only, segmented event log.
//!
//! Events buffer in memory and flush to `events/segment-<epoch_ms>.json`
//! when the buffer reaches the flush threshold, when a batch append
//! completes, or when the engine's flush timer fires. A segment receives
//! events until it holds `events_per_segment`, then the log rolls over to a
//! fresh segment; closed segments are never rewritten and are only removed
//! whole by retention.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use recall_config::EventLogConfig;
use recall_store::{ConversationLayout, FileStore};

use crate::error::EventLogError;
use crate::event::{EventBatch, EventCursor, EventFilter, SessionEvent};

const NOTIFIER_CAPACITY: usize = 256;

pub struct EventLog {
    store: FileStore,
    layout: ConversationLayout,
    session_id: String,
    config: EventLogConfig,
    next_sequence: u64,
    buffer: Vec<SessionEvent>,
    current_segment_id: Option<i64>,
    current_segment_events: Vec<SessionEvent>,
    last_segment_id: i64,
    notifier: broadcast::Sender<SessionEvent>,
}

impl EventLog {
    /// Open the log for a conversation, resuming sequence numbering from the
    /// highest persisted event.
    pub async fn open(
        store: FileStore,
        layout: ConversationLayout,
        session_id: impl Into<String>,
        config: EventLogConfig,
    ) -> Result<Self, EventLogError> {
        let mut next_sequence = 1;
        let mut last_segment_id = 0;

        for path in layout.list_segments().await? {
            if let Some(id) = segment_id_of(&path) {
                last_segment_id = last_segment_id.max(id);
            }
            if let Some(events) = store.read_json::<Vec<SessionEvent>>(&path).await? {
                for event in events {
                    next_sequence = next_sequence.max(event.sequence + 1);
                }
            }
        }

        info!(
            conversation = layout.conversation_id(),
            next_sequence, "event log opened"
        );
        let (notifier, _) = broadcast::channel(NOTIFIER_CAPACITY);
        Ok(Self {
            store,
            layout,
            session_id: session_id.into(),
            config,
            next_sequence,
            buffer: Vec::new(),
            current_segment_id: None,
            current_segment_events: Vec::new(),
            last_segment_id,
            notifier,
        })
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append one event. Suspends only when the buffer reaches the flush
    /// threshold and a flush is triggered.
    pub async fn append(
        &mut self,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<SessionEvent, EventLogError> {
        let event = self.make_event(kind.into(), payload, None);
        self.buffer.push(event.clone());
        if self.buffer.len() >= self.config.flush_threshold {
            self.flush().await?;
        }
        Ok(event)
    }

    pub async fn append_correlated(
        &mut self,
        kind: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Result<SessionEvent, EventLogError> {
        let event = self.make_event(kind.into(), payload, Some(correlation_id.into()));
        self.buffer.push(event.clone());
        if self.buffer.len() >= self.config.flush_threshold {
            self.flush().await?;
        }
        Ok(event)
    }

    /// Append several events with consecutive sequences and flush them
    /// together.
    pub async fn append_batch(
        &mut self,
        items: Vec<(String, serde_json::Value)>,
    ) -> Result<Vec<SessionEvent>, EventLogError> {
        let mut appended = Vec::with_capacity(items.len());
        for (kind, payload) in items {
            let event = self.make_event(kind, payload, None);
            self.buffer.push(event.clone());
            appended.push(event);
        }
        self.flush().await?;
        Ok(appended)
    }

    fn make_event(
        &mut self,
        kind: String,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> SessionEvent {
        let mut event = SessionEvent::new(
            kind,
            self.next_sequence,
            self.layout.conversation_id(),
            self.session_id.clone(),
            payload,
        );
        event.correlation_id = correlation_id;
        self.next_sequence += 1;
        // Nobody listening is fine.
        let _ = self.notifier.send(event.clone());
        event
    }

    /// Move buffered events into the current segment and persist it, rolling
    /// over to new segments as they fill.
    pub async fn flush(&mut self) -> Result<(), EventLogError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let drained: Vec<SessionEvent> = self.buffer.drain(..).collect();
        let flushed = drained.len();
        for event in drained {
            if self.current_segment_id.is_none() {
                self.start_segment();
            }
            self.current_segment_events.push(event);
            if self.current_segment_events.len() >= self.config.events_per_segment {
                self.write_current_segment().await?;
                self.current_segment_id = None;
                self.current_segment_events.clear();
            }
        }

        if self.current_segment_id.is_some() && !self.current_segment_events.is_empty() {
            self.write_current_segment().await?;
        }

        debug!(events = flushed, "event log flushed");
        Ok(())
    }

    fn start_segment(&mut self) {
        let mut id = Utc::now().timestamp_millis();
        if id <= self.last_segment_id {
            id = self.last_segment_id + 1;
        }
        self.last_segment_id = id;
        self.current_segment_id = Some(id);
    }

    async fn write_current_segment(&self) -> Result<(), EventLogError> {
        let id = self.current_segment_id.expect("segment started");
        self.store
            .write_json(self.layout.segment_file(id), &self.current_segment_events)
            .await?;
        Ok(())
    }

    /// Scan all segments plus unflushed events, apply the filter, and return
    /// matches sorted by sequence.
    pub async fn get_events(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<SessionEvent>, EventLogError> {
        let mut matched = Vec::new();

        for path in self.layout.list_segments().await? {
            // The current segment lives in memory; skip its file to avoid
            // duplicates.
            if segment_id_of(&path) == self.current_segment_id {
                continue;
            }
            if let Some(events) = self.store.read_json::<Vec<SessionEvent>>(&path).await? {
                matched.extend(events.into_iter().filter(|event| filter.matches(event)));
            }
        }

        matched.extend(
            self.current_segment_events
                .iter()
                .chain(self.buffer.iter())
                .filter(|event| filter.matches(event))
                .cloned(),
        );

        matched.sort_by_key(|event| event.sequence);
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Cursor-based read: at most `batch_size` events plus a cursor for the
    /// next call.
    pub async fn stream_events(
        &self,
        filter: &EventFilter,
        batch_size: usize,
    ) -> Result<EventBatch, EventLogError> {
        let mut unlimited = filter.clone();
        unlimited.limit = None;
        let all = self.get_events(&unlimited).await?;

        let has_more = all.len() > batch_size;
        let events: Vec<SessionEvent> = all.into_iter().take(batch_size).collect();
        let cursor = EventCursor {
            last_sequence: events.last().map(|e| e.sequence).unwrap_or_default(),
            last_timestamp: events.last().map(|e| e.timestamp),
            has_more,
        };
        Ok(EventBatch { events, cursor })
    }

    /// Delete every closed segment whose events are all older than the
    /// retention window. Returns the number of segments removed.
    pub async fn apply_retention(&mut self) -> Result<usize, EventLogError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let mut removed = 0;

        for path in self.layout.list_segments().await? {
            if segment_id_of(&path) == self.current_segment_id {
                continue;
            }
            let Some(events) = self.store.read_json::<Vec<SessionEvent>>(&path).await? else {
                continue;
            };
            if !events.is_empty() && events.iter().all(|event| event.timestamp < cutoff) {
                self.store.remove_if_exists(&path).await?;
                removed += 1;
                debug!(segment = %path.display(), "retention removed segment");
            }
        }

        if removed > 0 {
            info!(segments = removed, "event retention applied");
        }
        Ok(removed)
    }

    /// Await the next event of `kind`, failing with a timeout error when none
    /// arrives in time. The subscription is dropped either way.
    pub async fn wait_for(
        &self,
        kind: &str,
        timeout: Duration,
    ) -> Result<SessionEvent, EventLogError> {
        let mut receiver = self.notifier.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Ok(event)) if event.kind == kind => return Ok(event),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return Err(EventLogError::Timeout {
                        kind: kind.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), EventLogError> {
        self.flush().await
    }
}

fn segment_id_of(path: &std::path::Path) -> Option<i64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("segment-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;

    async fn open_log(base: &std::path::Path, config: EventLogConfig) -> Result<EventLog> {
        let store = FileStore::default();
        let layout = ConversationLayout::new(base, "conv");
        layout.ensure().await?;
        Ok(EventLog::open(store, layout, "sess", config).await?)
    }

    fn small_config() -> EventLogConfig {
        EventLogConfig {
            events_per_segment: 5,
            flush_threshold: 3,
            flush_interval_ms: 5000,
            retention_days: 7,
        }
    }

    #[tokio::test]
    async fn sequences_increase_strictly_in_append_order() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut log = open_log(tmp.path(), small_config()).await?;

        let mut sequences = Vec::new();
        for i in 0..7 {
            let event = log
                .append("entry.added", serde_json::json!({ "n": i }))
                .await?;
            sequences.push(event.sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6, 7]);

        let events = log.get_events(&EventFilter::default()).await?;
        assert_eq!(events.len(), 7);
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        Ok(())
    }

    #[tokio::test]
    async fn batch_appends_take_consecutive_sequences() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut log = open_log(tmp.path(), small_config()).await?;

        log.append("warmup", serde_json::json!({})).await?;
        let batch = log
            .append_batch(vec![
                ("commit.prepare".into(), serde_json::json!({})),
                ("commit.snapshot".into(), serde_json::json!({})),
                ("commit.complete".into(), serde_json::json!({})),
            ])
            .await?;

        let sequences: Vec<u64> = batch.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn sequence_numbering_survives_reopen() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        {
            let mut log = open_log(tmp.path(), small_config()).await?;
            for _ in 0..4 {
                log.append("entry.added", serde_json::json!({})).await?;
            }
            log.shutdown().await?;
        }

        let mut reopened = open_log(tmp.path(), small_config()).await?;
        let event = reopened.append("entry.added", serde_json::json!({})).await?;
        assert_eq!(event.sequence, 5);
        Ok(())
    }

    #[tokio::test]
    async fn segments_roll_over_at_capacity() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut log = open_log(tmp.path(), small_config()).await?;

        for _ in 0..12 {
            log.append("tick", serde_json::json!({})).await?;
        }
        log.shutdown().await?;

        let layout = ConversationLayout::new(tmp.path(), "conv");
        let segments = layout.list_segments().await?;
        assert!(segments.len() >= 2, "expected rollover, got {segments:?}");

        let store = FileStore::default();
        for path in &segments {
            let events: Vec<SessionEvent> = store.read_json(path).await?.unwrap();
            assert!(events.len() <= 5);
        }
        Ok(())
    }

    #[tokio::test]
    async fn filters_restrict_by_kind_and_sequence() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut log = open_log(tmp.path(), small_config()).await?;
        for i in 0..6 {
            let kind = if i % 2 == 0 { "even" } else { "odd" };
            log.append(kind, serde_json::json!({})).await?;
        }

        let events = log
            .get_events(&EventFilter {
                kinds: Some(vec!["even".into()]),
                start_sequence: Some(3),
                ..Default::default()
            })
            .await?;
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn streaming_pages_through_with_a_cursor() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut log = open_log(tmp.path(), small_config()).await?;
        for _ in 0..9 {
            log.append("tick", serde_json::json!({})).await?;
        }

        let first = log.stream_events(&EventFilter::default(), 4).await?;
        assert_eq!(first.events.len(), 4);
        assert!(first.cursor.has_more);
        assert_eq!(first.cursor.last_sequence, 4);

        let second = log
            .stream_events(
                &EventFilter {
                    start_sequence: Some(first.cursor.last_sequence + 1),
                    ..Default::default()
                },
                4,
            )
            .await?;
        assert_eq!(second.events.len(), 4);
        assert!(second.cursor.has_more);

        let third = log
            .stream_events(
                &EventFilter {
                    start_sequence: Some(second.cursor.last_sequence + 1),
                    ..Default::default()
                },
                4,
            )
            .await?;
        assert_eq!(third.events.len(), 1);
        assert!(!third.cursor.has_more);
        Ok(())
    }

    #[tokio::test]
    async fn retention_deletes_only_fully_expired_segments() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = FileStore::default();
        let layout = ConversationLayout::new(tmp.path(), "conv");
        layout.ensure().await?;

        // A closed segment wholly past the retention window.
        let mut stale = SessionEvent::new("old", 1, "conv", "sess", serde_json::json!({}));
        stale.timestamp = Utc::now() - ChronoDuration::days(30);
        store
            .write_json(layout.segment_file(1000), &vec![stale])
            .await?;

        let mut log = open_log(tmp.path(), small_config()).await?;
        log.append("fresh", serde_json::json!({})).await?;
        log.flush().await?;

        let removed = log.apply_retention().await?;
        assert_eq!(removed, 1);

        let remaining = log.get_events(&EventFilter::default()).await?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, "fresh");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out_with_an_error() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let log = open_log(tmp.path(), small_config()).await?;

        let result = log.wait_for("never.sent", Duration::from_millis(50)).await;
        match result {
            Err(EventLogError::Timeout { kind, .. }) => {
                assert_eq!(kind, "never.sent");
                Ok(())
            }
            other => anyhow::bail!("expected timeout, got {other:?}"),
        }
    }
}
