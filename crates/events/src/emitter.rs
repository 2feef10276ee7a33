//! In-process pub/sub for engine lifecycle notifications.
//!
//! Handlers are async closures registered per topic, plus a wildcard list
//! that sees everything. `emit` joins all handler futures to completion; a
//! handler returning an error is logged and never stops its peers. The
//! emitter is owned by the engine and passed explicitly; there is no global
//! instance.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use crate::event::SessionEvent;

pub type HandlerResult = Result<(), String>;
pub type Handler = Arc<
    dyn Fn(SessionEvent) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync,
>;

#[derive(Default)]
pub struct EventEmitter {
    topics: HashMap<String, Vec<Handler>>,
    wildcard: Vec<Handler>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, topic: impl Into<String>, handler: Handler) {
        self.topics.entry(topic.into()).or_default().push(handler);
    }

    /// Subscribe to every topic.
    pub fn on_any(&mut self, handler: Handler) {
        self.wildcard.push(handler);
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(Vec::len).unwrap_or(0) + self.wildcard.len()
    }

    /// Invoke all handlers for the event's kind plus wildcards, awaiting
    /// every one regardless of individual failures.
    pub async fn emit(&self, event: &SessionEvent) {
        let handlers: Vec<Handler> = self
            .topics
            .get(&event.kind)
            .into_iter()
            .flatten()
            .chain(self.wildcard.iter())
            .cloned()
            .collect();
        if handlers.is_empty() {
            return;
        }

        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler(event.clone())),
        )
        .await;

        for result in results {
            if let Err(reason) = result {
                warn!(kind = %event.kind, %reason, "event handler failed");
            }
        }
    }
}
