pub mod emitter;
pub mod error;
pub mod event;
pub mod log;

pub use emitter::EventEmitter;
pub use error::EventLogError;
pub use event::{EventBatch, EventCursor, EventFilter, SessionEvent};
pub use log::EventLog;
