pub mod collector;
pub mod error;
pub mod persister;
pub mod resumable;
pub mod snapshot;
pub mod validator;

pub use collector::{DataCollector, SessionData, SessionStatistics, TierEntries};
pub use error::CommitError;
pub use persister::{CommitPersister, LatestPointer, PersistOutcome, WalEntry, new_commit_id};
pub use resumable::{
    ColdContext, FormattedContext, HotContext, RecentMessage, ResumableContext,
    ResumableContextGenerator, TokenEstimates, WarmContext,
};
pub use snapshot::{CommitChecksums, CommitMetadata, SNAPSHOT_VERSION, SessionSnapshot};
pub use validator::{CommitValidator, ValidationIssue, ValidationReport};
