pub mod engine;
pub mod options;

pub use engine::MemoryEngine;
pub use options::{
    CommitMode, CommitOptions, CommitOutcome, ConsolidateOutcome, EngineStats, ReloadOutcome,
    ReloadRequest, SessionReloadOutcome, VerifyOutcome,
};
