pub mod compiler;
pub mod error;
pub mod integrity;
pub mod loader;
pub mod prompt;
pub mod strategy;

pub use compiler::{CompiledContext, ContextCompiler, QualityReport, TokenCounts};
pub use error::ReloadError;
pub use integrity::{
    IntegrityChecker, IntegrityIssue, IntegrityReport, RecoveryAction, RecoveryOption,
};
pub use loader::{ContextLoader, ContextSource, LoadedContext};
pub use prompt::{PromptBuilder, PromptBundle, PromptMetadata, PromptSection};
pub use strategy::{ReloadMode, ReloadOptions, ReloadPlan, StateHistory, apply_strategy};
