//! # Deckflow - Presentation Generation Workflow
//!
//! Turns a topic into a finished slide deck through a staged, checkpointed pipeline:
//! outline generation, optional outline approval, parallel per-slide content generation,
//! optional image enrichment, quality review with bounded regeneration, and assembly.
//!
//! The generative model, image search and deck rendering are collaborators behind the
//! traits in [`providers`]; the crate ships deterministic offline implementations.

pub mod checkpoint;
pub mod events;
pub mod providers;
pub mod quality;
pub mod report;
pub mod request;
pub mod workflow;

#[cfg(test)]
mod orchestrator_tests;
#[cfg(test)]
mod test_utils;

pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use events::{EventBroadcaster, ProgressEvent, ProgressReporter, RunSubscription};
pub use providers::{
    ContentSource, ErrorKind, ImageProvider, ImageRef, MarkdownRenderer, OfflineContentSource,
    PlaceholderImageProvider, Renderer, SourceError, StyleContext,
};
pub use quality::{Finding, FindingDimension, QualityEvaluator, QualityReport, Severity, SlideEvaluator};
pub use report::RunReport;
pub use request::{ContentStyle, GenerationRequest, QualityMode, ValidationError, VisualTemplate};
pub use workflow::{
    ErrorOutcome, ErrorRecord, FailureKind, FailureReason, RetryPolicy, RunHandle, RunState,
    RunStatus, SlideContent, SlideSpec, SlideType, Stage, StageExecutor, StageGraph,
    StageOutcome, UnitOutcome, WorkflowConfig, WorkflowOrchestrator, WorkflowOrchestratorBuilder,
};

use uuid::Uuid;

/// Main error type for deckflow operations
#[derive(Debug, thiserror::Error)]
pub enum DeckflowError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Slide id not present in outline: {0}")]
    UnknownSlide(String),

    #[error("Outline of run {0} cannot change once slide content exists")]
    OutlineLocked(Uuid),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("No checkpoint stored for run: {0}")]
    CheckpointNotFound(Uuid),

    #[error("Run {0} is not awaiting outline approval")]
    NotAwaitingApproval(Uuid),

    #[error("Run {0} has already finished")]
    RunTerminal(Uuid),

    #[error("Run {0} has not finished yet")]
    RunNotFinished(Uuid),

    #[error("Run {0} is already running")]
    RunActive(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, DeckflowError>;
