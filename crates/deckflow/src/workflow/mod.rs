//! Generation workflow: run state, stage graph, retry policy, stage executor and orchestrator

pub mod config;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod retry;
pub mod types;

pub use config::{QualityThresholds, StagePolicies, WorkflowConfig};
pub use executor::{review_outline, StageExecutor, StageOutcome};
pub use graph::{GraphContext, GuardedEdge, StageGraph};
pub use orchestrator::{RunHandle, WorkflowOrchestrator, WorkflowOrchestratorBuilder};
pub use retry::{run_with_retry, AttemptFailure, AttemptOutcome, Attempted, RetryPolicy};
pub use types::{
    retry_key, ErrorOutcome, ErrorRecord, FailureKind, FailureReason, RunState, RunStatus,
    SlideContent, SlideSpec, SlideType, Stage, StatusTransition, UnitOutcome,
};
