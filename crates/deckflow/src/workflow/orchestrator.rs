//! Workflow orchestration - drives generation runs through the stage graph
//!
//! Each submitted run gets its own task that exclusively owns the run's [`RunState`]. The task
//! executes the stage for the current status, follows the first passing edge of the
//! [`StageGraph`], and persists a checkpoint after every transition. Callers interact with a
//! live run through its id: approve/reject the outline, cancel, query status, or follow the
//! progress events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore},
    events::{EventBroadcaster, ProgressEvent, ProgressReporter, RunSubscription},
    providers::{ContentSource, ImageProvider, Renderer},
    quality::{QualityEvaluator, SlideEvaluator},
    report::RunReport,
    request::GenerationRequest,
    DeckflowError, Result,
};

use super::{
    executor::{StageExecutor, StageOutcome},
    graph::{GraphContext, StageGraph},
    FailureKind, FailureReason, RunState, RunStatus, WorkflowConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ApprovalSignal {
    Approve,
    Reject(String),
}

/// Signal plus the driver's answer: `true` once it acted on the signal
struct ApprovalRequest {
    signal: ApprovalSignal,
    accepted: oneshot::Sender<bool>,
}

enum ApprovalDecision {
    Approved,
    Rejected(String),
    TimedOut,
    Cancelled,
}

/// Bookkeeping the orchestrator keeps for every run it launched
struct ActiveRun {
    status: watch::Receiver<RunStatus>,
    cancel: CancellationToken,
    approvals: mpsc::Sender<ApprovalRequest>,
}

/// Caller side of a launched run
pub struct RunHandle {
    run_id: Uuid,
    status: watch::Receiver<RunStatus>,
    events: RunSubscription,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Progress events of this run, subscribed before the run started
    pub fn events(&mut self) -> &mut RunSubscription {
        &mut self.events
    }

    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Wait until the run reaches `target` or finishes
    pub async fn wait_for_status(&mut self, target: RunStatus) -> RunStatus {
        loop {
            let current = *self.status.borrow_and_update();
            if current == target || current.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }

    /// Wait for the final state of the run
    pub async fn join(self) -> Result<RunState> {
        self.task.await.map_err(|e| DeckflowError::Join(e.to_string()))
    }

    /// Wait for the run to finish and project its report
    pub async fn wait(self) -> Result<RunReport> {
        let state = self.join().await?;
        RunReport::from_state(&state)
    }
}

/// Assembles a [`WorkflowOrchestrator`] from its collaborators
pub struct WorkflowOrchestratorBuilder {
    content: Arc<dyn ContentSource>,
    renderer: Arc<dyn Renderer>,
    images: Option<Arc<dyn ImageProvider>>,
    evaluator: Arc<dyn SlideEvaluator>,
    store: Arc<dyn CheckpointStore>,
    config: WorkflowConfig,
    shared_limit: Option<Arc<Semaphore>>,
}

impl WorkflowOrchestratorBuilder {
    pub fn images(mut self, images: Arc<dyn ImageProvider>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn SlideEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Process-wide cap on concurrent collaborator calls, shared with other orchestrators
    pub fn shared_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.shared_limit = Some(limit);
        self
    }

    pub fn build(self) -> WorkflowOrchestrator {
        let config = Arc::new(self.config);
        let mut executor = StageExecutor::new(self.content, self.renderer, self.evaluator, config.clone());
        if let Some(images) = self.images {
            executor = executor.with_images(images);
        }
        if let Some(limit) = self.shared_limit {
            executor = executor.with_shared_limit(limit);
        }

        WorkflowOrchestrator {
            executor: Arc::new(executor),
            graph: Arc::new(StageGraph::standard()),
            store: self.store,
            config,
            events: EventBroadcaster::new(),
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Central orchestrator for presentation generation runs
pub struct WorkflowOrchestrator {
    executor: Arc<StageExecutor>,
    graph: Arc<StageGraph>,
    store: Arc<dyn CheckpointStore>,
    config: Arc<WorkflowConfig>,
    events: EventBroadcaster,
    active_runs: Arc<RwLock<HashMap<Uuid, ActiveRun>>>,
}

impl WorkflowOrchestrator {
    /// Start building an orchestrator; defaults to the rubric evaluator and an in-memory store
    pub fn builder(content: Arc<dyn ContentSource>, renderer: Arc<dyn Renderer>) -> WorkflowOrchestratorBuilder {
        WorkflowOrchestratorBuilder {
            content,
            renderer,
            images: None,
            evaluator: Arc::new(QualityEvaluator::new()),
            store: Arc::new(InMemoryCheckpointStore::new()),
            config: WorkflowConfig::default(),
            shared_limit: None,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        self.store.clone()
    }

    /// Validate a request and start a run for it
    pub async fn submit(&self, request: GenerationRequest) -> Result<RunHandle> {
        request.validate(self.config.min_slides, self.config.max_slides)?;
        let state = RunState::new(request);

        tracing::info!(
            "[ORCHESTRATOR] Submitted run {} for '{}' ({} slides, {} mode)",
            state.run_id,
            state.request.topic,
            state.request.slide_count,
            state.request.quality_mode
        );

        self.launch(state).await
    }

    /// Continue a run from its latest checkpoint
    pub async fn resume(&self, run_id: Uuid) -> Result<RunHandle> {
        if self.active_runs.read().await.contains_key(&run_id) {
            return Err(DeckflowError::RunActive(run_id));
        }

        let checkpoint = self.store.load(run_id).await?;
        if checkpoint.state.status().is_terminal() {
            return Err(DeckflowError::RunTerminal(run_id));
        }

        tracing::info!(
            "[ORCHESTRATOR] Resuming run {} at {} from checkpoint {} ({} of {} slides done)",
            run_id,
            checkpoint.status,
            checkpoint.sequence,
            checkpoint.state.slides().len(),
            checkpoint.state.outline().map(<[_]>::len).unwrap_or(0)
        );

        self.launch(checkpoint.state).await
    }

    async fn launch(&self, state: RunState) -> Result<RunHandle> {
        let run_id = state.run_id;
        let (status_tx, status_rx) = watch::channel(state.status());
        let (approval_tx, approval_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let events = self.events.subscribe_run(run_id);

        self.active_runs.write().await.insert(
            run_id,
            ActiveRun {
                status: status_rx.clone(),
                cancel: cancel.clone(),
                approvals: approval_tx,
            },
        );

        let driver = RunDriver {
            executor: self.executor.clone(),
            graph: self.graph.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            progress: ProgressReporter::new(run_id, self.events.clone()),
            status: status_tx,
            approvals: approval_rx,
            cancel,
        };
        let task = tokio::spawn(driver.drive(state));

        Ok(RunHandle {
            run_id,
            status: status_rx,
            events,
            task,
        })
    }

    /// Approve the outline of a run waiting for it
    pub async fn approve(&self, run_id: Uuid) -> Result<()> {
        self.signal(run_id, ApprovalSignal::Approve).await
    }

    /// Reject the outline of a run waiting for it; the run fails with the given reason
    pub async fn reject(&self, run_id: Uuid, reason: impl Into<String>) -> Result<()> {
        self.signal(run_id, ApprovalSignal::Reject(reason.into())).await
    }

    async fn signal(&self, run_id: Uuid, signal: ApprovalSignal) -> Result<()> {
        let approvals = {
            let runs = self.active_runs.read().await;
            let run = runs.get(&run_id).ok_or(DeckflowError::RunNotFound(run_id))?;
            if *run.status.borrow() != RunStatus::AwaitingOutlineApproval {
                return Err(DeckflowError::NotAwaitingApproval(run_id));
            }
            run.approvals.clone()
        };

        tracing::info!("[ORCHESTRATOR] Run {}: outline signal {:?}", run_id, signal);
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let request = ApprovalRequest {
            signal,
            accepted: accepted_tx,
        };
        if approvals.send(request).await.is_err() {
            return Err(DeckflowError::NotAwaitingApproval(run_id));
        }

        // The run may time out or be cancelled before it reads the signal
        match accepted_rx.await {
            Ok(true) => Ok(()),
            _ => Err(DeckflowError::NotAwaitingApproval(run_id)),
        }
    }

    /// Cancel a live run; it fails with reason Cancelled once in-flight units are abandoned
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        let runs = self.active_runs.read().await;
        let run = runs.get(&run_id).ok_or(DeckflowError::RunNotFound(run_id))?;
        if run.status.borrow().is_terminal() {
            return Err(DeckflowError::RunTerminal(run_id));
        }

        tracing::info!("[ORCHESTRATOR] Run {} cancellation requested", run_id);
        run.cancel.cancel();
        Ok(())
    }

    /// Current status of a run launched here, or of the latest checkpoint otherwise
    pub async fn status(&self, run_id: Uuid) -> Result<RunStatus> {
        if let Some(run) = self.active_runs.read().await.get(&run_id) {
            return Ok(*run.status.borrow());
        }
        match self.store.load(run_id).await {
            Ok(checkpoint) => Ok(checkpoint.status),
            Err(DeckflowError::CheckpointNotFound(_)) => Err(DeckflowError::RunNotFound(run_id)),
            Err(e) => Err(e),
        }
    }

    /// Runs launched here with their current status
    pub async fn runs(&self) -> Vec<(Uuid, RunStatus)> {
        self.active_runs
            .read()
            .await
            .iter()
            .map(|(id, run)| (*id, *run.status.borrow()))
            .collect()
    }

    /// Progress events of one run; a run that already ended replays its terminal event
    pub async fn subscribe(&self, run_id: Uuid) -> Result<RunSubscription> {
        // Subscribe before reading the status so a terminal event sent in between is not lost
        let subscription = self.events.subscribe_run(run_id);
        let live = self
            .active_runs
            .read()
            .await
            .get(&run_id)
            .map(|run| *run.status.borrow());
        if live.is_some_and(|status| !status.is_terminal()) {
            return Ok(subscription);
        }

        let state = match self.store.load(run_id).await {
            Ok(checkpoint) => Some(checkpoint.state),
            Err(DeckflowError::CheckpointNotFound(_)) if live.is_some() => None,
            Err(DeckflowError::CheckpointNotFound(_)) => {
                return Err(DeckflowError::RunNotFound(run_id))
            }
            Err(e) => return Err(e),
        };

        let terminal = state.as_ref().and_then(ProgressEvent::terminal_for).or_else(|| {
            live.map(|status| match status {
                RunStatus::Completed => ProgressEvent::Completed {
                    run_id,
                    output_path: None,
                    timestamp: Utc::now(),
                },
                _ => ProgressEvent::Failed {
                    run_id,
                    reason: FailureReason::new(FailureKind::Fatal, None, "Run failed"),
                    timestamp: Utc::now(),
                },
            })
        });
        Ok(match terminal {
            Some(event) => subscription.replaying(event),
            // Interrupted run waiting to be resumed
            None => subscription,
        })
    }

    /// Progress events of every run
    pub fn subscribe_all(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Drop bookkeeping for finished runs
    pub async fn cleanup_finished(&self) -> usize {
        let mut runs = self.active_runs.write().await;
        let before = runs.len();
        runs.retain(|id, run| {
            let finished = run.status.borrow().is_terminal();
            if finished {
                tracing::debug!("[ORCHESTRATOR] Forgetting finished run {}", id);
            }
            !finished
        });
        before - runs.len()
    }
}

/// Task-side owner of one run
struct RunDriver {
    executor: Arc<StageExecutor>,
    graph: Arc<StageGraph>,
    store: Arc<dyn CheckpointStore>,
    config: Arc<WorkflowConfig>,
    progress: ProgressReporter,
    status: watch::Sender<RunStatus>,
    approvals: mpsc::Receiver<ApprovalRequest>,
    cancel: CancellationToken,
}

impl RunDriver {
    async fn drive(mut self, mut state: RunState) -> RunState {
        let resumed = state.status();
        if resumed != RunStatus::Pending {
            self.progress.stage_started(resumed);
            if resumed == RunStatus::AwaitingOutlineApproval {
                self.progress.awaiting_approval(state.outline().unwrap_or_default());
            }
        }

        while !state.status().is_terminal() {
            let status = state.status();
            if self.cancel.is_cancelled() {
                self.fail(&mut state, FailureReason::cancelled(status.stage())).await;
                break;
            }

            match status {
                RunStatus::Pending => self.advance(&mut state).await,
                RunStatus::AwaitingOutlineApproval => self.handle_approval(&mut state).await,
                _ => self.run_stage(&mut state).await,
            }
        }

        state
    }

    async fn run_stage(&mut self, state: &mut RunState) {
        let status = state.status();
        let Some(stage) = status.stage() else {
            self.fail(state, FailureReason::new(FailureKind::Fatal, None, format!("No stage for status {status}")))
                .await;
            return;
        };

        let policy = self.config.policy(stage).clone();
        let outcome = self
            .executor
            .execute(stage, state, &policy, &self.cancel, &mut self.progress)
            .await;

        match outcome {
            Ok(StageOutcome::Completed { .. }) => self.advance(state).await,
            Ok(StageOutcome::Fatal { message }) => {
                self.fail(state, FailureReason::new(FailureKind::Fatal, Some(stage), message))
                    .await
            }
            Ok(StageOutcome::Cancelled) => self.fail(state, FailureReason::cancelled(Some(stage))).await,
            Err(e) => {
                tracing::error!("[ORCHESTRATOR] Run {}: {} stage errored: {}", state.run_id, stage, e);
                self.fail(state, FailureReason::new(FailureKind::Fatal, Some(stage), e.to_string()))
                    .await
            }
        }
    }

    async fn handle_approval(&mut self, state: &mut RunState) {
        let decision = self.wait_for_approval().await;
        self.close_approvals();

        match decision {
            ApprovalDecision::Approved => {
                if let Err(e) = state.approve_outline() {
                    tracing::error!("[ORCHESTRATOR] Run {}: approval not recorded: {}", state.run_id, e);
                }
                self.advance(state).await;
            }
            ApprovalDecision::Rejected(reason) => {
                self.fail(state, FailureReason::new(FailureKind::Rejected, Some(super::Stage::Outline), reason))
                    .await
            }
            ApprovalDecision::TimedOut => {
                self.fail(
                    state,
                    FailureReason::new(
                        FailureKind::ApprovalTimeout,
                        Some(super::Stage::Outline),
                        "Outline approval timed out",
                    ),
                )
                .await
            }
            ApprovalDecision::Cancelled => {
                self.fail(state, FailureReason::cancelled(Some(super::Stage::Outline)))
                    .await
            }
        }
    }

    async fn wait_for_approval(&mut self) -> ApprovalDecision {
        let timeout = self.config.approval_timeout();
        tokio::select! {
            _ = self.cancel.cancelled() => ApprovalDecision::Cancelled,
            request = self.approvals.recv() => match request {
                Some(ApprovalRequest { signal, accepted }) => {
                    let _ = accepted.send(true);
                    match signal {
                        ApprovalSignal::Approve => ApprovalDecision::Approved,
                        ApprovalSignal::Reject(reason) => ApprovalDecision::Rejected(reason),
                    }
                }
                None => ApprovalDecision::Cancelled,
            },
            _ = sleep_or_forever(timeout) => ApprovalDecision::TimedOut,
        }
    }

    /// Refuse signals that arrived after the decision; a run decides its outline once
    fn close_approvals(&mut self) {
        self.approvals.close();
        while let Ok(late) = self.approvals.try_recv() {
            let _ = late.accepted.send(false);
        }
    }

    /// Follow the first passing edge out of the current status
    async fn advance(&mut self, state: &mut RunState) {
        let from = state.status();
        let next = {
            let ctx = GraphContext::new(state, &self.config, self.executor.has_images());
            self.graph.next(from, &ctx).map(|edge| (edge.to, edge.label))
        };
        let Some((to, label)) = next else {
            self.fail(
                state,
                FailureReason::new(FailureKind::Fatal, from.stage(), format!("No edge out of {from}")),
            )
            .await;
            return;
        };

        if let Err(e) = state.transition(to) {
            self.fail(state, FailureReason::new(FailureKind::Fatal, from.stage(), e.to_string()))
                .await;
            return;
        }

        tracing::info!("[ORCHESTRATOR] Run {}: {} -> {} ({})", state.run_id, from, to, label);
        self.checkpoint(state).await;
        self.status.send_replace(to);

        match to {
            RunStatus::Completed => {
                self.progress.completed(state.output_path().cloned());
                tracing::info!(
                    "[ORCHESTRATOR] Run {} completed with {} errors recorded",
                    state.run_id,
                    state.errors().len()
                );
            }
            RunStatus::AwaitingOutlineApproval => {
                self.progress.stage_started(to);
                self.progress.awaiting_approval(state.outline().unwrap_or_default());
            }
            _ => self.progress.stage_started(to),
        }
    }

    async fn fail(&mut self, state: &mut RunState, reason: FailureReason) {
        if let Err(e) = state.fail(reason.clone()) {
            tracing::warn!("[ORCHESTRATOR] Run {}: cannot fail run: {}", state.run_id, e);
            return;
        }

        match reason.kind {
            FailureKind::Cancelled => tracing::info!("[ORCHESTRATOR] Run {} cancelled", state.run_id),
            _ => tracing::error!(
                "[ORCHESTRATOR] Run {} failed ({:?}): {}",
                state.run_id,
                reason.kind,
                reason.message
            ),
        }

        self.checkpoint(state).await;
        self.status.send_replace(RunStatus::Failed);
        self.progress.failed(reason);
    }

    async fn checkpoint(&self, state: &mut RunState) {
        let checkpoint = Checkpoint::capture(state);
        let sequence = checkpoint.sequence;
        if let Err(e) = self.store.save(checkpoint).await {
            tracing::error!(
                "[CHECKPOINT] Run {}: failed to save checkpoint {}: {}",
                state.run_id,
                sequence,
                e
            );
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
