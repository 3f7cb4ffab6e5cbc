//! Progress events - ordered stream of run progress for callers
//!
//! Every run emits events on one shared broadcast channel; a [`RunSubscription`] filters the
//! stream down to a single run and ends after that run's Completed or Failed event.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::workflow::{FailureKind, FailureReason, RunState, RunStatus, SlideSpec, Stage};

/// Events emitted while a run progresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    /// The run entered a working status
    StageStarted {
        run_id: Uuid,
        stage: Stage,
        status: RunStatus,
        fraction_complete: f32,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// One per-slide unit reached its terminal outcome
    UnitFinished {
        run_id: Uuid,
        stage: Stage,
        slide_id: String,
        succeeded: bool,
        fraction_complete: f32,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Outline is ready and the run waits for approve/reject
    AwaitingApproval {
        run_id: Uuid,
        outline: Vec<SlideSpec>,
        fraction_complete: f32,
        timestamp: DateTime<Utc>,
    },

    /// Review produced a score
    QualityEvaluated {
        run_id: Uuid,
        score: u8,
        threshold: u8,
        findings: usize,
        fraction_complete: f32,
        timestamp: DateTime<Utc>,
    },

    Completed {
        run_id: Uuid,
        output_path: Option<PathBuf>,
        timestamp: DateTime<Utc>,
    },

    Failed {
        run_id: Uuid,
        reason: FailureReason,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            ProgressEvent::StageStarted { run_id, .. }
            | ProgressEvent::UnitFinished { run_id, .. }
            | ProgressEvent::AwaitingApproval { run_id, .. }
            | ProgressEvent::QualityEvaluated { run_id, .. }
            | ProgressEvent::Completed { run_id, .. }
            | ProgressEvent::Failed { run_id, .. } => *run_id,
        }
    }

    pub fn fraction_complete(&self) -> f32 {
        match self {
            ProgressEvent::StageStarted { fraction_complete, .. }
            | ProgressEvent::UnitFinished { fraction_complete, .. }
            | ProgressEvent::AwaitingApproval { fraction_complete, .. }
            | ProgressEvent::QualityEvaluated { fraction_complete, .. } => *fraction_complete,
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. } => 1.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. })
    }

    /// The Completed or Failed event a finished run emitted; `None` while it is still going
    pub fn terminal_for(state: &RunState) -> Option<Self> {
        match state.status() {
            RunStatus::Completed => Some(ProgressEvent::Completed {
                run_id: state.run_id,
                output_path: state.output_path().cloned(),
                timestamp: state.updated_at(),
            }),
            RunStatus::Failed => Some(ProgressEvent::Failed {
                run_id: state.run_id,
                reason: state
                    .failure()
                    .cloned()
                    .unwrap_or_else(|| FailureReason::new(FailureKind::Fatal, None, "Run failed")),
                timestamp: state.updated_at(),
            }),
            _ => None,
        }
    }
}

/// Broadcasts events to all subscribers
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self { sender }
    }

    /// Broadcast an event to all subscribers
    pub fn broadcast(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events of every run
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of one run
    pub fn subscribe_run(&self, run_id: Uuid) -> RunSubscription {
        RunSubscription {
            run_id,
            receiver: self.sender.subscribe(),
            replay: None,
            finished: false,
        }
    }

    pub fn stage_started(&self, run_id: Uuid, status: RunStatus, fraction_complete: f32) {
        let Some(stage) = status.stage() else {
            return;
        };
        self.broadcast(ProgressEvent::StageStarted {
            run_id,
            stage,
            status,
            fraction_complete,
            message: format!("Entered {status}"),
            timestamp: Utc::now(),
        });
    }

    pub fn unit_finished(
        &self,
        run_id: Uuid,
        stage: Stage,
        slide_id: &str,
        succeeded: bool,
        fraction_complete: f32,
    ) {
        let message = if succeeded {
            format!("{stage} ready for {slide_id}")
        } else {
            format!("{stage} failed for {slide_id}")
        };
        self.broadcast(ProgressEvent::UnitFinished {
            run_id,
            stage,
            slide_id: slide_id.to_string(),
            succeeded,
            fraction_complete,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn awaiting_approval(&self, run_id: Uuid, outline: &[SlideSpec], fraction_complete: f32) {
        self.broadcast(ProgressEvent::AwaitingApproval {
            run_id,
            outline: outline.to_vec(),
            fraction_complete,
            timestamp: Utc::now(),
        });
    }

    pub fn quality_evaluated(
        &self,
        run_id: Uuid,
        score: u8,
        threshold: u8,
        findings: usize,
        fraction_complete: f32,
    ) {
        self.broadcast(ProgressEvent::QualityEvaluated {
            run_id,
            score,
            threshold,
            findings,
            fraction_complete,
            timestamp: Utc::now(),
        });
    }

    pub fn completed(&self, run_id: Uuid, output_path: Option<PathBuf>) {
        self.broadcast(ProgressEvent::Completed {
            run_id,
            output_path,
            timestamp: Utc::now(),
        });
    }

    pub fn failed(&self, run_id: Uuid, reason: FailureReason) {
        self.broadcast(ProgressEvent::Failed {
            run_id,
            reason,
            timestamp: Utc::now(),
        });
    }
}

/// Per-run emitter that keeps fractions from moving backwards across the review loop
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    run_id: Uuid,
    broadcaster: EventBroadcaster,
    high_water: f32,
}

impl ProgressReporter {
    pub fn new(run_id: Uuid, broadcaster: EventBroadcaster) -> Self {
        Self {
            run_id,
            broadcaster,
            high_water: 0.0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn advance(&mut self, fraction: f32) -> f32 {
        self.high_water = self.high_water.max(fraction.clamp(0.0, 1.0));
        self.high_water
    }

    pub fn stage_started(&mut self, status: RunStatus) {
        let fraction = self.advance(status.progress());
        self.broadcaster.stage_started(self.run_id, status, fraction);
    }

    /// `done` of `total` units finished within the span of `status`
    pub fn unit_finished(
        &mut self,
        status: RunStatus,
        slide_id: &str,
        succeeded: bool,
        done: usize,
        total: usize,
    ) {
        let Some(stage) = status.stage() else {
            return;
        };
        let (start, end) = stage_span(status);
        let share = if total == 0 { 1.0 } else { done as f32 / total as f32 };
        let fraction = self.advance(start + (end - start) * share);
        self.broadcaster
            .unit_finished(self.run_id, stage, slide_id, succeeded, fraction);
    }

    pub fn awaiting_approval(&mut self, outline: &[SlideSpec]) {
        let fraction = self.advance(RunStatus::AwaitingOutlineApproval.progress());
        self.broadcaster.awaiting_approval(self.run_id, outline, fraction);
    }

    pub fn quality_evaluated(&mut self, score: u8, threshold: u8, findings: usize) {
        let fraction = self.advance(RunStatus::Reviewing.progress());
        self.broadcaster
            .quality_evaluated(self.run_id, score, threshold, findings, fraction);
    }

    pub fn completed(&mut self, output_path: Option<PathBuf>) {
        self.advance(1.0);
        self.broadcaster.completed(self.run_id, output_path);
    }

    pub fn failed(&mut self, reason: FailureReason) {
        self.advance(1.0);
        self.broadcaster.failed(self.run_id, reason);
    }
}

/// Fraction range covered by the work of a status
fn stage_span(status: RunStatus) -> (f32, f32) {
    let end = match status {
        RunStatus::ContentGenerating => RunStatus::ImageEnriching.progress(),
        RunStatus::ImageEnriching => RunStatus::Reviewing.progress(),
        RunStatus::Regenerating => RunStatus::Assembling.progress(),
        RunStatus::Assembling => RunStatus::Completed.progress(),
        other => other.progress(),
    };
    (status.progress(), end)
}

/// Ordered event stream of one run
#[derive(Debug)]
pub struct RunSubscription {
    run_id: Uuid,
    receiver: broadcast::Receiver<ProgressEvent>,
    replay: Option<ProgressEvent>,
    finished: bool,
}

impl RunSubscription {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stream for a run that already ended: yields its terminal event once, then `None`
    pub fn replaying(mut self, terminal: ProgressEvent) -> Self {
        self.replay = Some(terminal);
        self
    }

    /// Next event for this run; `None` once the terminal event was delivered
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.replay.take() {
            self.finished = true;
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id() == self.run_id => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("[EVENTS] Subscriber for run {} lagged by {} events", self.run_id, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drain the stream up to and including the terminal event
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}
