//! Stage executor - runs the unit(s) of one stage against a run's state
//!
//! Outline, review and assembly are single units. Content, images and regeneration fan out
//! into one spawned task per slide, bounded by a per-run semaphore and an optional shared
//! limiter. Units never touch the run state: their results come back to the executor, which
//! applies them one at a time, so each slide key has exactly one writer.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    events::ProgressReporter,
    providers::{
        image_query, ContentSource, ErrorKind, ImageProvider, Renderer, SourceError, StyleContext,
    },
    quality::{QualityReport, SlideEvaluator},
    Result,
};

use super::{
    retry::{run_with_retry, AttemptFailure, AttemptOutcome, Attempted, RetryPolicy},
    ErrorOutcome, ErrorRecord, RunState, RunStatus, SlideContent, SlideSpec, Stage, UnitOutcome,
    WorkflowConfig,
};

/// Allowed difference between the requested and the generated slide count
const OUTLINE_LENGTH_SLACK: u32 = 2;

/// What a stage execution amounted to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Every unit reached a terminal outcome within tolerance
    Completed { succeeded: usize, failed: usize },
    /// The stage cannot be recovered; the run must fail
    Fatal { message: String },
    Cancelled,
}

struct UnitReport<T> {
    spec: SlideSpec,
    attempted: Attempted<T>,
}

pub struct StageExecutor {
    content: Arc<dyn ContentSource>,
    images: Option<Arc<dyn ImageProvider>>,
    renderer: Arc<dyn Renderer>,
    evaluator: Arc<dyn SlideEvaluator>,
    config: Arc<WorkflowConfig>,
    shared_limit: Option<Arc<Semaphore>>,
}

impl StageExecutor {
    pub fn new(
        content: Arc<dyn ContentSource>,
        renderer: Arc<dyn Renderer>,
        evaluator: Arc<dyn SlideEvaluator>,
        config: Arc<WorkflowConfig>,
    ) -> Self {
        Self {
            content,
            images: None,
            renderer,
            evaluator,
            config,
            shared_limit: None,
        }
    }

    pub fn with_images(mut self, images: Arc<dyn ImageProvider>) -> Self {
        self.images = Some(images);
        self
    }

    /// Cap concurrent collaborator calls across every run sharing this semaphore
    pub fn with_shared_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.shared_limit = Some(limit);
        self
    }

    pub fn has_images(&self) -> bool {
        self.images.is_some()
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Execute one stage, recording every non-nominal attempt in the run's error list
    pub async fn execute(
        &self,
        stage: Stage,
        state: &mut RunState,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        progress: &mut ProgressReporter,
    ) -> Result<StageOutcome> {
        tracing::debug!("[STAGE_EXECUTOR] Run {}: executing {} stage", state.run_id, stage);

        let outcome = match stage {
            Stage::Outline => self.execute_outline(state, policy, cancel).await?,
            Stage::Content => self.execute_content(state, policy, cancel, progress).await?,
            Stage::Images => self.execute_images(state, policy, cancel, progress).await?,
            Stage::Review => self.execute_review(state, cancel, progress).await?,
            Stage::Regeneration => {
                self.execute_regeneration(state, policy, cancel, progress).await?
            }
            Stage::Assembly => self.execute_assembly(state, policy, cancel).await?,
        };

        match &outcome {
            StageOutcome::Completed { succeeded, failed } => tracing::info!(
                "[STAGE_EXECUTOR] Run {}: {} stage done ({} succeeded, {} failed)",
                state.run_id,
                stage,
                succeeded,
                failed
            ),
            StageOutcome::Fatal { message } => {
                tracing::error!(
                    "[STAGE_EXECUTOR] Run {}: {} stage fatal: {}",
                    state.run_id,
                    stage,
                    message
                )
            }
            StageOutcome::Cancelled => {
                tracing::info!("[STAGE_EXECUTOR] Run {}: {} stage cancelled", state.run_id, stage)
            }
        }

        Ok(outcome)
    }

    async fn execute_outline(
        &self,
        state: &mut RunState,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        if state.outline().is_some() {
            return Ok(StageOutcome::Completed { succeeded: 1, failed: 0 });
        }

        let topic = state.request.topic.clone();
        let topic = topic.as_str();
        let count = state.request.slide_count;
        let style = state.request.style;
        let content = &self.content;

        let attempted = run_with_retry(policy, cancel, |_| async move {
            let outline = content.generate_outline(topic, count, style).await?;
            review_outline(outline, count)
        })
        .await;

        state.set_retry_count(Stage::Outline, None, attempted.retries)?;
        match attempted.outcome {
            AttemptOutcome::Succeeded(outline) => {
                record_failures(
                    state,
                    Stage::Outline,
                    None,
                    &attempted.failures,
                    ErrorOutcome::Recovered,
                )?;
                tracing::info!(
                    "[STAGE_EXECUTOR] Run {}: outline with {} slides",
                    state.run_id,
                    outline.len()
                );
                state.set_outline(outline)?;
                Ok(StageOutcome::Completed { succeeded: 1, failed: 0 })
            }
            AttemptOutcome::Failed(error) => {
                record_failures(
                    state,
                    Stage::Outline,
                    None,
                    &attempted.failures,
                    ErrorOutcome::Fatal,
                )?;
                Ok(StageOutcome::Fatal {
                    message: format!("Outline generation failed: {error}"),
                })
            }
            AttemptOutcome::Cancelled => {
                record_failures(
                    state,
                    Stage::Outline,
                    None,
                    &attempted.failures,
                    ErrorOutcome::Cancelled,
                )?;
                Ok(StageOutcome::Cancelled)
            }
        }
    }

    async fn execute_content(
        &self,
        state: &mut RunState,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        progress: &mut ProgressReporter,
    ) -> Result<StageOutcome> {
        let pending = state.pending_content();
        let total = state.outline().map(<[SlideSpec]>::len).unwrap_or(0);
        let context = StyleContext::for_request(&state.request);
        let source = self.content.clone();

        tracing::info!(
            "[STAGE_EXECUTOR] Run {}: generating {} of {} slides",
            state.run_id,
            pending.len(),
            total
        );

        let reports = self
            .fan_out(
                RunStatus::ContentGenerating,
                pending,
                policy,
                cancel,
                progress,
                move |spec, policy, cancel| {
                    let source = source.clone();
                    let context = context.clone();
                    async move {
                        run_with_retry(&policy, &cancel, |_| {
                            source.generate_slide_content(&spec, &context)
                        })
                        .await
                    }
                },
            )
            .await;

        let previously_failed =
            count_outcomes(state, |s, id| s.content_outcome(id), UnitOutcome::Failed);
        let newly_failed = reports
            .iter()
            .filter(|r| matches!(r.attempted.outcome, AttemptOutcome::Failed(_)))
            .count();
        let failed = previously_failed + newly_failed;
        let fatal = !cancel.is_cancelled()
            && exceeds_tolerance(failed, total, self.config.failure_tolerance(Stage::Content));

        let mut succeeded = 0;
        for report in reports {
            let id = report.spec.id.clone();
            state.set_retry_count(Stage::Content, Some(&id), report.attempted.retries)?;
            match report.attempted.outcome {
                AttemptOutcome::Succeeded(content) => {
                    record_failures(
                        state,
                        Stage::Content,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::Recovered,
                    )?;
                    state.insert_slide(&id, content)?;
                    state.record_content_outcome(&id, UnitOutcome::Succeeded)?;
                    succeeded += 1;
                }
                AttemptOutcome::Failed(_) => {
                    let outcome = if fatal {
                        ErrorOutcome::Fatal
                    } else {
                        ErrorOutcome::UnitFailed
                    };
                    record_failures(
                        state,
                        Stage::Content,
                        Some(&id),
                        &report.attempted.failures,
                        outcome,
                    )?;
                    state.insert_slide(&id, SlideContent::placeholder(&report.spec))?;
                    state.record_content_outcome(&id, UnitOutcome::Failed)?;
                }
                AttemptOutcome::Cancelled => {
                    record_failures(
                        state,
                        Stage::Content,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::Cancelled,
                    )?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }
        if fatal {
            return Ok(StageOutcome::Fatal {
                message: format!(
                    "{failed} of {total} slides failed content generation (tolerance {:.0}%)",
                    self.config.failure_tolerance(Stage::Content) * 100.0
                ),
            });
        }
        Ok(StageOutcome::Completed {
            succeeded,
            failed: newly_failed,
        })
    }

    async fn execute_images(
        &self,
        state: &mut RunState,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        progress: &mut ProgressReporter,
    ) -> Result<StageOutcome> {
        let Some(provider) = self.images.clone() else {
            return Ok(StageOutcome::Completed { succeeded: 0, failed: 0 });
        };

        let pending = state.pending_images();
        let queries: HashMap<String, String> = pending
            .iter()
            .filter_map(|spec| {
                state
                    .slide(&spec.id)
                    .map(|content| {
                        (spec.id.clone(), image_query(spec, content, &state.request.topic))
                    })
            })
            .collect();
        let queries = Arc::new(queries);

        let reports = self
            .fan_out(
                RunStatus::ImageEnriching,
                pending,
                policy,
                cancel,
                progress,
                move |spec, policy, cancel| {
                    let provider = provider.clone();
                    let query = queries.get(&spec.id).cloned().unwrap_or_default();
                    async move {
                        run_with_retry(&policy, &cancel, |_| provider.search(&query)).await
                    }
                },
            )
            .await;

        let mut succeeded = 0;
        let mut newly_failed = 0;
        for report in reports {
            let id = report.spec.id.clone();
            state.set_retry_count(Stage::Images, Some(&id), report.attempted.retries)?;
            match report.attempted.outcome {
                AttemptOutcome::Succeeded(image) => {
                    record_failures(
                        state,
                        Stage::Images,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::Recovered,
                    )?;
                    state.attach_image(&id, image)?;
                    state.record_image_outcome(&id, UnitOutcome::Succeeded)?;
                    succeeded += 1;
                }
                AttemptOutcome::Failed(_) => {
                    record_failures(
                        state,
                        Stage::Images,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::UnitFailed,
                    )?;
                    state.record_image_outcome(&id, UnitOutcome::Failed)?;
                    newly_failed += 1;
                }
                AttemptOutcome::Cancelled => {
                    record_failures(
                        state,
                        Stage::Images,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::Cancelled,
                    )?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }

        let eligible = count_outcomes(state, |s, id| s.content_outcome(id), UnitOutcome::Succeeded);
        let failed = count_outcomes(state, |s, id| s.image_outcome(id), UnitOutcome::Failed);
        let tolerance = self.config.failure_tolerance(Stage::Images);
        if exceeds_tolerance(failed, eligible, tolerance) {
            mark_stage_fatal(state, Stage::Images)?;
            return Ok(StageOutcome::Fatal {
                message: format!(
                    "{failed} of {eligible} image searches failed (tolerance {:.0}%)",
                    tolerance * 100.0
                ),
            });
        }

        Ok(StageOutcome::Completed {
            succeeded,
            failed: newly_failed,
        })
    }

    async fn execute_review(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
        progress: &mut ProgressReporter,
    ) -> Result<StageOutcome> {
        let outline = state.outline().map(<[SlideSpec]>::to_vec).unwrap_or_default();
        let report = tokio::select! {
            _ = cancel.cancelled() => None,
            report = self.evaluator.evaluate(&outline, state.slides(), state.request.style) => {
                Some(report)
            }
        };
        let Some(QualityReport { score, findings }) = report else {
            return Ok(StageOutcome::Cancelled);
        };

        let threshold = self.config.threshold(state.request.quality_mode);
        tracing::info!(
            "[QA] Run {}: score {} against threshold {} with {} findings",
            state.run_id,
            score,
            threshold,
            findings.len()
        );
        progress.quality_evaluated(score, threshold, findings.len());
        state.set_quality(score, findings)?;

        Ok(StageOutcome::Completed { succeeded: 1, failed: 0 })
    }

    async fn execute_regeneration(
        &self,
        state: &mut RunState,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        progress: &mut ProgressReporter,
    ) -> Result<StageOutcome> {
        let candidates: HashSet<String> = state.regeneration_candidates().into_iter().collect();
        let specs: Vec<SlideSpec> = state
            .outline()
            .unwrap_or_default()
            .iter()
            .filter(|spec| candidates.contains(&spec.id))
            .cloned()
            .collect();
        let cycle = state.begin_regeneration_cycle()?;

        tracing::info!(
            "[STAGE_EXECUTOR] Run {}: regeneration cycle {} for {} slides",
            state.run_id,
            cycle,
            specs.len()
        );

        let guidance: HashMap<String, String> = specs
            .iter()
            .filter_map(|spec| {
                QualityReport::guidance_for(state.quality_findings(), &spec.id)
                    .map(|g| (spec.id.clone(), g))
            })
            .collect();
        let guidance = Arc::new(guidance);
        let context = StyleContext::for_request(&state.request);
        let source = self.content.clone();

        let reports = self
            .fan_out(
                RunStatus::Regenerating,
                specs,
                policy,
                cancel,
                progress,
                move |spec, policy, cancel| {
                    let source = source.clone();
                    let context = match guidance.get(&spec.id) {
                        Some(text) => context.clone().with_guidance(text.clone()),
                        None => context.clone(),
                    };
                    async move {
                        run_with_retry(&policy, &cancel, |_| {
                            source.generate_slide_content(&spec, &context)
                        })
                        .await
                    }
                },
            )
            .await;

        let mut succeeded = 0;
        let mut failed = 0;
        for report in reports {
            let id = report.spec.id.clone();
            state.set_retry_count(Stage::Regeneration, Some(&id), report.attempted.retries)?;
            match report.attempted.outcome {
                AttemptOutcome::Succeeded(content) => {
                    record_failures(
                        state,
                        Stage::Regeneration,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::Recovered,
                    )?;
                    state.insert_slide(&id, content)?;
                    state.record_content_outcome(&id, UnitOutcome::Succeeded)?;
                    succeeded += 1;
                }
                AttemptOutcome::Failed(_) => {
                    // Previous content stays in place
                    record_failures(
                        state,
                        Stage::Regeneration,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::UnitFailed,
                    )?;
                    failed += 1;
                }
                AttemptOutcome::Cancelled => {
                    record_failures(
                        state,
                        Stage::Regeneration,
                        Some(&id),
                        &report.attempted.failures,
                        ErrorOutcome::Cancelled,
                    )?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }
        Ok(StageOutcome::Completed { succeeded, failed })
    }

    async fn execute_assembly(
        &self,
        state: &mut RunState,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let outline = state.outline().map(<[SlideSpec]>::to_vec).unwrap_or_default();
        let slides = state.slides().clone();
        let template = state.request.template;
        let renderer = &self.renderer;
        let outline_ref = outline.as_slice();
        let slides_ref = &slides;

        let attempted = run_with_retry(policy, cancel, |_| {
            renderer.assemble(outline_ref, slides_ref, template)
        })
        .await;

        state.set_retry_count(Stage::Assembly, None, attempted.retries)?;
        match attempted.outcome {
            AttemptOutcome::Succeeded(path) => {
                record_failures(
                    state,
                    Stage::Assembly,
                    None,
                    &attempted.failures,
                    ErrorOutcome::Recovered,
                )?;
                tracing::info!(
                    "[STAGE_EXECUTOR] Run {}: deck written to {}",
                    state.run_id,
                    path.display()
                );
                state.set_output_path(path)?;
                Ok(StageOutcome::Completed { succeeded: 1, failed: 0 })
            }
            AttemptOutcome::Failed(error) => {
                record_failures(
                    state,
                    Stage::Assembly,
                    None,
                    &attempted.failures,
                    ErrorOutcome::Fatal,
                )?;
                Ok(StageOutcome::Fatal {
                    message: format!("Assembly failed: {error}"),
                })
            }
            AttemptOutcome::Cancelled => {
                record_failures(
                    state,
                    Stage::Assembly,
                    None,
                    &attempted.failures,
                    ErrorOutcome::Cancelled,
                )?;
                Ok(StageOutcome::Cancelled)
            }
        }
    }

    /// Spawn one task per slide and collect the reports in completion order.
    ///
    /// `unit` builds the work for one slide; it runs in the spawned task once a permit is held.
    async fn fan_out<T, U, UFut>(
        &self,
        status: RunStatus,
        specs: Vec<SlideSpec>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        progress: &mut ProgressReporter,
        unit: U,
    ) -> Vec<UnitReport<T>>
    where
        T: Send + 'static,
        U: Fn(SlideSpec, RetryPolicy, CancellationToken) -> UFut,
        UFut: Future<Output = Attempted<T>> + Send + 'static,
    {
        let total = specs.len();
        let run_limit = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = FuturesUnordered::new();

        for spec in specs {
            if cancel.is_cancelled() {
                break;
            }
            let work = unit(spec.clone(), policy.clone(), cancel.clone());
            let run_limit = run_limit.clone();
            let shared_limit = self.shared_limit.clone();

            let handle = tokio::spawn(async move {
                let _run_permit = run_limit.acquire_owned().await.ok();
                let _shared_permit = match shared_limit {
                    Some(limit) => limit.acquire_owned().await.ok(),
                    None => None,
                };
                work.await
            });
            tasks.push(async move { (spec, handle.await) });
        }

        let mut reports = Vec::with_capacity(total);
        let mut done = 0;
        while let Some((spec, joined)) = tasks.next().await {
            let attempted = joined.unwrap_or_else(|e| {
                tracing::error!("[STAGE_EXECUTOR] Unit task for {} aborted: {}", spec.id, e);
                aborted_unit(e.to_string())
            });

            match &attempted.outcome {
                AttemptOutcome::Succeeded(_) => {
                    done += 1;
                    progress.unit_finished(status, &spec.id, true, done, total);
                }
                AttemptOutcome::Failed(error) => {
                    done += 1;
                    tracing::warn!("[STAGE_EXECUTOR] {} failed for {}: {}", status, spec.id, error);
                    progress.unit_finished(status, &spec.id, false, done, total);
                }
                AttemptOutcome::Cancelled => {}
            }
            reports.push(UnitReport { spec, attempted });
        }

        reports
    }
}

/// Reject outlines that are empty, reuse ids, or miss the requested size by too much
pub fn review_outline(
    outline: Vec<SlideSpec>,
    requested: u32,
) -> std::result::Result<Vec<SlideSpec>, SourceError> {
    if outline.is_empty() {
        return Err(SourceError::malformed("outline is empty"));
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = outline.iter().find(|spec| !seen.insert(spec.id.as_str())) {
        return Err(SourceError::malformed(format!("outline repeats slide id {}", duplicate.id)));
    }

    let length = outline.len() as u32;
    if length.abs_diff(requested) > OUTLINE_LENGTH_SLACK {
        return Err(SourceError::malformed(format!(
            "outline has {length} slides, {requested} were requested"
        )));
    }

    Ok(outline)
}

fn aborted_unit<T>(message: String) -> Attempted<T> {
    Attempted {
        failures: vec![AttemptFailure {
            kind: ErrorKind::ProviderError,
            message: message.clone(),
            attempt: 1,
            retried: false,
        }],
        outcome: AttemptOutcome::Failed(SourceError::new(ErrorKind::ProviderError, message)),
        retries: 0,
    }
}

fn record_failures(
    state: &mut RunState,
    stage: Stage,
    slide_id: Option<&str>,
    failures: &[AttemptFailure],
    outcome: ErrorOutcome,
) -> Result<()> {
    for failure in failures {
        state.push_error(ErrorRecord {
            stage,
            slide_id: slide_id.map(str::to_string),
            kind: failure.kind,
            message: failure.message.clone(),
            attempt: failure.attempt,
            retried: failure.retried,
            outcome,
            at: Utc::now(),
        })?;
    }
    Ok(())
}

/// Promote every unit failure of the stage to fatal
fn mark_stage_fatal(state: &mut RunState, stage: Stage) -> Result<()> {
    state.mark_fatal(|record| record.stage == stage && record.outcome == ErrorOutcome::UnitFailed)
}

fn count_outcomes(
    state: &RunState,
    lookup: impl Fn(&RunState, &str) -> Option<UnitOutcome>,
    wanted: UnitOutcome,
) -> usize {
    state
        .outline()
        .unwrap_or_default()
        .iter()
        .filter(|spec| lookup(state, &spec.id) == Some(wanted))
        .count()
}

fn exceeds_tolerance(failed: usize, total: usize, tolerance: f64) -> bool {
    if total == 0 || failed == 0 {
        return false;
    }
    failed as f64 / total as f64 > tolerance
}
