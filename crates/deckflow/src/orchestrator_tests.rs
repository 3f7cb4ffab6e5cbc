//! End-to-end runs through the orchestrator with scripted collaborators

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use uuid::Uuid;

use crate::{
    checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore},
    events::ProgressEvent,
    providers::{offline::conventional_outline, ErrorKind, PlaceholderImageProvider, SourceError},
    report::RunReport,
    request::{ContentStyle, GenerationRequest, QualityMode},
    test_utils::{
        fast_config, orchestrator_with, FailingImageProvider, RecordingRenderer,
        ScriptedContentSource, ScriptedEvaluator,
    },
    workflow::{
        ErrorOutcome, FailureKind, RunState, RunStatus, SlideContent, SlideType, Stage,
        UnitOutcome, WorkflowOrchestrator,
    },
    DeckflowError,
};

struct Fixture {
    content: Arc<ScriptedContentSource>,
    renderer: Arc<RecordingRenderer>,
    store: Arc<InMemoryCheckpointStore>,
    orchestrator: WorkflowOrchestrator,
}

fn fixture(content: ScriptedContentSource) -> Fixture {
    let content = Arc::new(content);
    let renderer = Arc::new(RecordingRenderer::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let orchestrator = orchestrator_with(content.clone(), renderer.clone(), store.clone());
    Fixture {
        content,
        renderer,
        store,
        orchestrator,
    }
}

fn ai_trends() -> GenerationRequest {
    GenerationRequest::new("AI Trends", 10)
        .with_style(ContentStyle::Professional)
        .with_quality(QualityMode::Fast)
        .with_review(true)
}

#[tokio::test]
async fn test_fast_run_completes_with_full_deck() {
    let fx = fixture(ScriptedContentSource::new());

    let handle = fx.orchestrator.submit(ai_trends()).await.unwrap();
    let state = handle.join().await.unwrap();
    let report = RunReport::from_state(&state).unwrap();

    assert!(report.succeeded());
    assert_eq!(report.slides_generated, 10);
    assert_eq!(report.placeholder_slides, 0);
    assert_eq!(report.regeneration_cycles, 0);
    assert!(report.quality_score.is_some());
    assert!(report.errors.is_empty());
    assert!(report.output_path.is_some());

    let outline = state.outline().unwrap();
    let count = |t: SlideType| outline.iter().filter(|s| s.slide_type == t).count();
    assert_eq!(outline.len(), 10);
    assert_eq!(count(SlideType::Cover), 1);
    assert_eq!(count(SlideType::Toc), 1);
    assert_eq!(count(SlideType::Content), 7);
    assert_eq!(count(SlideType::Closing), 1);

    let decks = fx.renderer.decks();
    assert_eq!(decks.len(), 1);
    assert_eq!(decks[0].len(), 10);
    assert_eq!(decks[0][0], "slide-01");
}

#[tokio::test]
async fn test_offline_deck_passes_balanced_review_without_regeneration() {
    let fx = fixture(ScriptedContentSource::new());
    let request = ai_trends().with_quality(QualityMode::Balanced);

    let report = fx.orchestrator.submit(request).await.unwrap().wait().await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.findings, 0);
    assert_eq!(report.quality_score, Some(100));
    assert_eq!(report.regeneration_cycles, 0);
}

#[tokio::test]
async fn test_rate_limited_slide_with_other_failures_fails_run() {
    let content = ScriptedContentSource::new()
        .fail_always("slide-04", ErrorKind::RateLimited)
        .fail_always("slide-06", ErrorKind::InvalidRequest)
        .fail_always("slide-07", ErrorKind::InvalidRequest);
    let fx = fixture(content);

    let state = fx.orchestrator.submit(ai_trends()).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Failed);
    let failure = state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.stage, Some(Stage::Content));

    // Two retries under the content policy, then the unit gives up
    assert_eq!(fx.content.calls_for("slide-04").len(), 3);
    assert_eq!(state.retry_count(Stage::Content, Some("slide-04")), 2);
    let records: Vec<_> = state
        .errors()
        .iter()
        .filter(|e| e.slide_id.as_deref() == Some("slide-04"))
        .collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records.iter().map(|e| e.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(records[0].retried && records[1].retried && !records[2].retried);
    assert_eq!(records[2].outcome, ErrorOutcome::Fatal);

    // Permanent errors are not retried
    assert_eq!(fx.content.calls_for("slide-06").len(), 1);

    let report = RunReport::from_state(&state).unwrap();
    assert!(report.first_fatal_error.is_some());
    assert!(fx.renderer.decks().is_empty());
}

#[tokio::test]
async fn test_failures_within_tolerance_leave_placeholders() {
    let content = ScriptedContentSource::new()
        .fail_always("slide-06", ErrorKind::InvalidRequest)
        .fail_always("slide-07", ErrorKind::QuotaExhausted);
    let fx = fixture(content);

    let state = fx.orchestrator.submit(ai_trends()).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert!(state.slide("slide-06").unwrap().placeholder);
    assert_eq!(state.content_outcome("slide-07"), Some(UnitOutcome::Failed));
    assert!(state.errors().iter().all(|e| e.outcome == ErrorOutcome::UnitFailed));

    let report = RunReport::from_state(&state).unwrap();
    assert_eq!(report.placeholder_slides, 2);
    assert_eq!(report.slides_generated, 8);
}

#[tokio::test]
async fn test_transient_failures_recover_within_budget() {
    let content = ScriptedContentSource::new().fail_times("slide-03", vec![ErrorKind::Timeout, ErrorKind::RateLimited]);
    let fx = fixture(content);

    let state = fx.orchestrator.submit(ai_trends()).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.retry_count(Stage::Content, Some("slide-03")), 2);
    assert_eq!(state.errors().len(), 2);
    assert!(state.errors().iter().all(|e| e.outcome == ErrorOutcome::Recovered));
    assert!(!state.slide("slide-03").unwrap().placeholder);
    assert_eq!(RunReport::from_state(&state).unwrap().total_retries(), 2);
}

#[tokio::test]
async fn test_low_score_triggers_one_regeneration_cycle() {
    let content = Arc::new(ScriptedContentSource::new());
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![(60, vec!["slide-03"]), (90, vec![])]));
    let orchestrator = WorkflowOrchestrator::builder(content.clone(), Arc::new(RecordingRenderer::new()))
        .evaluator(evaluator.clone())
        .config(fast_config())
        .build();

    let request = GenerationRequest::new("Rust adoption", 6)
        .with_review(true)
        .with_quality(QualityMode::High);
    let state = orchestrator.submit(request).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.regeneration_cycles(), 1);
    assert_eq!(state.quality_score(), Some(90));
    assert_eq!(evaluator.calls(), 2);

    let calls = content.calls_for("slide-03");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].guidance.is_none());
    assert!(calls[1].guidance.as_deref().unwrap().contains("too long"));
    assert!(state
        .slide("slide-03")
        .unwrap()
        .notes
        .as_deref()
        .unwrap()
        .starts_with("Revised after review"));

    // Unflagged slides are generated once
    assert_eq!(content.calls_for("slide-02").len(), 1);
}

#[tokio::test]
async fn test_regeneration_stops_at_budget() {
    let content = Arc::new(ScriptedContentSource::new());
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![(40, vec!["slide-02"])]));
    let orchestrator = WorkflowOrchestrator::builder(content.clone(), Arc::new(RecordingRenderer::new()))
        .evaluator(evaluator.clone())
        .config(fast_config())
        .build();

    let request = GenerationRequest::new("Rust adoption", 5)
        .with_review(true)
        .with_quality(QualityMode::Balanced);
    let report = orchestrator.submit(request).await.unwrap().wait().await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.regeneration_cycles, 2);
    assert_eq!(report.quality_score, Some(40));
    assert_eq!(evaluator.calls(), 3);
    assert_eq!(content.calls_for("slide-02").len(), 3);
}

#[tokio::test]
async fn test_cancel_abandons_in_flight_units() {
    let fx = fixture(ScriptedContentSource::new().with_delay(Duration::from_secs(5)));

    let mut handle = fx
        .orchestrator
        .submit(GenerationRequest::new("Slow topic", 5))
        .await
        .unwrap();
    let run_id = handle.run_id();
    assert_eq!(handle.wait_for_status(RunStatus::ContentGenerating).await, RunStatus::ContentGenerating);

    assert_ok!(fx.orchestrator.cancel(run_id).await);
    let state = tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("cancellation should be prompt")
        .unwrap();

    assert_eq!(state.status(), RunStatus::Failed);
    let failure = state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.stage, Some(Stage::Content));
    assert!(state.slides().is_empty());

    let history = fx.store.history(run_id).await.unwrap();
    assert_eq!(history.last().unwrap().status, RunStatus::Failed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.store.history(run_id).await.unwrap().len(), history.len());

    assert!(matches!(
        fx.orchestrator.cancel(run_id).await,
        Err(DeckflowError::RunTerminal(_))
    ));
}

#[tokio::test]
async fn test_outline_approval_flow() {
    let fx = fixture(ScriptedContentSource::new());
    let request = GenerationRequest::new("Team onboarding", 5).with_auto_approve(false);

    let mut handle = fx.orchestrator.submit(request).await.unwrap();
    let run_id = handle.run_id();
    assert_eq!(
        handle.wait_for_status(RunStatus::AwaitingOutlineApproval).await,
        RunStatus::AwaitingOutlineApproval
    );
    assert_eq!(fx.orchestrator.status(run_id).await.unwrap(), RunStatus::AwaitingOutlineApproval);
    assert!(fx.content.calls().is_empty());

    let mut saw_outline = false;
    while let Some(event) = handle.next_event().await {
        if let ProgressEvent::AwaitingApproval { outline, .. } = &event {
            assert_eq!(outline.len(), 5);
            saw_outline = true;
            break;
        }
    }
    assert!(saw_outline);

    assert_ok!(fx.orchestrator.approve(run_id).await);
    let state = handle.join().await.unwrap();
    assert_eq!(state.status(), RunStatus::Completed);
    assert!(state.outline_approved());

    assert!(matches!(
        fx.orchestrator.approve(run_id).await,
        Err(DeckflowError::NotAwaitingApproval(_))
    ));
    assert!(matches!(
        fx.orchestrator.approve(Uuid::new_v4()).await,
        Err(DeckflowError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_rejected_outline_fails_run() {
    let fx = fixture(ScriptedContentSource::new());
    let request = GenerationRequest::new("Team onboarding", 5).with_auto_approve(false);

    let mut handle = fx.orchestrator.submit(request).await.unwrap();
    handle.wait_for_status(RunStatus::AwaitingOutlineApproval).await;
    assert_ok!(fx.orchestrator.reject(handle.run_id(), "wrong focus").await);

    let state = handle.join().await.unwrap();
    assert_eq!(state.status(), RunStatus::Failed);
    let failure = state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Rejected);
    assert_eq!(failure.message, "wrong focus");
    assert!(fx.content.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_approval_times_out() {
    let mut config = fast_config();
    config.approval_timeout_secs = Some(30);
    let orchestrator = WorkflowOrchestrator::builder(
        Arc::new(ScriptedContentSource::new()),
        Arc::new(RecordingRenderer::new()),
    )
    .config(config)
    .build();

    let request = GenerationRequest::new("Team onboarding", 5).with_auto_approve(false);
    let state = orchestrator.submit(request).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Failed);
    assert_eq!(state.failure().unwrap().kind, FailureKind::ApprovalTimeout);
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval() {
    let fx = fixture(ScriptedContentSource::new());
    let request = GenerationRequest::new("Team onboarding", 5).with_auto_approve(false);

    let mut handle = fx.orchestrator.submit(request).await.unwrap();
    handle.wait_for_status(RunStatus::AwaitingOutlineApproval).await;

    assert!(matches!(
        fx.orchestrator.resume(handle.run_id()).await,
        Err(DeckflowError::RunActive(_))
    ));

    fx.orchestrator.cancel(handle.run_id()).await.unwrap();
    let state = handle.join().await.unwrap();
    let failure = state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.stage, Some(Stage::Outline));
}

/// Run state as a crash would leave it: outline done, two slides written
fn partial_state() -> RunState {
    let mut state = RunState::new(GenerationRequest::new("Resumable", 5));
    state.transition(RunStatus::OutlineGenerating).unwrap();
    state.set_outline(conventional_outline("Resumable", 5)).unwrap();
    state.transition(RunStatus::ContentGenerating).unwrap();
    for id in ["slide-01", "slide-02"] {
        state
            .insert_slide(id, SlideContent::new("Hand written", vec![format!("kept {id}")]).with_notes("original"))
            .unwrap();
        state.record_content_outcome(id, UnitOutcome::Succeeded).unwrap();
    }
    state
}

#[tokio::test]
async fn test_resume_generates_only_missing_slides() {
    let fx = fixture(ScriptedContentSource::new());
    let mut partial = partial_state();
    let run_id = partial.run_id;
    let checkpoint = Checkpoint::capture(&mut partial);
    let saved_sequence = checkpoint.sequence;
    fx.store.save(checkpoint).await.unwrap();

    let state = fx.orchestrator.resume(run_id).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    let called: BTreeSet<String> = fx.content.calls().into_iter().map(|c| c.slide_id).collect();
    assert_eq!(
        called,
        ["slide-03", "slide-04", "slide-05"].into_iter().map(String::from).collect()
    );
    for id in ["slide-01", "slide-02"] {
        assert_eq!(
            serde_json::to_string(state.slide(id).unwrap()).unwrap(),
            serde_json::to_string(partial.slide(id).unwrap()).unwrap()
        );
    }

    let history = fx.store.history(run_id).await.unwrap();
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(history.iter().skip(1).all(|c| c.sequence > saved_sequence));
}

#[tokio::test]
async fn test_resume_rejects_unknown_and_finished_runs() {
    let fx = fixture(ScriptedContentSource::new());

    assert!(matches!(
        fx.orchestrator.resume(Uuid::new_v4()).await,
        Err(DeckflowError::CheckpointNotFound(_))
    ));

    let handle = fx.orchestrator.submit(GenerationRequest::new("Done", 3)).await.unwrap();
    let run_id = handle.run_id();
    handle.join().await.unwrap();
    assert_eq!(fx.orchestrator.cleanup_finished().await, 1);
    assert!(fx.orchestrator.runs().await.is_empty());

    assert!(matches!(
        fx.orchestrator.resume(run_id).await,
        Err(DeckflowError::RunTerminal(_))
    ));
    // Still answerable from the store
    assert_eq!(fx.orchestrator.status(run_id).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn test_checkpoints_only_hold_outlined_slides() {
    let content = Arc::new(ScriptedContentSource::new().fail_always("slide-05", ErrorKind::InvalidRequest));
    let store = Arc::new(InMemoryCheckpointStore::new());
    let orchestrator = WorkflowOrchestrator::builder(content, Arc::new(RecordingRenderer::new()))
        .images(Arc::new(PlaceholderImageProvider::default()))
        .checkpoint_store(store.clone())
        .config(fast_config())
        .build();

    let request = GenerationRequest::new("Checkpoints", 8)
        .with_images(true)
        .with_review(true)
        .with_quality(QualityMode::High);
    let handle = orchestrator.submit(request).await.unwrap();
    let run_id = handle.run_id();
    let state = handle.join().await.unwrap();

    let history = store.history(run_id).await.unwrap();
    assert_eq!(history.len(), state.transitions().len());
    assert_eq!(history.last().unwrap().status, state.status());
    for checkpoint in &history {
        let outline: BTreeSet<&str> = checkpoint
            .state
            .outline()
            .unwrap_or_default()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert!(checkpoint.state.slides().keys().all(|id| outline.contains(id.as_str())));
    }
}

#[tokio::test]
async fn test_events_are_ordered_and_end_once() {
    let fx = fixture(ScriptedContentSource::new());

    let mut handle = fx.orchestrator.submit(ai_trends()).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    handle.join().await.unwrap();

    assert!(matches!(
        events.first(),
        Some(ProgressEvent::StageStarted { status: RunStatus::OutlineGenerating, .. })
    ));
    assert!(matches!(events.last(), Some(ProgressEvent::Completed { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let fractions: Vec<f32> = events.iter().map(ProgressEvent::fraction_complete).collect();
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));

    let units = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::UnitFinished { stage: Stage::Content, .. }))
        .count();
    assert_eq!(units, 10);
}

#[tokio::test]
async fn test_submit_validates_request() {
    let fx = fixture(ScriptedContentSource::new());

    assert!(matches!(
        fx.orchestrator.submit(GenerationRequest::new("Too short", 2)).await,
        Err(DeckflowError::Validation(_))
    ));
    assert!(matches!(
        fx.orchestrator.submit(GenerationRequest::new("   ", 5)).await,
        Err(DeckflowError::Validation(_))
    ));
    assert!(fx.orchestrator.runs().await.is_empty());
}

#[tokio::test]
async fn test_image_failures_do_not_fail_run() {
    let orchestrator = WorkflowOrchestrator::builder(
        Arc::new(ScriptedContentSource::new()),
        Arc::new(RecordingRenderer::new()),
    )
    .images(Arc::new(FailingImageProvider))
    .config(fast_config())
    .build();

    let request = GenerationRequest::new("Images", 6).with_images(true);
    let report = orchestrator.submit(request).await.unwrap().wait().await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.images_added, 0);
    assert_eq!(report.errors.len(), 3);
    assert!(report
        .errors
        .iter()
        .all(|e| e.stage == Stage::Images && e.outcome == ErrorOutcome::UnitFailed));
}

#[tokio::test]
async fn test_images_attach_to_content_slides() {
    let orchestrator = WorkflowOrchestrator::builder(
        Arc::new(ScriptedContentSource::new()),
        Arc::new(RecordingRenderer::new()),
    )
    .images(Arc::new(PlaceholderImageProvider::default()))
    .config(fast_config())
    .build();

    let request = GenerationRequest::new("Images", 6).with_images(true);
    let state = orchestrator.submit(request).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    for (spec, content) in state.ordered_slides() {
        let has_image = content.unwrap().image.is_some();
        assert_eq!(has_image, spec.slide_type == SlideType::Content, "{}", spec.id);
    }
}

#[tokio::test]
async fn test_image_stage_skipped_without_provider() {
    let fx = fixture(ScriptedContentSource::new());
    let request = GenerationRequest::new("No images", 5).with_images(true);

    let state = fx.orchestrator.submit(request).await.unwrap().join().await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert!(state.transitions().iter().all(|t| t.to != RunStatus::ImageEnriching));
}

#[tokio::test]
async fn test_malformed_outline_is_retried() {
    let content = ScriptedContentSource::new().fail_outline(vec![SourceError::malformed("not json")]);
    let fx = fixture(content);

    let state = fx
        .orchestrator
        .submit(GenerationRequest::new("Retry outline", 4))
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.retry_count(Stage::Outline, None), 1);
    assert_eq!(state.errors()[0].outcome, ErrorOutcome::Recovered);
}

#[tokio::test]
async fn test_outline_failure_is_fatal() {
    let content = ScriptedContentSource::new()
        .fail_outline(vec![SourceError::new(ErrorKind::QuotaExhausted, "out of credits")]);
    let fx = fixture(content);

    let state = fx
        .orchestrator
        .submit(GenerationRequest::new("No outline", 4))
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    let failure = state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.stage, Some(Stage::Outline));
    assert!(state.outline().is_none());
}

#[tokio::test]
async fn test_assembly_failure_is_fatal() {
    let orchestrator = WorkflowOrchestrator::builder(
        Arc::new(ScriptedContentSource::new()),
        Arc::new(RecordingRenderer::failing(ErrorKind::WriteError)),
    )
    .config(fast_config())
    .build();

    let state = orchestrator
        .submit(GenerationRequest::new("Unwritable", 4))
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(state.status(), RunStatus::Failed);
    assert_eq!(state.failure().unwrap().stage, Some(Stage::Assembly));
    assert!(state.output_path().is_none());
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let content = Arc::new(ScriptedContentSource::new().with_delay(Duration::from_millis(20)));
    let mut config = fast_config();
    config.max_concurrency = 2;
    let orchestrator = WorkflowOrchestrator::builder(content.clone(), Arc::new(RecordingRenderer::new()))
        .config(config)
        .build();

    let report = orchestrator
        .submit(GenerationRequest::new("Throttled", 8))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(content.peak_in_flight() <= 2);
    assert_eq!(content.calls().len(), 8);
}

#[tokio::test]
async fn test_late_subscriber_gets_terminal_event() {
    let fx = fixture(ScriptedContentSource::new());
    let handle = fx
        .orchestrator
        .submit(GenerationRequest::new("Quarterly review", 3))
        .await
        .unwrap();
    let run_id = handle.run_id();
    let state = handle.join().await.unwrap();
    assert_eq!(state.status(), RunStatus::Completed);

    let mut events = fx.orchestrator.subscribe(run_id).await.unwrap();
    let first = tokio::time::timeout(Duration::from_millis(500), events.recv())
        .await
        .expect("finished run should replay its terminal event");
    match first {
        Some(ProgressEvent::Completed { output_path, .. }) => {
            assert_eq!(output_path, state.output_path().cloned());
        }
        other => panic!("expected Completed, got {other:?}"),
    }
    assert!(events.recv().await.is_none());

    // Still answered from the checkpoint store once the run is forgotten
    fx.orchestrator.cleanup_finished().await;
    let events = fx.orchestrator.subscribe(run_id).await.unwrap();
    let replayed = events.collect().await;
    assert_eq!(replayed.len(), 1);
    assert!(replayed[0].is_terminal());

    assert!(matches!(
        fx.orchestrator.subscribe(Uuid::new_v4()).await,
        Err(DeckflowError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_late_subscriber_gets_failure_reason() {
    let fx = fixture(ScriptedContentSource::new());
    let request = GenerationRequest::new("Team onboarding", 5).with_auto_approve(false);
    let mut handle = fx.orchestrator.submit(request).await.unwrap();
    let run_id = handle.run_id();
    handle.wait_for_status(RunStatus::AwaitingOutlineApproval).await;
    fx.orchestrator.reject(run_id, "wrong focus").await.unwrap();
    handle.join().await.unwrap();

    let events = fx.orchestrator.subscribe(run_id).await.unwrap();
    let replayed = tokio::time::timeout(Duration::from_millis(500), events.collect())
        .await
        .unwrap();
    match replayed.as_slice() {
        [ProgressEvent::Failed { reason, .. }] => {
            assert_eq!(reason.kind, FailureKind::Rejected);
            assert_eq!(reason.message, "wrong focus");
        }
        other => panic!("expected a single Failed event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_image_failures_beyond_tolerance_fail_run() {
    let mut config = fast_config();
    config.image_failure_tolerance = 0.2;
    let orchestrator = WorkflowOrchestrator::builder(
        Arc::new(ScriptedContentSource::new()),
        Arc::new(RecordingRenderer::new()),
    )
    .images(Arc::new(FailingImageProvider))
    .config(config)
    .build();

    let request = GenerationRequest::new("Images", 6).with_images(true);
    let state = orchestrator.submit(request).await.unwrap().join().await.unwrap();
    let report = RunReport::from_state(&state).unwrap();

    assert_eq!(state.status(), RunStatus::Failed);
    let failure = state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.stage, Some(Stage::Images));

    let image_errors: Vec<_> = state
        .errors()
        .iter()
        .filter(|e| e.stage == Stage::Images)
        .collect();
    assert_eq!(image_errors.len(), 3);
    assert!(image_errors.iter().all(|e| e.outcome == ErrorOutcome::Fatal));

    let fatal = report.first_fatal_error.unwrap();
    assert_eq!(fatal.stage, Stage::Images);
    assert_eq!(fatal.kind, ErrorKind::QuotaExhausted);
    assert!(report.output_path.is_none());
}

#[tokio::test]
async fn test_outline_is_decided_once() {
    let fx = fixture(ScriptedContentSource::new());
    let request = GenerationRequest::new("Team onboarding", 5).with_auto_approve(false);
    let mut handle = fx.orchestrator.submit(request).await.unwrap();
    let run_id = handle.run_id();
    handle.wait_for_status(RunStatus::AwaitingOutlineApproval).await;

    let (approved, rejected) = tokio::join!(
        fx.orchestrator.approve(run_id),
        fx.orchestrator.reject(run_id, "late")
    );
    let state = handle.join().await.unwrap();

    match (approved, rejected) {
        (Ok(()), Err(DeckflowError::NotAwaitingApproval(_))) => {
            assert_eq!(state.status(), RunStatus::Completed);
        }
        (Err(DeckflowError::NotAwaitingApproval(_)), Ok(())) => {
            assert_eq!(state.failure().unwrap().kind, FailureKind::Rejected);
        }
        other => panic!("exactly one signal should be accepted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_approval_racing_timeout_reports_outcome() {
    let mut config = fast_config();
    config.approval_timeout_secs = Some(30);
    let orchestrator = WorkflowOrchestrator::builder(
        Arc::new(ScriptedContentSource::new()),
        Arc::new(RecordingRenderer::new()),
    )
    .config(config)
    .build();

    let request = GenerationRequest::new("Team onboarding", 5).with_auto_approve(false);
    let mut handle = orchestrator.submit(request).await.unwrap();
    let run_id = handle.run_id();
    handle.wait_for_status(RunStatus::AwaitingOutlineApproval).await;

    tokio::time::advance(Duration::from_secs(31)).await;
    let approved = orchestrator.approve(run_id).await;
    let state = handle.join().await.unwrap();

    match approved {
        Ok(()) => {
            assert!(state.outline_approved());
            assert_eq!(state.status(), RunStatus::Completed);
        }
        Err(DeckflowError::NotAwaitingApproval(_)) => {
            assert!(!state.outline_approved());
            assert_eq!(state.failure().unwrap().kind, FailureKind::ApprovalTimeout);
        }
        Err(e) => panic!("unexpected approval error: {e}"),
    }
}
