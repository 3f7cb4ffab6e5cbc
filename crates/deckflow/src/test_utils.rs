//! Scripted collaborators for orchestrator tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    checkpoint::InMemoryCheckpointStore,
    providers::{
        ContentSource, ErrorKind, ImageProvider, ImageRef, OfflineContentSource, Renderer,
        SourceError, StyleContext,
    },
    quality::{Finding, FindingDimension, QualityReport, Severity, SlideEvaluator},
    request::{ContentStyle, VisualTemplate},
    workflow::{SlideContent, SlideSpec, WorkflowConfig, WorkflowOrchestrator},
};

/// One call made to the content source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentCall {
    pub slide_id: String,
    pub guidance: Option<String>,
}

#[derive(Debug, Clone)]
enum Script {
    /// Fail with these kinds in order, then succeed
    FailTimes(VecDeque<ErrorKind>),
    Always(ErrorKind),
}

/// Offline content source with per-slide failure scripts, an optional delay and a call log
#[derive(Default)]
pub struct ScriptedContentSource {
    inner: OfflineContentSource,
    outline_failures: Mutex<VecDeque<SourceError>>,
    scripts: Mutex<HashMap<String, Script>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ContentCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next outline calls before returning a conventional outline
    pub fn fail_outline(self, errors: Vec<SourceError>) -> Self {
        self.outline_failures.lock().unwrap().extend(errors);
        self
    }

    pub fn fail_times(self, slide_id: &str, kinds: Vec<ErrorKind>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(slide_id.to_string(), Script::FailTimes(kinds.into()));
        self
    }

    pub fn fail_always(self, slide_id: &str, kind: ErrorKind) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(slide_id.to_string(), Script::Always(kind));
        self
    }

    pub fn calls(&self) -> Vec<ContentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, slide_id: &str) -> Vec<ContentCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.slide_id == slide_id)
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn scripted_error(&self, slide_id: &str) -> Option<SourceError> {
        let mut scripts = self.scripts.lock().unwrap();
        let kind = match scripts.get_mut(slide_id)? {
            Script::Always(kind) => *kind,
            Script::FailTimes(kinds) => kinds.pop_front()?,
        };
        Some(SourceError::new(kind, format!("scripted failure for {slide_id}")))
    }
}

#[async_trait]
impl ContentSource for ScriptedContentSource {
    async fn generate_outline(
        &self,
        topic: &str,
        slide_count: u32,
        style: ContentStyle,
    ) -> Result<Vec<SlideSpec>, SourceError> {
        let scripted = self.outline_failures.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        self.inner.generate_outline(topic, slide_count, style).await
    }

    async fn generate_slide_content(
        &self,
        spec: &SlideSpec,
        context: &StyleContext,
    ) -> Result<SlideContent, SourceError> {
        self.calls.lock().unwrap().push(ContentCall {
            slide_id: spec.id.clone(),
            guidance: context.guidance.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.scripted_error(&spec.id) {
            return Err(error);
        }
        self.inner.generate_slide_content(spec, context).await
    }
}

/// Evaluator returning a scripted score per call, with a major finding on each listed slide
pub struct ScriptedEvaluator {
    rounds: Mutex<VecDeque<(u8, Vec<String>)>>,
    last: Mutex<(u8, Vec<String>)>,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    /// Once the rounds run out the last one repeats
    pub fn new(rounds: Vec<(u8, Vec<&str>)>) -> Self {
        let rounds: VecDeque<(u8, Vec<String>)> = rounds
            .into_iter()
            .map(|(score, ids)| (score, ids.into_iter().map(String::from).collect()))
            .collect();
        let last = rounds.back().cloned().unwrap_or((100, Vec::new()));
        Self {
            rounds: Mutex::new(rounds),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlideEvaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        _outline: &[SlideSpec],
        _slides: &BTreeMap<String, SlideContent>,
        _style: ContentStyle,
    ) -> QualityReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let round = self.rounds.lock().unwrap().pop_front();
        let (score, ids) = match round {
            Some(round) => round,
            None => self.last.lock().unwrap().clone(),
        };
        let findings = ids
            .into_iter()
            .map(|id| Finding {
                slide_id: Some(id),
                dimension: FindingDimension::StyleConsistency,
                severity: Severity::Major,
                message: "bullets are too long".to_string(),
            })
            .collect();
        QualityReport { score, findings }
    }
}

/// Renderer that keeps the assembled decks in memory
#[derive(Default)]
pub struct RecordingRenderer {
    decks: Mutex<Vec<Vec<String>>>,
    fail_with: Option<ErrorKind>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(kind: ErrorKind) -> Self {
        Self {
            decks: Mutex::new(Vec::new()),
            fail_with: Some(kind),
        }
    }

    /// Slide ids of every assembled deck, in presentation order
    pub fn decks(&self) -> Vec<Vec<String>> {
        self.decks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn assemble(
        &self,
        outline: &[SlideSpec],
        slides: &BTreeMap<String, SlideContent>,
        template: VisualTemplate,
    ) -> Result<PathBuf, SourceError> {
        if let Some(kind) = self.fail_with {
            return Err(SourceError::new(kind, "renderer unavailable"));
        }
        let ids: Vec<String> = outline
            .iter()
            .filter(|spec| slides.contains_key(&spec.id))
            .map(|spec| spec.id.clone())
            .collect();
        let mut decks = self.decks.lock().unwrap();
        decks.push(ids);
        Ok(PathBuf::from(format!("memory/{}-{}.md", template, decks.len())))
    }
}

/// Image provider failing for every query
pub struct FailingImageProvider;

#[async_trait]
impl ImageProvider for FailingImageProvider {
    async fn search(&self, query: &str) -> Result<ImageRef, SourceError> {
        Err(SourceError::new(ErrorKind::QuotaExhausted, format!("no quota left for '{query}'")))
    }
}

/// Config with the default budgets and no backoff sleeps
pub fn fast_config() -> WorkflowConfig {
    WorkflowConfig::default().without_backoff()
}

/// Orchestrator over the given source with a recording renderer and an in-memory store
pub fn orchestrator_with(
    content: Arc<ScriptedContentSource>,
    renderer: Arc<RecordingRenderer>,
    store: Arc<InMemoryCheckpointStore>,
) -> WorkflowOrchestrator {
    WorkflowOrchestrator::builder(content, renderer)
        .checkpoint_store(store)
        .config(fast_config())
        .build()
}
