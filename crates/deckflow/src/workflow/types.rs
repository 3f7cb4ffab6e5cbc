//! Core types for a generation run: statuses, slides, error records and the run state

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    providers::{ErrorKind, ImageRef},
    quality::{Finding, Severity},
    request::GenerationRequest,
    DeckflowError, Result,
};

/// Named phase of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Outline,
    Content,
    Images,
    Review,
    Regeneration,
    Assembly,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Outline => "outline",
            Stage::Content => "content",
            Stage::Images => "images",
            Stage::Review => "review",
            Stage::Regeneration => "regeneration",
            Stage::Assembly => "assembly",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a run; Completed and Failed are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    OutlineGenerating,
    AwaitingOutlineApproval,
    ContentGenerating,
    ImageEnriching,
    Reviewing,
    Regenerating,
    Assembling,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::OutlineGenerating => "outline_generating",
            RunStatus::AwaitingOutlineApproval => "awaiting_outline_approval",
            RunStatus::ContentGenerating => "content_generating",
            RunStatus::ImageEnriching => "image_enriching",
            RunStatus::Reviewing => "reviewing",
            RunStatus::Regenerating => "regenerating",
            RunStatus::Assembling => "assembling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Stage whose work runs while the run sits in this status
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunStatus::OutlineGenerating | RunStatus::AwaitingOutlineApproval => Some(Stage::Outline),
            RunStatus::ContentGenerating => Some(Stage::Content),
            RunStatus::ImageEnriching => Some(Stage::Images),
            RunStatus::Reviewing => Some(Stage::Review),
            RunStatus::Regenerating => Some(Stage::Regeneration),
            RunStatus::Assembling => Some(Stage::Assembly),
            RunStatus::Pending | RunStatus::Completed | RunStatus::Failed => None,
        }
    }

    /// Direct successors excluding the implicit edge to Failed
    pub fn successors(&self) -> &'static [RunStatus] {
        use RunStatus::*;
        match self {
            Pending => &[OutlineGenerating],
            OutlineGenerating => &[AwaitingOutlineApproval, ContentGenerating],
            AwaitingOutlineApproval => &[ContentGenerating],
            ContentGenerating => &[ImageEnriching, Reviewing, Assembling],
            ImageEnriching => &[Reviewing, Assembling],
            Reviewing => &[Regenerating, Assembling],
            Regenerating => &[Reviewing],
            Assembling => &[Completed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RunStatus::Failed || self.successors().contains(&next)
    }

    /// Coarse position used for progress fractions
    pub fn progress(&self) -> f32 {
        match self {
            RunStatus::Pending => 0.0,
            RunStatus::OutlineGenerating => 0.05,
            RunStatus::AwaitingOutlineApproval => 0.2,
            RunStatus::ContentGenerating => 0.25,
            RunStatus::ImageEnriching => 0.65,
            RunStatus::Reviewing => 0.8,
            RunStatus::Regenerating => 0.85,
            RunStatus::Assembling => 0.9,
            RunStatus::Completed | RunStatus::Failed => 1.0,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlideType {
    Cover,
    Toc,
    Content,
    Closing,
}

/// One outline entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideSpec {
    pub id: String,
    pub index: u32,
    pub title: String,
    pub slide_type: SlideType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SlideSpec {
    pub fn new(index: u32, title: impl Into<String>, slide_type: SlideType) -> Self {
        Self {
            id: format!("slide-{:02}", index + 1),
            index,
            title: title.into(),
            slide_type,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Generated body of one slide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideContent {
    pub title: String,
    pub bullets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    /// Set when generation failed and the slide carries fallback text
    #[serde(default)]
    pub placeholder: bool,
}

impl SlideContent {
    pub fn new(title: impl Into<String>, bullets: Vec<String>) -> Self {
        Self {
            title: title.into(),
            bullets,
            notes: None,
            image: None,
            placeholder: false,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Fallback used when a slide exhausts its attempts
    pub fn placeholder(spec: &SlideSpec) -> Self {
        Self {
            title: spec.title.clone(),
            bullets: Vec::new(),
            notes: None,
            image: None,
            placeholder: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.placeholder || self.bullets.iter().all(|b| b.trim().is_empty())
    }
}

/// Terminal outcome of one per-slide unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded,
    Failed,
}

/// What finally happened to the unit that produced an error record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOutcome {
    /// A later attempt succeeded
    Recovered,
    /// The unit failed but the run carried on
    UnitFailed,
    /// The failure failed the run
    Fatal,
    /// The unit was abandoned because the run was cancelled
    Cancelled,
}

/// One non-nominal attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub slide_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    /// Another attempt followed this one
    pub retried: bool,
    pub outcome: ErrorOutcome,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn is_fatal(&self) -> bool {
        self.outcome == ErrorOutcome::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fatal,
    Rejected,
    ApprovalTimeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub stage: Option<Stage>,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }

    pub fn cancelled(stage: Option<Stage>) -> Self {
        Self::new(FailureKind::Cancelled, stage, "Cancelled")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub at: DateTime<Utc>,
}

/// Key of the retry counter map
pub fn retry_key(stage: Stage, slide_id: Option<&str>) -> String {
    format!("{}:{}", stage.as_str(), slide_id.unwrap_or("-"))
}

/// Mutable state of one run, owned by the orchestrator task driving it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub request: GenerationRequest,
    status: RunStatus,
    outline: Option<Vec<SlideSpec>>,
    outline_approved: bool,
    slides: BTreeMap<String, SlideContent>,
    content_outcomes: BTreeMap<String, UnitOutcome>,
    image_outcomes: BTreeMap<String, UnitOutcome>,
    errors: Vec<ErrorRecord>,
    quality_score: Option<u8>,
    quality_findings: Vec<Finding>,
    regeneration_cycles: u32,
    retry_counts: BTreeMap<String, u32>,
    transitions: Vec<StatusTransition>,
    failure: Option<FailureReason>,
    output_path: Option<PathBuf>,
    checkpoint_sequence: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            request,
            status: RunStatus::Pending,
            outline: None,
            outline_approved: false,
            slides: BTreeMap::new(),
            content_outcomes: BTreeMap::new(),
            image_outcomes: BTreeMap::new(),
            errors: Vec::new(),
            quality_score: None,
            quality_findings: Vec::new(),
            regeneration_cycles: 0,
            retry_counts: BTreeMap::new(),
            transitions: Vec::new(),
            failure: None,
            output_path: None,
            checkpoint_sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn outline(&self) -> Option<&[SlideSpec]> {
        self.outline.as_deref()
    }

    pub fn outline_approved(&self) -> bool {
        self.outline_approved
    }

    pub fn slides(&self) -> &BTreeMap<String, SlideContent> {
        &self.slides
    }

    pub fn slide(&self, slide_id: &str) -> Option<&SlideContent> {
        self.slides.get(slide_id)
    }

    pub fn content_outcome(&self, slide_id: &str) -> Option<UnitOutcome> {
        self.content_outcomes.get(slide_id).copied()
    }

    pub fn image_outcome(&self, slide_id: &str) -> Option<UnitOutcome> {
        self.image_outcomes.get(slide_id).copied()
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn quality_score(&self) -> Option<u8> {
        self.quality_score
    }

    pub fn quality_findings(&self) -> &[Finding] {
        &self.quality_findings
    }

    pub fn regeneration_cycles(&self) -> u32 {
        self.regeneration_cycles
    }

    pub fn retry_counts(&self) -> &BTreeMap<String, u32> {
        &self.retry_counts
    }

    pub fn transitions(&self) -> &[StatusTransition] {
        &self.transitions
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn output_path(&self) -> Option<&PathBuf> {
        self.output_path.as_ref()
    }

    pub fn checkpoint_sequence(&self) -> u64 {
        self.checkpoint_sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Outline entries in presentation order paired with their content
    pub fn ordered_slides(&self) -> Vec<(&SlideSpec, Option<&SlideContent>)> {
        self.outline
            .iter()
            .flatten()
            .map(|spec| (spec, self.slides.get(&spec.id)))
            .collect()
    }

    /// Outline entries without a terminal content outcome
    pub fn pending_content(&self) -> Vec<SlideSpec> {
        self.outline
            .iter()
            .flatten()
            .filter(|spec| !self.content_outcomes.contains_key(&spec.id))
            .cloned()
            .collect()
    }

    /// Content slides with generated text that have not been through image search
    pub fn pending_images(&self) -> Vec<SlideSpec> {
        self.outline
            .iter()
            .flatten()
            .filter(|spec| spec.slide_type == SlideType::Content)
            .filter(|spec| self.content_outcome(&spec.id) == Some(UnitOutcome::Succeeded))
            .filter(|spec| !self.image_outcomes.contains_key(&spec.id))
            .cloned()
            .collect()
    }

    /// Every outline entry has content
    pub fn is_complete(&self) -> bool {
        match &self.outline {
            Some(outline) => outline.iter().all(|spec| self.slides.contains_key(&spec.id)),
            None => false,
        }
    }

    /// Slides the evaluator wants regenerated, in outline order
    pub fn regeneration_candidates(&self) -> Vec<String> {
        let flagged = |min: Severity| -> Vec<String> {
            self.outline
                .iter()
                .flatten()
                .filter(|spec| {
                    self.quality_findings.iter().any(|f| {
                        f.slide_id.as_deref() == Some(spec.id.as_str()) && f.severity >= min
                    })
                })
                .map(|spec| spec.id.clone())
                .collect()
        };

        let major = flagged(Severity::Major);
        if major.is_empty() {
            flagged(Severity::Minor)
        } else {
            major
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DeckflowError::RunTerminal(self.run_id));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move along the state machine; only declared edges are accepted
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        let invalid = DeckflowError::InvalidTransition {
            from: self.status,
            to: next,
        };
        if !self.status.can_transition_to(next) {
            return Err(invalid);
        }
        if next == RunStatus::Completed && (!self.is_complete() || self.errors.iter().any(ErrorRecord::is_fatal)) {
            return Err(invalid);
        }

        let now = Utc::now();
        self.transitions.push(StatusTransition {
            from: self.status,
            to: next,
            at: now,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Set the outline; only allowed before any slide content exists
    pub fn set_outline(&mut self, outline: Vec<SlideSpec>) -> Result<()> {
        self.ensure_mutable()?;
        if !self.slides.is_empty() {
            return Err(DeckflowError::OutlineLocked(self.run_id));
        }
        self.outline = Some(outline);
        self.outline_approved = false;
        self.touch();
        Ok(())
    }

    pub fn approve_outline(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        self.outline_approved = true;
        self.touch();
        Ok(())
    }

    fn ensure_in_outline(&self, slide_id: &str) -> Result<()> {
        let known = self
            .outline
            .iter()
            .flatten()
            .any(|spec| spec.id == slide_id);
        if known {
            Ok(())
        } else {
            Err(DeckflowError::UnknownSlide(slide_id.to_string()))
        }
    }

    /// Store content for a slide, keeping any image already attached
    pub fn insert_slide(&mut self, slide_id: &str, mut content: SlideContent) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_in_outline(slide_id)?;
        if content.image.is_none() {
            content.image = self.slides.get(slide_id).and_then(|s| s.image.clone());
        }
        self.slides.insert(slide_id.to_string(), content);
        self.touch();
        Ok(())
    }

    pub fn attach_image(&mut self, slide_id: &str, image: ImageRef) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_in_outline(slide_id)?;
        let slide = self
            .slides
            .get_mut(slide_id)
            .ok_or_else(|| DeckflowError::UnknownSlide(slide_id.to_string()))?;
        slide.image = Some(image);
        self.touch();
        Ok(())
    }

    pub fn record_content_outcome(&mut self, slide_id: &str, outcome: UnitOutcome) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_in_outline(slide_id)?;
        self.content_outcomes.insert(slide_id.to_string(), outcome);
        Ok(())
    }

    pub fn record_image_outcome(&mut self, slide_id: &str, outcome: UnitOutcome) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_in_outline(slide_id)?;
        self.image_outcomes.insert(slide_id.to_string(), outcome);
        Ok(())
    }

    pub fn push_error(&mut self, record: ErrorRecord) -> Result<()> {
        self.ensure_mutable()?;
        self.errors.push(record);
        self.touch();
        Ok(())
    }

    /// Promote matching records to fatal once their stage crossed its tolerance
    pub(crate) fn mark_fatal(&mut self, matches: impl Fn(&ErrorRecord) -> bool) -> Result<()> {
        self.ensure_mutable()?;
        for record in self.errors.iter_mut().filter(|r| matches(r)) {
            record.outcome = ErrorOutcome::Fatal;
        }
        self.touch();
        Ok(())
    }

    /// Retries consumed by the latest execution of a unit
    pub fn set_retry_count(&mut self, stage: Stage, slide_id: Option<&str>, retries: u32) -> Result<()> {
        self.ensure_mutable()?;
        self.retry_counts.insert(retry_key(stage, slide_id), retries);
        Ok(())
    }

    pub fn retry_count(&self, stage: Stage, slide_id: Option<&str>) -> u32 {
        self.retry_counts
            .get(&retry_key(stage, slide_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_quality(&mut self, score: u8, findings: Vec<Finding>) -> Result<()> {
        self.ensure_mutable()?;
        self.quality_score = Some(score.min(100));
        self.quality_findings = findings;
        self.touch();
        Ok(())
    }

    pub fn begin_regeneration_cycle(&mut self) -> Result<u32> {
        self.ensure_mutable()?;
        self.regeneration_cycles += 1;
        self.touch();
        Ok(self.regeneration_cycles)
    }

    pub fn set_output_path(&mut self, path: PathBuf) -> Result<()> {
        self.ensure_mutable()?;
        self.output_path = Some(path);
        self.touch();
        Ok(())
    }

    /// Bump the sequence used for the next checkpoint write
    pub(crate) fn next_checkpoint_sequence(&mut self) -> u64 {
        self.checkpoint_sequence += 1;
        self.checkpoint_sequence
    }
}
