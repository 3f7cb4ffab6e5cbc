//! Quality evaluation for a generated slide set
//!
//! Scores the deck on a 0..=100 scale against three dimensions: structural completeness,
//! per-style consistency and duplication between consecutive slides. Evaluation is a pure
//! function of its inputs, so unchanged content always gets the same score and findings.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    request::ContentStyle,
    workflow::{SlideContent, SlideSpec, SlideType},
};

/// Similarity at which two consecutive slides count as near-identical
const DUPLICATE_SIMILARITY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

impl Severity {
    fn penalty(&self) -> u32 {
        match self {
            Severity::Info => 0,
            Severity::Minor => 3,
            Severity::Major => 12,
            Severity::Critical => 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingDimension {
    Completeness,
    StyleConsistency,
    Duplication,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub slide_id: Option<String>,
    pub dimension: FindingDimension,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    fn slide(
        slide_id: &str,
        dimension: FindingDimension,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            slide_id: Some(slide_id.to_string()),
            dimension,
            severity,
            message: message.into(),
        }
    }

    /// Findings at or above major mark their slide for regeneration
    pub fn is_regeneration_trigger(&self) -> bool {
        self.severity >= Severity::Major
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: u8,
    pub findings: Vec<Finding>,
}

impl QualityReport {
    /// Guidance text for one slide built from its findings
    pub fn guidance_for(findings: &[Finding], slide_id: &str) -> Option<String> {
        let messages: Vec<&str> = findings
            .iter()
            .filter(|f| f.slide_id.as_deref() == Some(slide_id))
            .map(|f| f.message.as_str())
            .collect();
        if messages.is_empty() {
            None
        } else {
            Some(format!("Fix the following: {}", messages.join("; ")))
        }
    }
}

/// Seam for the review stage
#[async_trait]
pub trait SlideEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        outline: &[SlideSpec],
        slides: &BTreeMap<String, SlideContent>,
        style: ContentStyle,
    ) -> QualityReport;
}

/// Rubric-based evaluator
#[derive(Debug, Clone, Default)]
pub struct QualityEvaluator;

impl QualityEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Score and findings for a slide set
    pub fn score(
        &self,
        outline: &[SlideSpec],
        slides: &BTreeMap<String, SlideContent>,
        style: ContentStyle,
    ) -> QualityReport {
        let mut findings = Vec::new();
        let mut previous: Option<(&SlideSpec, &SlideContent)> = None;

        for spec in outline {
            let Some(content) = slides.get(&spec.id) else {
                findings.push(Finding::slide(
                    &spec.id,
                    FindingDimension::Completeness,
                    Severity::Critical,
                    format!("'{}' has no content", spec.title),
                ));
                previous = None;
                continue;
            };

            self.check_completeness(spec, content, &mut findings);
            self.check_style(spec, content, style, &mut findings);
            if let Some((prev_spec, prev_content)) = previous {
                self.check_duplication(prev_spec, prev_content, spec, content, &mut findings);
            }
            previous = Some((spec, content));
        }

        let penalty: u32 = findings.iter().map(|f| f.severity.penalty()).sum();
        let score = 100u32.saturating_sub(penalty) as u8;

        tracing::debug!("[QA] Scored {} slides: score={}, findings={}", outline.len(), score, findings.len());

        QualityReport { score, findings }
    }

    fn check_completeness(&self, spec: &SlideSpec, content: &SlideContent, findings: &mut Vec<Finding>) {
        if content.placeholder {
            findings.push(Finding::slide(
                &spec.id,
                FindingDimension::Completeness,
                Severity::Major,
                "content generation failed; slide holds placeholder text",
            ));
            return;
        }
        if content.title.trim().is_empty() {
            findings.push(Finding::slide(
                &spec.id,
                FindingDimension::Completeness,
                Severity::Minor,
                "slide title is empty",
            ));
        }
        let needs_body = matches!(spec.slide_type, SlideType::Content | SlideType::Toc);
        if needs_body && content.is_empty() {
            findings.push(Finding::slide(
                &spec.id,
                FindingDimension::Completeness,
                Severity::Major,
                "slide body is empty",
            ));
        }
    }

    fn check_style(
        &self,
        spec: &SlideSpec,
        content: &SlideContent,
        style: ContentStyle,
        findings: &mut Vec<Finding>,
    ) {
        if spec.slide_type != SlideType::Content || content.is_empty() {
            return;
        }
        let guidelines = style.guidelines();
        let bullets = content.bullets.len();

        if bullets < guidelines.min_bullets {
            findings.push(Finding::slide(
                &spec.id,
                FindingDimension::StyleConsistency,
                Severity::Minor,
                format!(
                    "{bullets} points is below the {} minimum for {style} style",
                    guidelines.min_bullets
                ),
            ));
        } else if bullets > guidelines.max_bullets {
            let severity = if bullets > guidelines.max_bullets + 2 {
                Severity::Major
            } else {
                Severity::Minor
            };
            findings.push(Finding::slide(
                &spec.id,
                FindingDimension::StyleConsistency,
                severity,
                format!(
                    "{bullets} points exceeds the {} maximum for {style} style",
                    guidelines.max_bullets
                ),
            ));
        }

        let longest = content.bullets.iter().map(|b| b.chars().count()).max().unwrap_or(0);
        if longest > guidelines.max_bullet_chars {
            let severity = if longest > guidelines.max_bullet_chars * 2 {
                Severity::Major
            } else {
                Severity::Minor
            };
            findings.push(Finding::slide(
                &spec.id,
                FindingDimension::StyleConsistency,
                severity,
                format!(
                    "a point runs {longest} characters; {style} style allows {}",
                    guidelines.max_bullet_chars
                ),
            ));
        }
    }

    fn check_duplication(
        &self,
        prev_spec: &SlideSpec,
        prev: &SlideContent,
        spec: &SlideSpec,
        content: &SlideContent,
        findings: &mut Vec<Finding>,
    ) {
        if prev.placeholder || content.placeholder {
            return;
        }
        let similarity = jaccard(&word_set(prev), &word_set(content));
        if similarity >= DUPLICATE_SIMILARITY {
            findings.push(Finding::slide(
                &spec.id,
                FindingDimension::Duplication,
                Severity::Major,
                format!(
                    "near-identical to '{}' ({:.0}% overlap)",
                    prev_spec.title,
                    similarity * 100.0
                ),
            ));
        }
    }
}

#[async_trait]
impl SlideEvaluator for QualityEvaluator {
    async fn evaluate(
        &self,
        outline: &[SlideSpec],
        slides: &BTreeMap<String, SlideContent>,
        style: ContentStyle,
    ) -> QualityReport {
        self.score(outline, slides, style)
    }
}

fn word_set(content: &SlideContent) -> BTreeSet<String> {
    std::iter::once(content.title.as_str())
        .chain(content.bullets.iter().map(String::as_str))
        .flat_map(str::split_whitespace)
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let total = a.union(b).count();
    shared as f64 / total as f64
}
