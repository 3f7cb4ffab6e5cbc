//! Tunable workflow thresholds and retry policies

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::QualityMode;

use super::{retry::RetryPolicy, Stage};

/// Configuration for the workflow orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_min_slides")]
    pub min_slides: u32,

    #[serde(default = "default_max_slides")]
    pub max_slides: u32,

    /// Concurrent per-slide units within one run
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Failed fraction of content units above which the stage is fatal
    #[serde(default = "default_content_failure_tolerance")]
    pub content_failure_tolerance: f64,

    /// Failed fraction of image units above which the stage is fatal
    #[serde(default = "default_image_failure_tolerance")]
    pub image_failure_tolerance: f64,

    #[serde(default = "default_regeneration_budget")]
    pub regeneration_budget: u32,

    #[serde(default)]
    pub thresholds: QualityThresholds,

    /// Fail a run left awaiting outline approval for this long
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: StagePolicies,
}

fn default_min_slides() -> u32 {
    3
}

fn default_max_slides() -> u32 {
    50
}

fn default_max_concurrency() -> usize {
    5
}

fn default_content_failure_tolerance() -> f64 {
    0.2
}

fn default_image_failure_tolerance() -> f64 {
    1.0
}

fn default_regeneration_budget() -> u32 {
    2
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            min_slides: default_min_slides(),
            max_slides: default_max_slides(),
            max_concurrency: default_max_concurrency(),
            content_failure_tolerance: default_content_failure_tolerance(),
            image_failure_tolerance: default_image_failure_tolerance(),
            regeneration_budget: default_regeneration_budget(),
            thresholds: QualityThresholds::default(),
            approval_timeout_secs: None,
            retry: StagePolicies::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn threshold(&self, mode: QualityMode) -> u8 {
        self.thresholds.for_mode(mode)
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs.map(Duration::from_secs)
    }

    pub fn policy(&self, stage: Stage) -> &RetryPolicy {
        self.retry.for_stage(stage)
    }

    /// Failure tolerance of a fan-out stage; single-unit stages tolerate nothing
    pub fn failure_tolerance(&self, stage: Stage) -> f64 {
        match stage {
            Stage::Content => self.content_failure_tolerance,
            Stage::Images => self.image_failure_tolerance,
            Stage::Regeneration => 1.0,
            Stage::Outline | Stage::Review | Stage::Assembly => 0.0,
        }
    }

    /// Same thresholds with zero-delay retries
    pub fn without_backoff(mut self) -> Self {
        for policy in self.retry.policies_mut() {
            policy.base_delay_ms = 0;
            policy.max_delay_ms = 0;
            policy.jitter = 0.0;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    #[serde(default)]
    pub fast: u8,

    #[serde(default = "default_balanced")]
    pub balanced: u8,

    #[serde(default = "default_high")]
    pub high: u8,
}

fn default_balanced() -> u8 {
    70
}

fn default_high() -> u8 {
    85
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            fast: 0,
            balanced: default_balanced(),
            high: default_high(),
        }
    }
}

impl QualityThresholds {
    pub fn for_mode(&self, mode: QualityMode) -> u8 {
        let threshold = match mode {
            QualityMode::Fast => self.fast,
            QualityMode::Balanced => self.balanced,
            QualityMode::High => self.high,
        };
        threshold.min(100)
    }
}

/// Retry policy per stage; regeneration reuses the content policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePolicies {
    #[serde(default = "default_outline_policy")]
    pub outline: RetryPolicy,

    #[serde(default = "default_content_policy")]
    pub content: RetryPolicy,

    #[serde(default = "default_images_policy")]
    pub images: RetryPolicy,

    #[serde(default = "default_assembly_policy")]
    pub assembly: RetryPolicy,
}

fn default_outline_policy() -> RetryPolicy {
    RetryPolicy::new(3)
}

fn default_content_policy() -> RetryPolicy {
    RetryPolicy::new(2)
}

fn default_images_policy() -> RetryPolicy {
    RetryPolicy::new(2)
}

fn default_assembly_policy() -> RetryPolicy {
    RetryPolicy::new(1)
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            outline: default_outline_policy(),
            content: default_content_policy(),
            images: default_images_policy(),
            assembly: default_assembly_policy(),
        }
    }
}

impl StagePolicies {
    pub fn for_stage(&self, stage: Stage) -> &RetryPolicy {
        match stage {
            Stage::Outline => &self.outline,
            Stage::Content | Stage::Regeneration | Stage::Review => &self.content,
            Stage::Images => &self.images,
            Stage::Assembly => &self.assembly,
        }
    }

    fn policies_mut(&mut self) -> [&mut RetryPolicy; 4] {
        [
            &mut self.outline,
            &mut self.content,
            &mut self.images,
            &mut self.assembly,
        ]
    }
}
