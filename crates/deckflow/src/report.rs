//! Read-only summary of a finished run

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    workflow::{ErrorRecord, FailureReason, RunState, RunStatus, Stage},
    DeckflowError, Result,
};

const STAGES: [Stage; 6] = [
    Stage::Outline,
    Stage::Content,
    Stage::Images,
    Stage::Review,
    Stage::Regeneration,
    Stage::Assembly,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub topic: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    /// Time spent in each stage, summed across the review loop
    pub stage_durations_ms: BTreeMap<Stage, u64>,
    pub quality_score: Option<u8>,
    pub findings: usize,
    pub errors: Vec<ErrorRecord>,
    pub first_fatal_error: Option<ErrorRecord>,
    pub failure: Option<FailureReason>,
    /// Retries consumed per stage, summed over its units
    pub retry_counts: BTreeMap<Stage, u32>,
    pub slides_generated: usize,
    pub placeholder_slides: usize,
    pub images_added: usize,
    pub regeneration_cycles: u32,
    pub output_path: Option<PathBuf>,
}

impl RunReport {
    /// Project a terminal run state
    pub fn from_state(state: &RunState) -> Result<Self> {
        if !state.status().is_terminal() {
            return Err(DeckflowError::RunNotFinished(state.run_id));
        }

        let transitions = state.transitions();
        let duration_ms = match (transitions.first(), transitions.last()) {
            (Some(first), Some(last)) => (last.at - first.at).num_milliseconds().max(0) as u64,
            _ => 0,
        };

        let mut stage_durations_ms = BTreeMap::new();
        for pair in transitions.windows(2) {
            if let Some(stage) = pair[1].from.stage() {
                let spent = (pair[1].at - pair[0].at).num_milliseconds().max(0) as u64;
                *stage_durations_ms.entry(stage).or_insert(0) += spent;
            }
        }

        let mut retry_counts = BTreeMap::new();
        for stage in STAGES {
            let prefix = format!("{}:", stage.as_str());
            let total: u32 = state
                .retry_counts()
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(_, retries)| *retries)
                .sum();
            if total > 0 {
                retry_counts.insert(stage, total);
            }
        }

        let slides = state.slides();
        Ok(Self {
            run_id: state.run_id,
            topic: state.request.topic.clone(),
            status: state.status(),
            duration_ms,
            stage_durations_ms,
            quality_score: state.quality_score(),
            findings: state.quality_findings().len(),
            errors: state.errors().to_vec(),
            first_fatal_error: state.errors().iter().find(|e| e.is_fatal()).cloned(),
            failure: state.failure().cloned(),
            retry_counts,
            slides_generated: slides.values().filter(|s| !s.placeholder).count(),
            placeholder_slides: slides.values().filter(|s| s.placeholder).count(),
            images_added: slides.values().filter(|s| s.image.is_some()).count(),
            regeneration_cycles: state.regeneration_cycles(),
            output_path: state.output_path().cloned(),
        })
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn total_retries(&self) -> u32 {
        self.retry_counts.values().sum()
    }
}
