//! Stage graph - declared status edges guarded by predicates over the run
//!
//! Conditional stage skipping lives here as data instead of nested branches in the
//! orchestrator: each edge names its source and target status and a guard evaluated against
//! the request, the run state and the config. Edges out of a status are tried in order.

use super::{RunState, RunStatus, WorkflowConfig};

/// Everything a guard may look at
#[derive(Debug, Clone, Copy)]
pub struct GraphContext<'a> {
    pub state: &'a RunState,
    pub config: &'a WorkflowConfig,
    /// An image provider is wired in
    pub images_available: bool,
}

impl<'a> GraphContext<'a> {
    pub fn new(state: &'a RunState, config: &'a WorkflowConfig, images_available: bool) -> Self {
        Self {
            state,
            config,
            images_available,
        }
    }

    fn wants_images(&self) -> bool {
        self.state.request.add_images && self.images_available
    }

    fn wants_review(&self) -> bool {
        self.state.request.enable_review
    }
}

pub type Guard = fn(&GraphContext<'_>) -> bool;

#[derive(Debug, Clone, Copy)]
pub struct GuardedEdge {
    pub from: RunStatus,
    pub to: RunStatus,
    pub label: &'static str,
    pub guard: Guard,
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    edges: Vec<GuardedEdge>,
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl StageGraph {
    /// The presentation pipeline
    pub fn standard() -> Self {
        use RunStatus::*;

        Self {
            edges: vec![
                edge(Pending, OutlineGenerating, "start", |_| true),
                edge(OutlineGenerating, AwaitingOutlineApproval, "needs approval", |ctx| {
                    !ctx.state.request.auto_approve_outline
                }),
                edge(OutlineGenerating, ContentGenerating, "auto approved", |ctx| {
                    ctx.state.request.auto_approve_outline
                }),
                edge(AwaitingOutlineApproval, ContentGenerating, "approved", |ctx| {
                    ctx.state.outline_approved()
                }),
                edge(ContentGenerating, ImageEnriching, "add images", |ctx| ctx.wants_images()),
                edge(ContentGenerating, Reviewing, "review", |ctx| {
                    !ctx.wants_images() && ctx.wants_review()
                }),
                edge(ContentGenerating, Assembling, "straight to assembly", |ctx| {
                    !ctx.wants_images() && !ctx.wants_review()
                }),
                edge(ImageEnriching, Reviewing, "review", |ctx| ctx.wants_review()),
                edge(ImageEnriching, Assembling, "skip review", |ctx| !ctx.wants_review()),
                edge(Reviewing, Regenerating, "below threshold", needs_regeneration),
                edge(Reviewing, Assembling, "quality accepted", |ctx| !needs_regeneration(ctx)),
                edge(Regenerating, Reviewing, "re-evaluate", |_| true),
                edge(Assembling, Completed, "assembled", |ctx| ctx.state.output_path().is_some()),
            ],
        }
    }

    pub fn edges(&self) -> &[GuardedEdge] {
        &self.edges
    }

    pub fn edges_from(&self, from: RunStatus) -> impl Iterator<Item = &GuardedEdge> {
        self.edges.iter().filter(move |edge| edge.from == from)
    }

    /// First edge out of `from` whose guard passes
    pub fn next(&self, from: RunStatus, ctx: &GraphContext<'_>) -> Option<&GuardedEdge> {
        self.edges_from(from).find(|edge| (edge.guard)(ctx))
    }
}

fn edge(from: RunStatus, to: RunStatus, label: &'static str, guard: Guard) -> GuardedEdge {
    GuardedEdge {
        from,
        to,
        label,
        guard,
    }
}

/// Score below the mode threshold, budget left, and something to regenerate
fn needs_regeneration(ctx: &GraphContext<'_>) -> bool {
    let Some(score) = ctx.state.quality_score() else {
        return false;
    };
    let threshold = ctx.config.threshold(ctx.state.request.quality_mode);
    score < threshold
        && ctx.state.regeneration_cycles() < ctx.config.regeneration_budget
        && !ctx.state.regeneration_candidates().is_empty()
}
