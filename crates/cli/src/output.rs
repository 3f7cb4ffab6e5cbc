//! Output formatting and terminal rendering
//!
//! Renders run progress, outlines and final reports with colors.

use colored::Colorize;
use deckflow::{FailureKind, ProgressEvent, RunReport, SlideSpec, SlideType};

/// Output handler for terminal display
pub struct OutputHandler {
    /// Print every per-slide unit, not only stage changes
    pub show_units: bool,
}

impl OutputHandler {
    pub fn new(show_units: bool) -> Self {
        Self { show_units }
    }

    /// Print a section header
    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", format!("▶ {}", text).bright_yellow().bold());
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Print a success message
    pub fn print_success(&self, text: &str) {
        println!("{} {}", "✓".bright_green(), text.bright_white());
    }

    /// Print an error message
    pub fn print_error(&self, text: &str) {
        println!("{} {}", "✗".bright_red(), text.bright_red());
    }

    /// Print a warning message
    pub fn print_warning(&self, text: &str) {
        println!("{} {}", "⚠".bright_yellow(), text.yellow());
    }

    /// Print an info message
    pub fn print_info(&self, text: &str) {
        println!("{} {}", "ℹ".bright_blue(), text);
    }

    /// Print one progress event
    pub fn print_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StageStarted {
                fraction_complete,
                message,
                ..
            } => {
                println!("{} {}", progress_label(*fraction_complete).dimmed(), message.bright_white());
            }
            ProgressEvent::UnitFinished {
                stage,
                slide_id,
                succeeded,
                message,
                ..
            } => {
                if !self.show_units && *succeeded {
                    return;
                }
                let mark = if *succeeded {
                    "✓".bright_green()
                } else {
                    "✗".bright_red()
                };
                println!("      {} {} {} {}", mark, stage.to_string().dimmed(), slide_id, message.dimmed());
            }
            ProgressEvent::AwaitingApproval { outline, .. } => {
                self.print_info(&format!("Outline ready ({} slides), waiting for approval", outline.len()));
            }
            ProgressEvent::QualityEvaluated {
                score,
                threshold,
                findings,
                ..
            } => {
                let score_text = format!("{}/100", score);
                let score_colored = if score >= threshold {
                    score_text.bright_green()
                } else {
                    score_text.bright_yellow()
                };
                println!(
                    "      {} {} (threshold {}, {} findings)",
                    "Quality:".dimmed(),
                    score_colored,
                    threshold,
                    findings
                );
            }
            ProgressEvent::Completed { output_path, .. } => match output_path {
                Some(path) => self.print_success(&format!("Deck written to {}", path.display())),
                None => self.print_success("Run completed"),
            },
            ProgressEvent::Failed { reason, .. } => {
                let stage = reason
                    .stage
                    .map(|s| format!(" during {}", s))
                    .unwrap_or_default();
                match reason.kind {
                    FailureKind::Cancelled => self.print_warning(&format!("Run cancelled{}", stage)),
                    _ => self.print_error(&format!("Run failed{}: {}", stage, reason.message)),
                }
            }
        }
    }

    /// Print an outline for review
    pub fn print_outline(&self, outline: &[SlideSpec]) {
        self.print_header("Outline");
        for spec in outline {
            let kind = match spec.slide_type {
                SlideType::Cover => "cover",
                SlideType::Toc => "agenda",
                SlideType::Content => "content",
                SlideType::Closing => "closing",
            };
            println!(
                "  {:>3}. {:<50} {}",
                spec.index + 1,
                spec.title.bright_white(),
                kind.dimmed()
            );
        }
        println!();
    }

    /// Print the final run report
    pub fn print_report(&self, report: &RunReport) {
        self.print_header("Run report");

        let status = if report.succeeded() {
            report.status.to_string().bright_green()
        } else {
            report.status.to_string().bright_red()
        };
        println!("  {:<18} {}", "Run:".dimmed(), report.run_id.to_string().dimmed());
        println!("  {:<18} {}", "Topic:".dimmed(), report.topic.bright_white());
        println!("  {:<18} {}", "Status:".dimmed(), status);
        println!("  {:<18} {:.1}s", "Duration:".dimmed(), report.duration_ms as f64 / 1000.0);
        println!(
            "  {:<18} {} generated, {} placeholders, {} images",
            "Slides:".dimmed(),
            report.slides_generated,
            report.placeholder_slides,
            report.images_added
        );
        if let Some(score) = report.quality_score {
            println!(
                "  {:<18} {}/100 ({} findings, {} regeneration cycles)",
                "Quality:".dimmed(),
                score,
                report.findings,
                report.regeneration_cycles
            );
        }
        if report.total_retries() > 0 {
            let per_stage: Vec<String> = report
                .retry_counts
                .iter()
                .map(|(stage, retries)| format!("{} {}", stage, retries))
                .collect();
            println!("  {:<18} {}", "Retries:".dimmed(), per_stage.join(", "));
        }
        if !report.errors.is_empty() {
            println!("  {:<18} {}", "Errors:".dimmed(), report.errors.len().to_string().yellow());
        }
        if let Some(fatal) = &report.first_fatal_error {
            let slide = fatal.slide_id.as_deref().unwrap_or("-");
            println!(
                "  {:<18} {} {} ({}): {}",
                "First fatal:".dimmed(),
                fatal.stage,
                slide,
                fatal.kind,
                fatal.message.bright_red()
            );
        }
        if let Some(path) = &report.output_path {
            println!("  {:<18} {}", "Output:".dimmed(), path.display().to_string().bright_cyan());
        }
        println!();
    }
}

fn progress_label(fraction: f32) -> String {
    format!("[{:>3}%]", (fraction.clamp(0.0, 1.0) * 100.0).round() as u32)
}
