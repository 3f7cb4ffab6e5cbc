//! CLI subcommand handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use deckflow::{
    CheckpointStore, GenerationRequest, MarkdownRenderer, OfflineContentSource,
    PlaceholderImageProvider, ProgressEvent, RunHandle, RunReport, SqliteCheckpointStore,
    WorkflowOrchestrator,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use uuid::Uuid;

use crate::{config::Config, output::OutputHandler};

/// Wire the offline collaborators and the sqlite checkpoint store
pub async fn build_orchestrator(
    config: &Config,
    output_dir: &Path,
) -> Result<(WorkflowOrchestrator, Arc<SqliteCheckpointStore>)> {
    let store = SqliteCheckpointStore::open(&config.output.checkpoint_db)
        .await
        .with_context(|| format!("opening {}", config.output.checkpoint_db.display()))?;
    let store = Arc::new(store);

    let orchestrator = WorkflowOrchestrator::builder(
        Arc::new(OfflineContentSource::new()),
        Arc::new(MarkdownRenderer::new(output_dir)),
    )
    .images(Arc::new(PlaceholderImageProvider::default()))
    .checkpoint_store(store.clone())
    .config(config.workflow.clone())
    .build();

    Ok((orchestrator, store))
}

/// Generate a deck and follow the run to the end
pub async fn generate(
    config: &Config,
    request: GenerationRequest,
    output_dir: Option<PathBuf>,
    output: &OutputHandler,
) -> Result<RunReport> {
    let output_dir = output_dir.unwrap_or_else(|| config.output.directory.clone());
    let (orchestrator, _) = build_orchestrator(config, &output_dir).await?;

    output.print_header(&format!("Generating '{}' ({} slides)", request.topic, request.slide_count));
    let handle = orchestrator.submit(request).await?;
    output.print_info(&format!("Run {}", handle.run_id().to_string().dimmed()));

    follow(&orchestrator, handle, output).await
}

/// Continue an interrupted run from its latest checkpoint
pub async fn resume(config: &Config, run_id: Uuid, output: &OutputHandler) -> Result<RunReport> {
    let (orchestrator, _) = build_orchestrator(config, &config.output.directory).await?;

    output.print_header(&format!("Resuming run {}", run_id));
    let handle = orchestrator.resume(run_id).await?;

    follow(&orchestrator, handle, output).await
}

/// List runs whose latest checkpoint is not terminal
pub async fn list_unfinished(config: &Config, output: &OutputHandler) -> Result<()> {
    let (_, store) = build_orchestrator(config, &config.output.directory).await?;

    output.print_header("Unfinished runs");
    let runs = store.unfinished_runs().await?;
    if runs.is_empty() {
        output.print_info("No unfinished runs.");
        return Ok(());
    }

    println!(
        "{}",
        format!("{:<36} {:<28} {:<26} {:>6}", "ID", "Topic", "Status", "Slides")
            .bright_white()
            .bold()
    );
    println!("{}", "─".repeat(100).dimmed());
    for run_id in runs {
        let checkpoint = store.load(run_id).await?;
        let state = &checkpoint.state;
        println!(
            "{:<36} {:<28} {:<26} {:>6}",
            run_id.to_string().dimmed(),
            truncate(&state.request.topic, 28).bright_white(),
            checkpoint.status.to_string(),
            format!("{}/{}", state.slides().len(), state.request.slide_count)
        );
    }
    println!();
    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &Config, path: &Path, output: &OutputHandler) -> Result<()> {
    output.print_header("Configuration");
    println!("  {} {}", "File:".dimmed(), path.display());
    println!();
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Write the default configuration unless a file is already there
pub fn init_config(path: &Path, output: &OutputHandler) -> Result<()> {
    if path.exists() {
        output.print_warning(&format!("{} already exists, leaving it untouched", path.display()));
        return Ok(());
    }
    Config::default().save_to(path)?;
    output.print_success(&format!("Wrote default configuration to {}", path.display()));
    Ok(())
}

/// Print events until the run finishes, answering the outline prompt and Ctrl-C on the way
async fn follow(
    orchestrator: &WorkflowOrchestrator,
    mut handle: RunHandle,
    output: &OutputHandler,
) -> Result<RunReport> {
    let run_id = handle.run_id();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else { break };
                output.print_event(&event);

                if let ProgressEvent::AwaitingApproval { outline, .. } = &event {
                    output.print_outline(outline);
                    match prompt_approval(&mut stdin).await? {
                        ApprovalAnswer::Approve => orchestrator.approve(run_id).await?,
                        ApprovalAnswer::Reject(reason) => orchestrator.reject(run_id, reason).await?,
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                output.print_warning("Interrupted, cancelling run");
                if let Err(e) = orchestrator.cancel(run_id).await {
                    tracing::debug!("Cancel after interrupt ignored: {}", e);
                }
            }
        }
    }

    let report = handle.wait().await?;
    output.print_report(&report);
    Ok(report)
}

#[derive(Debug, PartialEq, Eq)]
enum ApprovalAnswer {
    Approve,
    Reject(String),
}

async fn prompt_approval(stdin: &mut Lines<BufReader<Stdin>>) -> Result<ApprovalAnswer> {
    println!(
        "{}",
        "Approve this outline? [y]es, or type a reason to reject:".bright_yellow()
    );
    let line = stdin.next_line().await?;
    Ok(parse_approval(line.as_deref()))
}

fn parse_approval(line: Option<&str>) -> ApprovalAnswer {
    let Some(line) = line else {
        return ApprovalAnswer::Reject("no answer on stdin".to_string());
    };
    match line.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => ApprovalAnswer::Approve,
        "n" | "no" => ApprovalAnswer::Reject("rejected at prompt".to_string()),
        _ => ApprovalAnswer::Reject(line.trim().to_string()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut)
}
