//! Deckflow CLI - turn a topic into a slide deck
//!
//! Drives the staged generation workflow with the built-in offline collaborators, persists
//! checkpoints to SQLite so interrupted runs can be resumed, and prints progress as it goes.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use deckflow::{ContentStyle, GenerationRequest, QualityMode, RunReport, VisualTemplate};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Deckflow - staged presentation generation
#[derive(Parser)]
#[command(name = "deckflow")]
#[command(author = "Deckflow Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generate slide decks through a checkpointed, quality-gated workflow")]
#[command(long_about = r#"
Deckflow turns a topic into a slide deck: outline, per-slide content, optional images,
quality review with bounded regeneration, and assembly into a Markdown deck.

Examples:
  deckflow generate "AI Trends" --slides 10
  deckflow generate "Onboarding" --review --quality high --confirm-outline
  deckflow runs                      # List interrupted runs
  deckflow resume <RUN_ID>           # Continue from the latest checkpoint
"#)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the final run report as JSON
    #[arg(long)]
    json: bool,

    /// Config file (defaults to ~/.deckflow/config.toml)
    #[arg(long, env = "DECKFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a deck for a topic
    Generate {
        /// Presentation topic
        topic: String,

        /// Number of slides
        #[arg(short, long, default_value = "10")]
        slides: u32,

        /// Content style (professional, creative, academic, startup, teaching)
        #[arg(long, default_value = "professional")]
        style: ContentStyle,

        /// Visual template (business, creative, academic, minimal)
        #[arg(long, default_value = "business")]
        template: VisualTemplate,

        /// Quality mode (fast, balanced, high)
        #[arg(short, long, default_value = "balanced")]
        quality: QualityMode,

        /// Search an image for each content slide
        #[arg(long)]
        images: bool,

        /// Score the deck and regenerate weak slides
        #[arg(long)]
        review: bool,

        /// Ask for outline approval before generating slides
        #[arg(long)]
        confirm_outline: bool,

        /// Output directory for the deck
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Resume an interrupted run from its latest checkpoint
    Resume {
        /// Run ID
        run_id: Uuid,
    },

    /// List runs that have not finished
    Runs,

    /// Configuration management
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Write the default configuration if no config file exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("deckflow={},deckflow_cli={},warn", log_level, log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };
    let output = output::OutputHandler::new(cli.verbose);

    match cli.command {
        Commands::Generate {
            topic,
            slides,
            style,
            template,
            quality,
            images,
            review,
            confirm_outline,
            output_dir,
        } => {
            let request = GenerationRequest::new(topic, slides)
                .with_style(style)
                .with_template(template)
                .with_quality(quality)
                .with_images(images)
                .with_review(review)
                .with_auto_approve(!confirm_outline);
            let report = commands::generate(&config, request, output_dir, &output).await?;
            finish(&report, cli.json)?;
        }
        Commands::Resume { run_id } => {
            let report = commands::resume(&config, run_id, &output).await?;
            finish(&report, cli.json)?;
        }
        Commands::Runs => {
            commands::list_unfinished(&config, &output).await?;
        }
        Commands::Config { show, init } => {
            let path = cli.config.clone().unwrap_or_else(config::Config::config_path);
            if init {
                commands::init_config(&path, &output)?;
            } else if show {
                commands::show_config(&config, &path, &output)?;
            } else {
                output.print_info(&format!("Config file: {}", path.display()));
            }
        }
    }

    Ok(())
}

/// Optionally dump the report, and exit non-zero for failed runs
fn finish(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
