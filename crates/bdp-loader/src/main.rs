//! BDP Loader - batch-staging and bulk-load tool

use anyhow::{bail, Context, Result};
use bdp_common::logging::{init_logging, LogConfig, LogLevel};
use bdp_loader::config::LoaderConfig;
use bdp_loader::context::PipelineContext;
use bdp_loader::replay;
use bdp_loader::store::{self, StoreKind};
use bdp_loader::summary::RunSummary;
use bdp_loader::template::load_templates;
use bdp_loader::{JsonLinesProducer, ProcessSupervisor, RecordProducer};
use clap::Parser;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bdp-loader")]
#[command(author, version, about = "BDP graph loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Extract, stage and load source data
    Run {
        /// Directory holding one sub-directory per subtype
        #[arg(short, long)]
        source_dir: PathBuf,

        /// Template manifest (JSON)
        #[arg(short, long, env = "LOADER_TEMPLATES")]
        templates: PathBuf,

        /// Subtypes to load; defaults to every sub-directory of the source dir
        #[arg(long = "subtype")]
        subtypes: Vec<String>,

        /// Load the reduced test fixture
        #[arg(long)]
        test_data: bool,

        /// Target store
        #[arg(long, default_value = "memory")]
        store: StoreKind,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-run jobs retained by a failed run
    Replay {
        /// Failure manifest written by a previous run
        #[arg(short, long)]
        manifest: PathBuf,

        /// Template manifest (JSON)
        #[arg(short, long, env = "LOADER_TEMPLATES")]
        templates: PathBuf,

        /// Target store
        #[arg(long, default_value = "memory")]
        store: StoreKind,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate and list template descriptors
    Templates {
        /// Template manifest (JSON)
        #[arg(short, long, env = "LOADER_TEMPLATES")]
        templates: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("bdp-loader")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            source_dir,
            templates,
            subtypes,
            test_data,
            store,
            json,
        } => {
            let mut config = LoaderConfig::from_env().context("Invalid loader configuration")?;
            config.test_data |= test_data;
            let summary = run(&config, &source_dir, &templates, subtypes, store, json).await?;
            report(&summary, json)
        },
        Command::Replay {
            manifest,
            templates,
            store,
            json,
        } => {
            let config = LoaderConfig::from_env().context("Invalid loader configuration")?;
            let summary = replay_failed(&config, &manifest, &templates, store, json).await?;
            report(&summary, json)
        },
        Command::Templates { templates } => list_templates(&templates),
    }
}

async fn run(
    config: &LoaderConfig,
    source_dir: &Path,
    templates_path: &Path,
    subtypes: Vec<String>,
    store_kind: StoreKind,
    quiet: bool,
) -> Result<RunSummary> {
    let templates = load_templates(templates_path)
        .with_context(|| format!("Failed to load templates from {}", templates_path.display()))?;

    let subtypes = if subtypes.is_empty() {
        discover_subtypes(source_dir)?
    } else {
        subtypes
    };
    if subtypes.is_empty() {
        bail!("No subtypes found under {}", source_dir.display());
    }
    for subtype in &subtypes {
        if !source_dir.join(subtype).is_dir() {
            bail!("Subtype directory {} does not exist", source_dir.join(subtype).display());
        }
    }

    let store = store::connect(store_kind, &config.store, config.pool_size()?)
        .await
        .context("Failed to connect to graph store")?;
    let ctx = PipelineContext::new(config, templates.clone(), store)?;

    info!(
        subtypes = ?subtypes,
        store = %store_kind,
        test_data = config.test_data,
        batch_size = config.effective_batch_size(),
        "Starting load"
    );

    let producers: Vec<Box<dyn RecordProducer>> = subtypes
        .iter()
        .map(|subtype| {
            Box::new(
                JsonLinesProducer::new(
                    subtype.as_str(),
                    source_dir.join(subtype),
                    templates.clone(),
                    config.effective_batch_size(),
                )
                .with_max_batches(config.max_batches()),
            ) as Box<dyn RecordProducer>
        })
        .collect();

    cancel_on_ctrl_c(&ctx);
    let progress = spawn_progress(&ctx, quiet);
    let summary = ProcessSupervisor::new(ctx).run(producers).await;
    progress.finish_and_clear();

    Ok(summary)
}

async fn replay_failed(
    config: &LoaderConfig,
    manifest_path: &Path,
    templates_path: &Path,
    store_kind: StoreKind,
    quiet: bool,
) -> Result<RunSummary> {
    let templates = load_templates(templates_path)
        .with_context(|| format!("Failed to load templates from {}", templates_path.display()))?;
    if !manifest_path.is_file() {
        bail!("No failure manifest at {}", manifest_path.display());
    }

    let store = store::connect(store_kind, &config.store, config.pool_size()?)
        .await
        .context("Failed to connect to graph store")?;
    let ctx = PipelineContext::new(config, templates, store)?;

    cancel_on_ctrl_c(&ctx);
    let progress = spawn_progress(&ctx, quiet);
    let summary = replay::replay(ctx, manifest_path).await;
    progress.finish_and_clear();

    summary.with_context(|| format!("Failed to replay manifest {}", manifest_path.display()))
}

fn discover_subtypes(source_dir: &Path) -> Result<Vec<String>> {
    let mut subtypes = Vec::new();
    for entry in std::fs::read_dir(source_dir)
        .with_context(|| format!("Failed to read source directory {}", source_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            subtypes.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    subtypes.sort();
    Ok(subtypes)
}

fn cancel_on_ctrl_c(ctx: &PipelineContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctx.cancel();
        }
    });
}

fn spawn_progress(ctx: &PipelineContext, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let ctx = ctx.clone();
    let ticker = bar.clone();
    tokio::spawn(async move {
        while !ticker.is_finished() {
            let p = ctx.progress();
            ticker.set_message(format!(
                "queued {} | in progress {} | committed {} | failed {}",
                p.queue_depth, p.in_progress, p.committed, p.failed
            ));
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    });
    bar
}

fn report(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", summary.render_table());
    }

    if summary.is_success() {
        if !json {
            println!("{}", "Run succeeded".green().bold());
        }
        Ok(())
    } else {
        if !json {
            println!("{}", "Run failed".red().bold());
        }
        bail!(
            "{} failed jobs, {} blocking producer issues",
            summary.failed_jobs.len(),
            summary
                .producer_issues
                .iter()
                .filter(|i| i.kind.fails_run())
                .count()
        )
    }
}

fn list_templates(path: &Path) -> Result<()> {
    let templates =
        load_templates(path).with_context(|| format!("Failed to load templates from {}", path.display()))?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Template", "Mutation", "Commit size", "Columns", "File pattern"]);
    for template in &templates {
        table.add_row(vec![
            template.id().to_string(),
            template.mutation().kind().to_string(),
            template.commit_size().to_string(),
            template.mutation().required_columns().join(", "),
            template.file_pattern().to_string(),
        ]);
    }

    println!("{}", table);
    println!("{} templates valid", templates.len().to_string().bold());
    Ok(())
}
