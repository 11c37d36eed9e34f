use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use opstriage::config::Config;
use opstriage::ingest::source::read_records;
use opstriage::ingest::Normalizer;
use opstriage::model::Case;
use opstriage::pipeline::engine::spawn_workers;
use opstriage::report::{render, Window};

#[derive(Parser)]
#[command(
    name = "opstriage",
    about = "Auto-analysis agent for IT operations events",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Ingest a CSV or JSON-lines event export through the pipeline
    Ingest {
        /// Path to the export file
        file: PathBuf,

        /// Number of pipeline workers
        #[arg(long, default_value = "4")]
        workers: usize,
    },

    /// Re-run dead-lettered records through the pipeline
    ReplayDeadLetters {
        /// Maximum records to replay
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Classify a single event description against the case index
    Classify {
        /// Event description text
        text: String,
    },

    /// Import resolved cases from a JSON-lines file and index them
    ImportCases {
        /// Path to the case file
        file: PathBuf,
    },

    /// Generate and print the report for the most recent final window
    Report {
        /// Window length in minutes (overrides the config file)
        #[arg(long)]
        window_minutes: Option<i64>,
    },

    /// Re-embed and re-index every stored case
    Reindex,

    /// Manage scheduled jobs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Add a new schedule
    Add {
        /// Schedule name
        #[arg(long)]
        name: String,

        /// Cron expression (6-field, seconds first)
        #[arg(long)]
        cron: String,

        /// Job to run: report, report:<minutes>, or scan
        #[arg(long)]
        job: String,
    },

    /// Remove a schedule
    Remove {
        /// Schedule name
        #[arg(long)]
        name: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            tracing::info!(%bind, "starting opstriage daemon");
            let runtime = opstriage::build_runtime(config).await?;
            opstriage::serve(runtime, &bind).await?;
        }
        Commands::Ingest { file, workers } => {
            let records = read_records(&file)?;
            let total = records.len();
            tracing::info!(file = %file.display(), total, "ingesting export");

            let runtime = opstriage::build_runtime(config).await?;
            let (handle, worker_handles) =
                spawn_workers(Arc::clone(&runtime.pipeline), workers, 64);
            for record in records {
                handle.submit(record).await?;
            }
            drop(handle);
            for w in worker_handles {
                w.await?;
            }

            let pending = opstriage::storage::pending_dead_letters(&runtime.pool, total.max(1))?;
            println!(
                "Ingested {} records ({} dead-lettered).",
                total,
                pending.len()
            );
        }
        Commands::ReplayDeadLetters { limit } => {
            let runtime = opstriage::build_runtime(config).await?;
            let replayed = runtime.pipeline.replay_dead_letters(limit).await?;
            println!("Replayed {} dead-lettered records.", replayed);
        }
        Commands::Classify { text } => {
            let runtime = opstriage::build_runtime(config).await?;
            let raw = serde_json::json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "description": text,
                "source": "cli",
            });
            match runtime.pipeline.handle_raw(&raw).await {
                Ok(c) => {
                    println!("Category:   {}", c.category);
                    println!("Confidence: {:.2}", c.confidence);
                    if c.supporting_cases.is_empty() {
                        println!("Support:    (none)");
                    } else {
                        println!("Support:    {}", c.supporting_cases.join(", "));
                    }
                }
                Err(e) => {
                    eprintln!("Classification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::ImportCases { file } => {
            let records = read_records(&file)?;
            let runtime = opstriage::build_runtime(config).await?;
            let normalizer = Normalizer::new("case-import");
            let mut imported = 0;
            for record in &records {
                let case = parse_case(&normalizer, record)?;
                runtime
                    .indexer
                    .index_case(&case)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to index case '{}': {e}", case.id))?;
                imported += 1;
            }
            println!("Imported and indexed {} cases.", imported);
        }
        Commands::Report { window_minutes } => {
            let minutes = window_minutes.unwrap_or(config.report.window_minutes);
            anyhow::ensure!(minutes > 0, "window minutes must be positive");
            let late_grace_secs = config.report.late_grace_secs;
            let runtime = opstriage::build_runtime(config).await?;

            let window = Window::latest_final(minutes, late_grace_secs, chrono::Utc::now());
            match runtime.runner.publish_window_report(window)? {
                Some(report) => println!("{}", render::render_text(&report)),
                None => println!("Window already reported, no late arrivals."),
            }
        }
        Commands::Reindex => {
            let runtime = opstriage::build_runtime(config).await?;
            let total = runtime.indexer.reindex_all().await?;
            println!("Re-indexed {} cases.", total);
        }
        Commands::Schedule { action } => {
            let runtime = opstriage::build_runtime(config).await?;
            let scheduler = runtime.scheduler;

            match action {
                ScheduleAction::List => {
                    let list = scheduler.list().await?;
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!("{:<20} | {:<16} | {:<12} | Enabled", "Name", "Cron", "Job");
                        println!("{:-<20}-|-{:-<16}-|-{:-<12}-|-{:-<7}", "", "", "", "");
                        for entry in list {
                            println!(
                                "{:<20} | {:<16} | {:<12} | {}",
                                entry.name, entry.cron_expr, entry.job_type, entry.enabled
                            );
                        }
                    }
                }
                ScheduleAction::Add { name, cron, job } => {
                    scheduler.add(&name, &cron, &job).await?;
                    println!("Schedule '{}' added.", name);
                }
                ScheduleAction::Remove { name } => {
                    scheduler.remove(&name).await?;
                    println!("Schedule '{}' removed.", name);
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours).await?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for (time, name, job) in preview {
                            println!("{} : {} ({})", time, name, job);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Parse one case record: `{id, event: {...}, resolution, category}`.
fn parse_case(normalizer: &Normalizer, record: &serde_json::Value) -> Result<Case> {
    let id = record
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("case record missing 'id'"))?
        .to_string();
    let raw_event = record
        .get("event")
        .ok_or_else(|| anyhow::anyhow!("case '{}' missing 'event'", id))?;
    let event = normalizer
        .normalize(raw_event)
        .map_err(|e| anyhow::anyhow!("case '{}' has bad event: {e}", id))?;
    let resolution = record
        .get("resolution")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let category = record
        .get("category")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("case '{}' missing 'category'", id))?
        .parse()
        .map_err(|e| anyhow::anyhow!("case '{}': {e}", id))?;

    Ok(Case {
        id,
        event,
        resolution,
        category,
    })
}
