//! Wave CLI - multi-agent pipeline orchestrator.
//!
//! Events go to stdout as NDJSON; diagnostics and human-facing output go
//! to stderr so consumers can parse the event stream without filtering.
//!
//! Exit codes: 0 success, 1 general error, 2 usage error, 3 pipeline
//! failed, 4 validation error, 5 timeout, 130 interrupted.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use wave::audit::AuditLog;
use wave::dag;
use wave::error::WaveError;
use wave::events::EventSink;
use wave::executor::{ExecuteOptions, Executor, RunSummary};
use wave::manifest::Manifest;
use wave::pipeline::Pipeline;
use wave::state::{migrations::MigrationSettings, EventFilter, RunFilter, StateStore};
use wave::types::{RunId, RunStatus};
use wave::workspace::WorkspaceManager;
use wave::AdapterRegistry;

#[derive(Parser)]
#[command(name = "wave")]
#[command(about = "Wave - multi-agent pipeline orchestrator")]
#[command(version)]
struct Cli {
    /// Path to the manifest.
    #[arg(long, global = true, default_value = "wave.yaml")]
    manifest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a manifest, starter pipeline, and persona stubs
    Init,

    /// Statically check the manifest and every referenced pipeline
    Validate,

    /// Run a pipeline
    Run {
        #[arg(long)]
        pipeline: String,
        #[arg(long, default_value = "")]
        input: String,
        /// Print the layered execution plan without running anything
        #[arg(long)]
        dry_run: bool,
        /// Skip every step ordered before this one
        #[arg(long)]
        from_step: Option<String>,
        /// Per-step timeout override, minutes
        #[arg(long)]
        timeout: Option<u64>,
        /// Tags persisted on the run record
        #[arg(long)]
        tag: Vec<String>,
    },

    /// Run an ad-hoc task through a synthesized navigate -> execute pipeline
    Do {
        task: String,
        /// Persona for the execute step
        #[arg(long)]
        persona: Option<String>,
        /// Save the synthesized pipeline instead of discarding it
        #[arg(long)]
        save: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a crashed or failed run from its first incomplete step
    Resume {
        /// Run identifier
        #[arg(long)]
        pipeline: String,
        #[arg(long)]
        from_step: Option<String>,
    },

    /// Delete run state, workspaces, and traces
    Clean {
        #[arg(long)]
        all: bool,
        /// Restrict to runs of one pipeline
        #[arg(long)]
        pipeline: Option<String>,
        /// Keep the newest N runs
        #[arg(long)]
        keep_last: Option<usize>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// List pipelines, personas, or adapters
    List {
        #[arg(value_enum)]
        what: ListKind,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show the event log of a run
    Logs {
        /// Run identifier; defaults to the most recent run
        run_id: Option<String>,
        #[arg(long)]
        step: Option<String>,
        /// Errors only
        #[arg(long)]
        errors: bool,
        /// Last N events
        #[arg(long)]
        tail: Option<u32>,
        /// Only events newer than this duration (e.g. 30m, 2h, 1d)
        #[arg(long)]
        since: Option<String>,
        /// Minimum level: info or error
        #[arg(long)]
        level: Option<String>,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Serve the operations dashboard (requires a dashboard-enabled build)
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListKind {
    Pipelines,
    Personas,
    Adapters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Text,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode, WaveError> {
    match cli.command {
        Commands::Init => {
            let result = wave::init::init_project(Path::new("."))?;
            eprintln!("{} initialized Wave project", "ok:".green().bold());
            for file in result.files_created {
                eprintln!("  created {file}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate => validate(&cli.manifest),

        Commands::Run {
            pipeline,
            input,
            dry_run,
            from_step,
            timeout,
            tag,
        } => {
            let manifest = Arc::new(Manifest::load(&cli.manifest)?);
            let pipeline = find_pipeline(&manifest, &pipeline)?;
            if dry_run {
                print_plan(&manifest, &pipeline)?;
                return Ok(ExitCode::SUCCESS);
            }
            let options = ExecuteOptions {
                from_step,
                timeout: timeout.map(|minutes| Duration::from_secs(minutes * 60)),
                tags: tag,
            };
            let executor = build_executor(Arc::clone(&manifest)).await?;
            run_to_exit(executor.execute(&pipeline, &input, &options)).await
        }

        Commands::Do {
            task,
            persona,
            save,
            dry_run,
        } => {
            let manifest = Arc::new(Manifest::load(&cli.manifest)?);
            let executor_persona = persona.as_deref().unwrap_or("craftsman");
            let pipeline = Pipeline::synthesize_do("navigator", executor_persona);
            pipeline.ensure_valid(&manifest)?;

            if let Some(path) = save {
                std::fs::write(
                    &path,
                    serde_yaml::to_string(&pipeline)
                        .map_err(WaveError::Yaml)?,
                )?;
                eprintln!("saved synthesized pipeline to {}", path.display());
            }
            if dry_run {
                print_plan(&manifest, &pipeline)?;
                return Ok(ExitCode::SUCCESS);
            }
            let executor = build_executor(Arc::clone(&manifest)).await?;
            run_to_exit(executor.execute(&pipeline, &task, &ExecuteOptions::default())).await
        }

        Commands::Resume {
            pipeline: run_id,
            from_step,
        } => {
            let manifest = Arc::new(Manifest::load(&cli.manifest)?);
            let store = open_store(&manifest).await?;
            let run = store
                .get_run(&run_id)
                .await?
                .ok_or_else(|| WaveError::state_store(format!("unknown run '{run_id}'")))?;
            let pipeline = find_pipeline(&manifest, &run.pipeline_name)?;

            let options = ExecuteOptions {
                from_step,
                ..Default::default()
            };
            let executor = build_executor_with(Arc::clone(&manifest), store).await?;
            run_to_exit(executor.resume(&RunId::from_string(run_id), &pipeline, &options)).await
        }

        Commands::Clean {
            all,
            pipeline,
            keep_last,
            force,
            dry_run,
        } => clean(&cli.manifest, all, pipeline, keep_last, force, dry_run).await,

        Commands::List { what, format } => list(&cli.manifest, what, format),

        Commands::Logs {
            run_id,
            step,
            errors,
            tail,
            since,
            level,
            format,
        } => logs(&cli.manifest, run_id, step, errors, tail, since, level, format).await,

        Commands::Serve { port, bind, token } => {
            let _token = token.or_else(|| std::env::var("WAVE_SERVE_TOKEN").ok());
            eprintln!(
                "{} the operations dashboard is not compiled into this build; \
                 `serve` would bind {bind}:{port}",
                "error:".red().bold()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

// ============================================================================
// COMMAND BODIES
// ============================================================================

fn validate(manifest_path: &Path) -> Result<ExitCode, WaveError> {
    let manifest = match Manifest::load(manifest_path) {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!("{} {e}", "invalid:".red().bold());
            return Ok(ExitCode::from(4));
        }
    };

    let mut findings = 0usize;
    for (name, pipeline) in discover_pipelines(&manifest)? {
        let issues = pipeline.validate(&manifest);
        let dag_issue = dag::resolve(pipeline.name(), &pipeline.steps).err();
        if issues.is_empty() && dag_issue.is_none() {
            eprintln!("{} pipeline '{name}'", "ok:".green().bold());
        } else {
            for issue in issues {
                eprintln!("{} pipeline '{name}': {issue}", "invalid:".red().bold());
                findings += 1;
            }
            if let Some(e) = dag_issue {
                eprintln!("{} pipeline '{name}': {e}", "invalid:".red().bold());
                findings += 1;
            }
        }
    }

    if findings == 0 {
        eprintln!("{} manifest '{}'", "ok:".green().bold(), manifest.metadata.name);
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(4))
    }
}

async fn clean(
    manifest_path: &Path,
    all: bool,
    pipeline: Option<String>,
    keep_last: Option<usize>,
    force: bool,
    dry_run: bool,
) -> Result<ExitCode, WaveError> {
    if !all && pipeline.is_none() && keep_last.is_none() {
        eprintln!("clean requires --all, --pipeline <name>, or --keep-last <n>");
        return Ok(ExitCode::FAILURE);
    }

    let manifest = Arc::new(Manifest::load(manifest_path)?);
    let store = open_store(&manifest).await?;
    let workspaces = WorkspaceManager::new(
        manifest.resolve_path(&manifest.runtime.workspace_root),
        &manifest.base_dir,
    );

    let filter = RunFilter {
        pipeline: pipeline.clone(),
        ..Default::default()
    };
    let (runs, _) = store.list_runs(&filter, None, u32::MAX - 1).await?;
    let keep = keep_last.unwrap_or(0);
    let victims: Vec<_> = runs.iter().skip(keep).collect();

    if victims.is_empty() {
        eprintln!("nothing to clean");
        return Ok(ExitCode::SUCCESS);
    }
    if dry_run {
        for run in &victims {
            eprintln!("would delete {} ({})", run.run_id, run.status);
        }
        return Ok(ExitCode::SUCCESS);
    }
    if !force {
        eprintln!(
            "refusing to delete {} runs without --force (use --dry-run to preview)",
            victims.len()
        );
        return Ok(ExitCode::FAILURE);
    }

    let traces_dir = manifest.resolve_path(&manifest.runtime.traces_dir);
    let artifacts_dir = manifest.resolve_path(&manifest.runtime.artifacts_dir);
    for run in victims {
        store.delete_run(&run.run_id).await?;
        workspaces.remove_run(&run.run_id)?;
        let trace = traces_dir.join(format!("{}.ndjson", run.run_id));
        if trace.exists() {
            std::fs::remove_file(trace)?;
        }
        let views = artifacts_dir.join(&run.run_id);
        if views.exists() {
            std::fs::remove_dir_all(views)?;
        }
        eprintln!("deleted {}", run.run_id);
    }
    Ok(ExitCode::SUCCESS)
}

fn list(manifest_path: &Path, what: ListKind, format: OutputFormat) -> Result<ExitCode, WaveError> {
    let manifest = Manifest::load(manifest_path)?;

    let rows: Vec<(String, String, String)> = match what {
        ListKind::Pipelines => discover_pipelines(&manifest)?
            .into_iter()
            .map(|(name, pipeline)| {
                (
                    name,
                    format!("{} steps", pipeline.steps.len()),
                    pipeline
                        .metadata
                        .description
                        .unwrap_or_default(),
                )
            })
            .collect(),
        ListKind::Personas => manifest
            .personas
            .iter()
            .map(|(name, persona)| {
                (
                    name.clone(),
                    persona.adapter.clone(),
                    format!("temperature {:.1}", persona.temperature),
                )
            })
            .collect(),
        ListKind::Adapters => {
            let registry = AdapterRegistry::from_manifest(&manifest);
            manifest
                .adapters
                .iter()
                .map(|(name, spec)| {
                    let available = registry
                        .get(name)
                        .map(|a| a.is_available())
                        .unwrap_or(false);
                    (
                        name.clone(),
                        spec.binary.clone(),
                        if available { "available" } else { "unavailable" }.to_string(),
                    )
                })
                .collect()
        }
    };

    match format {
        OutputFormat::Json => {
            let json: Vec<_> = rows
                .iter()
                .map(|(name, detail, extra)| {
                    serde_json::json!({"name": name, "detail": detail, "info": extra})
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
        _ => {
            for (name, detail, extra) in rows {
                println!("{:<24} {:<24} {extra}", name.bold(), detail);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn logs(
    manifest_path: &Path,
    run_id: Option<String>,
    step: Option<String>,
    errors: bool,
    tail: Option<u32>,
    since: Option<String>,
    level: Option<String>,
    format: OutputFormat,
) -> Result<ExitCode, WaveError> {
    let manifest = Arc::new(Manifest::load(manifest_path)?);
    let store = open_store(&manifest).await?;

    let run_id = match run_id {
        Some(id) => id,
        None => {
            let (runs, _) = store.list_runs(&RunFilter::default(), None, 1).await?;
            match runs.into_iter().next() {
                Some(run) => run.run_id,
                None => {
                    eprintln!("no runs recorded");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    };

    let errors_only = errors || level.as_deref() == Some("error");
    let since = since.as_deref().map(parse_duration).transpose()?;
    let filter = EventFilter {
        step,
        errors_only,
        since: since.map(|d| {
            chrono::Utc::now()
                - chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        }),
        limit: None,
        offset: 0,
    };

    let mut events = store.list_events(&run_id, &filter).await?;
    if let Some(tail) = tail {
        let skip = events.len().saturating_sub(tail as usize);
        events.drain(..skip);
    }

    for event in events {
        match format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "timestamp": event.timestamp.to_rfc3339(),
                    "run_id": event.run_id,
                    "step_id": event.step_id,
                    "state": event.state,
                    "persona": event.persona,
                    "message": event.message,
                    "tokens_used": event.tokens_used,
                    "duration_ms": event.duration_ms,
                })
            ),
            _ => {
                let step = event.step_id.as_deref().unwrap_or("-");
                println!(
                    "{} {:<18} {:<12} {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.state,
                    step,
                    event.message
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// HELPERS
// ============================================================================

async fn open_store(manifest: &Manifest) -> Result<Arc<StateStore>, WaveError> {
    let path = manifest.resolve_path(&manifest.runtime.state_db);
    Ok(Arc::new(
        StateStore::open_with(&path, &MigrationSettings::from_env()).await?,
    ))
}

async fn build_executor(manifest: Arc<Manifest>) -> Result<Executor, WaveError> {
    let store = open_store(&manifest).await?;
    build_executor_with(manifest, store).await
}

async fn build_executor_with(
    manifest: Arc<Manifest>,
    store: Arc<StateStore>,
) -> Result<Executor, WaveError> {
    let workspaces = WorkspaceManager::new(
        manifest.resolve_path(&manifest.runtime.workspace_root),
        &manifest.base_dir,
    );
    let registry = AdapterRegistry::from_manifest(&manifest);
    let audit = Arc::new(AuditLog::new(
        manifest.resolve_path(&manifest.runtime.traces_dir),
        manifest.runtime.audit.enabled,
    ));
    Ok(Executor::new(
        manifest,
        store,
        EventSink::stdout(),
        workspaces,
        registry,
        audit,
    ))
}

/// Drive a run future to completion, mapping the summary (or a ctrl-c)
/// onto the documented exit codes.
async fn run_to_exit(
    run: impl std::future::Future<Output = Result<RunSummary, WaveError>>,
) -> Result<ExitCode, WaveError> {
    tokio::select! {
        summary = run => {
            let summary = summary?;
            eprintln!(
                "run {} finished: {} ({} tokens)",
                summary.run_id,
                summary.status,
                summary.total_tokens
            );
            Ok(match summary.status {
                RunStatus::Completed => ExitCode::SUCCESS,
                RunStatus::Cancelled => ExitCode::from(130),
                _ => ExitCode::from(3),
            })
        }
        _ = tokio::signal::ctrl_c() => {
            // Step state is already durable; the run resumes with `wave
            // resume`.
            eprintln!("interrupted; state persisted for resume");
            Ok(ExitCode::from(130))
        }
    }
}

/// Pipelines live in `.wave/pipelines/*.yaml`, addressed by their
/// metadata name.
fn discover_pipelines(manifest: &Manifest) -> Result<Vec<(String, Pipeline)>, WaveError> {
    let dir = manifest.base_dir.join(".wave/pipelines");
    let mut pipelines = Vec::new();
    if !dir.is_dir() {
        return Ok(pipelines);
    }
    let pattern = format!("{}/*.yaml", dir.display());
    for path in glob::glob(&pattern)
        .map_err(|e| WaveError::workspace(format!("bad glob: {e}")))?
        .flatten()
    {
        let pipeline = Pipeline::load(&path)?;
        pipelines.push((pipeline.name().to_string(), pipeline));
    }
    pipelines.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pipelines)
}

fn find_pipeline(manifest: &Manifest, name: &str) -> Result<Pipeline, WaveError> {
    discover_pipelines(manifest)?
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, p)| p)
        .ok_or_else(|| WaveError::InvalidPipeline {
            pipeline: name.to_string(),
            message: "not found under .wave/pipelines/".to_string(),
        })
}

fn print_plan(manifest: &Manifest, pipeline: &Pipeline) -> Result<(), WaveError> {
    pipeline.ensure_valid(manifest)?;
    let plan = dag::resolve(pipeline.name(), &pipeline.steps)?;
    eprintln!(
        "{} '{}': {} steps in {} layers",
        "plan".cyan().bold(),
        pipeline.name(),
        plan.len(),
        plan.layers.len()
    );
    for (depth, layer) in plan.layers.iter().enumerate() {
        eprintln!("  layer {depth}:");
        for step_id in layer {
            if let Some(step) = pipeline.step(step_id) {
                let timeout = step
                    .timeout_secs
                    .unwrap_or(manifest.runtime.default_timeout_secs);
                let matrix = step
                    .matrix
                    .as_ref()
                    .map(|m| format!(" [matrix: {} x{}]", m.items, m.max_parallel))
                    .unwrap_or_default();
                eprintln!(
                    "    {} (persona: {}, timeout: {}s){}",
                    step_id.bold(),
                    step.persona,
                    timeout,
                    matrix
                );
            }
        }
    }
    Ok(())
}

/// Parse durations like `90s`, `30m`, `2h`, `1d`.
fn parse_duration(text: &str) -> Result<Duration, WaveError> {
    let text = text.trim();
    let (number, unit) = text.split_at(text.len().saturating_sub(1));
    let value: u64 = number
        .parse()
        .map_err(|_| WaveError::workspace(format!("bad duration '{text}'")))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => {
            return Err(WaveError::workspace(format!(
                "bad duration unit in '{text}' (use s, m, h, or d)"
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}
