use crate::config::ConsoleConfig;
use crate::engine::{CommandDispatcher, EngineCommand};
use crate::model::{CheckState, ConsoleEvent, MigrationRun, RecordId, StageReport};
use crate::orchestrator::Pipeline;
use crate::pipeline::policy::{build_policy, PolicyKind};
use crate::pipeline::PipelineEngine;
use crate::registry::RunRegistry;
use crate::source::{FixtureSource, JsonFileSource, RecordSource};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone, Default)]
#[command(
    name = "migration-console",
    version,
    about = "Operator console for policy migration runs, with optional TUI"
)]
pub struct Cli {
    /// Base URL of the migration engine (enables live status and control commands)
    #[arg(long)]
    pub engine_url: Option<String>,

    /// Product whose policies are migrated
    #[arg(long)]
    pub source_product: Option<String>,

    /// Product the policies are migrated into
    #[arg(long)]
    pub target_product: Option<String>,

    /// Number of generated policies per run
    #[arg(long)]
    pub records: Option<usize>,

    /// Read policies from a JSON file of back-office records instead of generating them
    #[arg(long)]
    pub records_file: Option<PathBuf>,

    /// Check policy deciding pass/fail per stage
    #[arg(long, value_enum)]
    pub policy: Option<PolicyKind>,

    /// Failure probability per stage for the random policy
    #[arg(long)]
    pub failure_rate: Option<f64>,

    /// Delay between a record entering `migrating` and resolving
    #[arg(long)]
    pub migrate_step: Option<humantime::Duration>,

    /// Timeout for engine control commands
    #[arg(long)]
    pub command_timeout: Option<humantime::Duration>,

    /// Number of engine log entries kept
    #[arg(long)]
    pub log_cap: Option<usize>,

    /// Print JSON report and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Send one control command to the engine and exit
    #[arg(long, value_enum)]
    pub send: Option<EngineCommand>,

    /// Configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log file used while the TUI owns the terminal
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn is_headless(&self) -> bool {
        self.json || self.text || self.send.is_some()
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json && args.text {
        return Err(anyhow::anyhow!("--json and --text are mutually exclusive"));
    }
    let cfg = build_config(&args)?;

    if let Some(command) = args.send {
        init_stderr_logging();
        return send_command(&cfg, command).await;
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            init_file_logging(&cfg)?;
            return crate::tui::run(cfg).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            init_stderr_logging();
            return run_text(cfg).await;
        }
    }

    init_stderr_logging();
    if args.json {
        return run_json(cfg).await;
    }
    run_text(cfg).await
}

/// Merge the config file with explicitly given flags, then validate.
pub fn build_config(args: &Cli) -> Result<ConsoleConfig> {
    let mut cfg = ConsoleConfig::discover(args.config.as_deref())?;
    if let Some(v) = &args.engine_url {
        cfg.engine_url = Some(v.trim_end_matches('/').to_string());
    }
    if let Some(v) = &args.source_product {
        cfg.source_product = v.clone();
    }
    if let Some(v) = &args.target_product {
        cfg.target_product = v.clone();
    }
    if let Some(v) = args.records {
        cfg.records = v;
    }
    if let Some(v) = &args.records_file {
        cfg.records_file = Some(v.clone());
    }
    if let Some(v) = args.policy {
        cfg.policy = v;
    }
    if let Some(v) = args.failure_rate {
        cfg.failure_rate = v;
    }
    if let Some(v) = args.migrate_step {
        cfg.migrate_step = Duration::from(v);
    }
    if let Some(v) = args.command_timeout {
        cfg.command_timeout = Duration::from(v);
    }
    if let Some(v) = args.log_cap {
        cfg.log_cap = v;
    }
    if let Some(v) = &args.log_file {
        cfg.log_file = Some(v.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_stderr_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(feature = "tui")]
fn init_file_logging(cfg: &ConsoleConfig) -> Result<()> {
    let Some(path) = cfg.resolved_log_file() else {
        // Nowhere to write; stay silent rather than draw over the UI.
        return Ok(());
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create log directory {}", dir.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init();
    Ok(())
}

pub(crate) fn build_source(cfg: &ConsoleConfig) -> Arc<dyn RecordSource> {
    match &cfg.records_file {
        Some(path) => Arc::new(JsonFileSource { path: path.clone() }),
        None => Arc::new(FixtureSource { count: cfg.records }),
    }
}

pub(crate) fn build_pipeline(cfg: &ConsoleConfig) -> Pipeline {
    Pipeline::new(
        RunRegistry::new(),
        PipelineEngine::new(build_policy(cfg.policy, cfg.failure_rate)),
        cfg.migrate_step,
    )
}

async fn send_command(cfg: &ConsoleConfig, command: EngineCommand) -> Result<()> {
    let base = cfg
        .engine_url
        .as_deref()
        .context("--send requires --engine-url (or engine_url in the config file)")?;
    let dispatcher = CommandDispatcher::new(base, cfg.command_timeout)?;
    let ack = dispatcher
        .execute(command)
        .await
        .with_context(|| format!("engine command {command} failed"))?;
    println!("Engine acknowledged {}", ack.command);
    Ok(())
}

/// Everything a headless run produces.
pub(crate) struct HeadlessOutcome {
    pub run: MigrationRun,
    pub reports: Vec<StageReport>,
}

/// Open one run and drive every record as far through the pipeline as it goes.
async fn run_headless_pipeline(
    pipeline: &Pipeline,
    source: &dyn RecordSource,
    cfg: &ConsoleConfig,
    cancel: &CancellationToken,
    events: &mpsc::UnboundedSender<ConsoleEvent>,
) -> Result<HeadlessOutcome> {
    let run = pipeline.open_run(source, "Run 1", &cfg.source_product, &cfg.target_product)?;
    let _ = events.send(ConsoleEvent::Info(format!(
        "Opened {} with {} policies from {}",
        run.id, run.total_policies, run.source_product_id
    )));
    let mut reports = Vec::new();
    let ids = |filter: &dyn Fn(&crate::model::PipelineStatus) -> bool| -> Vec<RecordId> {
        pipeline
            .registry
            .records_with_status(&run.id)
            .into_iter()
            .filter(|(_, s)| filter(s))
            .map(|(r, _)| r.id)
            .collect()
    };

    let all = ids(&|_| true);
    if !all.is_empty() {
        let report = pipeline.validate_selection(&run.id, &all)?;
        let _ = events.send(ConsoleEvent::StageFinished(report.clone()));
        reports.push(report);
    }

    let migratable = ids(&|s| s.can_migrate());
    if !migratable.is_empty() {
        let report = pipeline
            .migrate_selection(&run.id, &migratable, cancel, events)
            .await?;
        let _ = events.send(ConsoleEvent::StageFinished(report.clone()));
        reports.push(report);
    }

    let verifiable = ids(&|s| s.can_verify() && s.verification == CheckState::Pending);
    if !verifiable.is_empty() && !cancel.is_cancelled() {
        let report = pipeline.verify_selection(&run.id, &verifiable)?;
        let _ = events.send(ConsoleEvent::StageFinished(report.clone()));
        reports.push(report);
    }

    let run = pipeline
        .registry
        .run(&run.id)
        .context("run disappeared from the registry")?;
    Ok(HeadlessOutcome { run, reports })
}

/// Run the pipeline on a task, cancelling the migration on Ctrl-C.
fn drive_headless(
    cfg: &ConsoleConfig,
    pipeline: Pipeline,
    evt_tx: mpsc::UnboundedSender<ConsoleEvent>,
) -> tokio::task::JoinHandle<Result<HeadlessOutcome>> {
    let source = build_source(cfg);
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing the current record");
            on_signal.cancel();
        }
    });
    let cfg = cfg.clone();
    tokio::spawn(async move {
        run_headless_pipeline(&pipeline, source.as_ref(), &cfg, &cancel, &evt_tx).await
    })
}

async fn run_text(cfg: ConsoleConfig) -> Result<()> {
    let pipeline = build_pipeline(&cfg);
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
    let handle = drive_headless(&cfg, pipeline.clone(), evt_tx);

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            ConsoleEvent::StageFinished(report) => {
                let _ = out_tx.send(OutputLine::Stderr(format!("== {} ==", report.stage)));
                let _ = out_tx.send(OutputLine::Stderr(report.to_message()));
            }
            ConsoleEvent::RecordMigrated {
                record_id, state, ..
            } => {
                let _ = out_tx.send(OutputLine::Stderr(format!("{record_id}: {state:?}")));
            }
            ConsoleEvent::Info(info) => {
                let _ = out_tx.send(OutputLine::Stderr(info));
            }
            ConsoleEvent::StageStarted { .. }
            | ConsoleEvent::RecordMigrating { .. }
            | ConsoleEvent::MigrationEnded { .. }
            | ConsoleEvent::CommandFinished { .. } => {}
        }
    }

    let outcome = handle.await.context("pipeline task failed")??;
    let summary = crate::text_summary::build_text_summary(
        &outcome.run,
        &outcome.reports,
        &pipeline.registry.all_validation_failed(),
        &pipeline.registry.all_verification_failed(),
    );
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_json(cfg: ConsoleConfig) -> Result<()> {
    let pipeline = build_pipeline(&cfg);
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
    let handle = drive_headless(&cfg, pipeline.clone(), evt_tx);
    // Progress is not part of the JSON document.
    while evt_rx.recv().await.is_some() {}

    let outcome = handle.await.context("pipeline task failed")??;
    let report = serde_json::json!({
        "run": outcome.run,
        "stages": outcome.reports,
        "failedValidation": pipeline.registry.all_validation_failed(),
        "failedVerification": pipeline.registry.all_verification_failed(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
