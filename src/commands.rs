use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::{Commands, LayoutArgs, RunArgs, StatusArgs};
use crate::config::{
    DEFAULT_ARTIFACT, DEFAULT_JOBS, DEFAULT_LOG_FILE, DEFAULT_STALE_LOCK_SECS, DEFAULT_TOOL_ARGS,
    FileConfig, InterruptPolicy, Layout, RunConfig, ToolSpec, load_config, normalize_extensions,
    validate_layout, validate_run_config,
};
use crate::executor::Executor;
use crate::lock::LockManager;
use crate::logbook::Logbook;
use crate::models::{JobOutcome, JobState};
use crate::pool::run_pool;
use crate::reconcile::Reconciler;
use crate::runtime::{Shutdown, create_run_id, print_json};
use crate::sentinel::Sentinel;
use crate::summary::RunSummary;

pub fn execute(command: Commands) -> Result<i32> {
    match command {
        Commands::Run(args) => cmd_run(&args),
        Commands::Status(args) => cmd_status(&args),
    }
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let config = resolve_run_config(args)?;
    let run_id = create_run_id();
    let log = Logbook::open(&config.log_file, !args.quiet)
        .with_context(|| format!("failed to open log file {}", config.log_file.display()))?;

    log.info(format!("Starting run {run_id} (pid {})", std::process::id()));
    log.info(format!("Input directory: {}", config.layout.input_dir.display()));
    log.info(format!("Output directory: {}", config.layout.output_dir.display()));
    log.info(format!(
        "Completion artifact: {}; extensions: {}",
        config.layout.artifact.display(),
        config.layout.extensions.join(", ")
    ));
    log.info(format!(
        "Parallel jobs: {}; tool: {} {}",
        config.jobs,
        config.tool.program,
        config.tool.args.join(" ")
    ));

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers(&log)?;

    let sentinel = Sentinel::new(&config.layout.artifact);
    let locks = LockManager::new(&run_id, config.stale_lock_after);
    let reconciliation = Reconciler {
        layout: &config.layout,
        sentinel: &sentinel,
        locks: &locks,
        log: &log,
    }
    .reconcile()
    .inspect_err(|err| log.error(format!("Aborting run: {err}")))?;

    if reconciliation.queue.is_empty() && reconciliation.already_complete.is_empty() {
        log.warn(format!(
            "No input files with extensions [{}] found in {}",
            config.layout.extensions.join(", "),
            config.layout.input_dir.display()
        ));
    }

    let executor = Arc::new(Executor::new(
        sentinel,
        locks,
        config.tool.clone(),
        log.clone(),
        shutdown.clone(),
        config.on_interrupt,
    ));
    let reports = run_pool(reconciliation.queue, config.jobs, executor, &shutdown, &log);
    let summary = RunSummary::tally(reconciliation.already_complete.len(), &reports);
    summary.log(&log);

    let log_path = log
        .path()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    if args.json {
        let jobs: Vec<Value> = reports
            .iter()
            .map(|r| {
                let error = match &r.outcome {
                    JobOutcome::Failed(err) => Some(err.to_string()),
                    _ => None,
                };
                json!({
                    "name": r.job_id,
                    "outcome": r.outcome.label(),
                    "state": r.outcome.final_state().label(),
                    "elapsed_secs": r.elapsed.as_secs_f64(),
                    "error": error,
                })
            })
            .collect();
        let already: Vec<&str> = reconciliation
            .already_complete
            .iter()
            .map(|j| j.id.as_str())
            .collect();
        print_json(&json!({
            "run_id": run_id,
            "log_file": log_path,
            "total": summary.total(),
            "summary": summary,
            "already_complete": already,
            "removed": reconciliation.removed,
            "jobs": jobs,
        }))?;
    } else {
        print!("{}", summary.render());
        println!("Log file: {log_path}");
    }
    Ok(summary.exit_code())
}

fn cmd_status(args: &StatusArgs) -> Result<i32> {
    let file = load_file_config(args.layout.config.as_deref())?;
    let layout = resolve_layout(&args.layout, &file)?;
    let sentinel = Sentinel::new(&layout.artifact);
    let locks = LockManager::new(
        "status",
        Duration::from_secs(file.stale_lock_secs.unwrap_or(DEFAULT_STALE_LOCK_SECS)),
    );
    let log = Logbook::console(true);
    let jobs = Reconciler {
        layout: &layout,
        sentinel: &sentinel,
        locks: &locks,
        log: &log,
    }
    .survey()?;

    let mut counts: BTreeMap<&str, usize> = [
        JobState::Completed,
        JobState::Partial,
        JobState::Locked,
        JobState::Unstarted,
    ]
    .into_iter()
    .map(|s| (s.label(), 0))
    .collect();
    for job in &jobs {
        *counts.entry(job.state.label()).or_default() += 1;
    }

    if args.json {
        let items: Vec<Value> = jobs
            .iter()
            .map(|j| {
                json!({
                    "name": j.id,
                    "input": j.input_path,
                    "result_dir": j.result_dir,
                    "state": j.state.label(),
                })
            })
            .collect();
        print_json(&json!({
            "input_dir": layout.input_dir,
            "output_dir": layout.output_dir,
            "artifact": layout.artifact,
            "counts": counts,
            "jobs": items,
        }))?;
        return Ok(0);
    }

    if jobs.is_empty() {
        println!(
            "No input files with extensions [{}] in {}",
            layout.extensions.join(", "),
            layout.input_dir.display()
        );
        return Ok(0);
    }
    println!("Jobs ({} -> {}):", layout.input_dir.display(), layout.output_dir.display());
    for job in &jobs {
        println!(
            "- {:<32} {:<10} {}",
            job.id,
            job.state.label(),
            job.result_dir.display()
        );
    }
    let totals: Vec<String> = counts.iter().map(|(k, v)| format!("{k}={v}")).collect();
    println!("Totals: {}", totals.join(" "));
    Ok(0)
}

fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(FileConfig::default()),
    }
}

fn resolve_layout(args: &LayoutArgs, file: &FileConfig) -> Result<Layout> {
    let input_dir = args
        .input_dir
        .clone()
        .or(file.input_dir.clone())
        .ok_or_else(|| anyhow!("input directory must be given as an argument or config input_dir"))?;
    let output_dir = args
        .output_dir
        .clone()
        .or(file.output_dir.clone())
        .ok_or_else(|| {
            anyhow!("output directory must be given as an argument or config output_dir")
        })?;
    let extensions = if args.extensions.is_empty() {
        normalize_extensions(&file.extensions)
    } else {
        normalize_extensions(&args.extensions)
    };

    let layout = Layout {
        input_dir: absolute(&input_dir)?,
        output_dir: absolute(&output_dir)?,
        artifact: args
            .artifact
            .clone()
            .or(file.artifact.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT)),
        extensions,
    };
    validate_layout(&layout)?;
    Ok(layout)
}

fn resolve_run_config(args: &RunArgs) -> Result<RunConfig> {
    let file = load_file_config(args.layout.config.as_deref())?;
    let layout = resolve_layout(&args.layout, &file)?;

    let program = args
        .tool
        .clone()
        .or_else(|| file.tool.as_ref().map(|t| t.program.clone()))
        .ok_or_else(|| anyhow!("tool program must be given via --tool or config tool.program"))?;
    let tool_args = if !args.tool_args.is_empty() {
        args.tool_args.clone()
    } else if let Some(tool) = file.tool.as_ref()
        && !tool.args.is_empty()
    {
        tool.args.clone()
    } else {
        DEFAULT_TOOL_ARGS.iter().map(|s| s.to_string()).collect()
    };

    let config = RunConfig {
        layout,
        jobs: args.jobs.or(file.jobs).unwrap_or(DEFAULT_JOBS),
        log_file: args
            .log_file
            .clone()
            .or(file.log_file.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        tool: ToolSpec {
            program,
            args: tool_args,
        },
        stale_lock_after: Duration::from_secs(
            args.stale_lock_secs
                .or(file.stale_lock_secs)
                .unwrap_or(DEFAULT_STALE_LOCK_SECS),
        ),
        on_interrupt: args
            .on_interrupt
            .or(file.on_interrupt)
            .unwrap_or(InterruptPolicy::Terminate),
    };
    validate_run_config(&config)?;
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("failed to resolve {}", path.display()))
}
