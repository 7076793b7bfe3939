// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod graph;
pub mod grid;
pub mod history;
pub mod hooks;
pub mod logging;
pub mod plan;
pub mod report;
pub mod tracked;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, GridKind, ResourceField, RunConfig, TaskSection};
use crate::engine::core::CoreOptions;
use crate::engine::{CoreRunner, Runtime, RunnerEvent};
use crate::errors::{Result, RundagError};
use crate::exec::LocalExecutor;
use crate::graph::{TaskGraph, TaskSpec};
use crate::grid::resources::{ResourceRequest, ResourceSpec};
use crate::grid::{GridExecutor, GridQueue, SgeQueue, SlurmQueue};
use crate::history::HistoryStore;
use crate::hooks::HookRunner;
use crate::plan::RunPlan;
use crate::report::{ConsoleReporter, FileReporter, LogReporter, ReporterSet, RunSummary};
use crate::tracked::{FingerprintPolicy, TrackedItem};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - graph building + validation
/// - run planning against the history store
/// - executors / grid backend / reporters / hooks
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<RunSummary> {
    let config_path = PathBuf::from(&args.config);
    let cfg = config::load_and_validate(&config_path)?;
    let run_config = RunConfig::resolve(&args, &cfg)?;

    let mut graph = build_graph(&cfg, &run_config)?;
    graph.validate(run_config.strict)?;

    execute(graph, run_config).await
}

/// Run a validated graph to completion under the given configuration.
///
/// Library callers that build their graphs programmatically enter here.
pub async fn execute(graph: TaskGraph, config: RunConfig) -> Result<RunSummary> {
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating output directory {:?}", config.output_dir))
        .map_err(RundagError::Other)?;

    let history = HistoryStore::open(&config.output_dir)?;
    let plan = plan::plan(&graph, &history, &config)?;

    if config.dry_run {
        let summary = print_dry_run(&graph, &plan);
        history.close()?;
        return Ok(summary);
    }

    let policy = FingerprintPolicy {
        huge_file_threshold_mb: config.huge_file_threshold_mb,
    };

    let (event_tx, event_rx) = mpsc::channel::<RunnerEvent>(64);

    let local = LocalExecutor::new(event_tx.clone());

    let grid = match &config.grid {
        Some(grid_cfg) => {
            let queue: Arc<dyn GridQueue> = match grid_cfg.kind {
                GridKind::Slurm => Arc::new(SlurmQueue::new(grid_cfg.tmpdir.clone())),
                GridKind::Sge => Arc::new(SgeQueue::new(grid_cfg.tmpdir.clone())),
            };
            Some(GridExecutor::new(
                queue,
                event_tx.clone(),
                grid_cfg.poll_interval,
                grid_cfg.benchmark,
                grid_cfg.partition.clone(),
            ))
        }
        None => None,
    };

    // Ctrl-C → stop dispatching, let in-flight tasks finish.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RunnerEvent::Interrupted).await;
        });
    }

    let log_file = config.output_dir.join("rundag.log");
    let mut reporter = ReporterSet::new();
    reporter.push(Box::new(ConsoleReporter));
    reporter.push(Box::new(LogReporter));
    reporter.push(Box::new(FileReporter::new(&log_file)));

    let hooks = HookRunner::new(config.hooks.clone(), log_file);

    let options = CoreOptions {
        local_jobs: config.local_jobs,
        grid_jobs: config.grid_jobs,
        quit_early: config.quit_early,
        grid_enabled: grid.is_some(),
    };

    let core = CoreRunner::new(graph, plan, options);
    let runtime = Runtime::new(
        core,
        event_rx,
        local,
        grid,
        history,
        Box::new(reporter),
        hooks,
        policy,
    );
    runtime.run().await
}

/// Build a graph from the `[task.<name>]` config sections.
///
/// Sections register in name order, so task ids are deterministic for a
/// given config file. `{input}` and `{output}` in actions and item specs
/// are substituted with the resolved directories first.
pub fn build_graph(cfg: &ConfigFile, run_config: &RunConfig) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();

    for (name, section) in cfg.task.iter() {
        let spec = section_to_spec(name, section, run_config)?;
        graph.add_task(spec)?;
    }

    debug!(tasks = graph.len(), "graph built from config");
    Ok(graph)
}

fn section_to_spec(
    name: &str,
    section: &TaskSection,
    run_config: &RunConfig,
) -> Result<TaskSpec> {
    let subst = |s: &str| -> String {
        s.replace("{input}", &run_config.input_dir.to_string_lossy())
            .replace("{output}", &run_config.output_dir.to_string_lossy())
    };

    let mut spec = TaskSpec::new().named(name);
    for action in &section.actions {
        spec = spec.then_shell(subst(action));
    }

    let parse_items = |specs: &[String]| -> Result<Vec<TrackedItem>> {
        specs.iter().map(|s| TrackedItem::parse_spec(&subst(s))).collect()
    };
    spec = spec.depends_on_items(parse_items(&section.depends)?);
    spec = spec.produces_items(parse_items(&section.targets)?);

    if section.gridable {
        let field = |f: &Option<ResourceField>| -> ResourceSpec {
            // Presence is enforced by config validation for gridable tasks.
            match f {
                Some(f) => ResourceSpec::from_config(f),
                None => ResourceSpec::Amount(1),
            }
        };
        spec = spec.gridable(ResourceRequest {
            mem: field(&section.mem),
            time: field(&section.time),
            cores: section.cores.unwrap_or(1),
            partition: section.partition.clone(),
        });
    }

    Ok(spec)
}

/// Plan-only output: report which tasks would run, execute nothing.
fn print_dry_run(graph: &TaskGraph, plan: &RunPlan) -> RunSummary {
    let would_run: Vec<_> = plan.would_run().collect();
    println!(
        "rundag dry-run: {} of {} tasks would run",
        would_run.len(),
        graph.len()
    );
    for task in graph.tasks() {
        let marker = if plan.is_skipped(task.id) { "skip" } else { "run " };
        println!("  [{marker}] {:3}  {}", task.id, task.name);
    }

    info!(would_run = would_run.len(), "dry-run complete (no execution)");
    RunSummary {
        completed: 0,
        skipped: graph.len() - would_run.len(),
        failed: 0,
        interrupted: false,
    }
}
