// src/engine/runtime.rs

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::core::{CoreCommand, CoreRunner, CoreStep};
use crate::engine::{FailReason, RunnerEvent};
use crate::errors::Result;
use crate::exec::ExecutorBackend;
use crate::history::HistoryStore;
use crate::hooks::HookRunner;
use crate::report::{Reporter, RunSummary};
use crate::tracked::FingerprintPolicy;

/// Async IO shell around [`CoreRunner`].
///
/// The core contains all the scheduling semantics; this struct owns the
/// channels, the executor backends, the history store, the reporters and
/// the hook runner, and is the single writer of history records: they are
/// written here, on the orchestrating loop, immediately upon a task's
/// Completed transition, never from worker tasks.
pub struct Runtime<L: ExecutorBackend, G: ExecutorBackend> {
    core: CoreRunner,
    event_rx: mpsc::Receiver<RunnerEvent>,
    local: L,
    grid: Option<G>,
    history: HistoryStore,
    reporter: Box<dyn Reporter>,
    hooks: HookRunner,
    policy: FingerprintPolicy,
}

impl<L: ExecutorBackend, G: ExecutorBackend> fmt::Debug for Runtime<L, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<L: ExecutorBackend, G: ExecutorBackend> Runtime<L, G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: CoreRunner,
        event_rx: mpsc::Receiver<RunnerEvent>,
        local: L,
        grid: Option<G>,
        history: HistoryStore,
        reporter: Box<dyn Reporter>,
        hooks: HookRunner,
        policy: FingerprintPolicy,
    ) -> Self {
        Self {
            core,
            event_rx,
            local,
            grid,
            history,
            reporter,
            hooks,
            policy,
        }
    }

    /// Main event loop.
    ///
    /// - Starts the core, dispatching the initially-ready tasks.
    /// - Consumes `RunnerEvent`s from executors, the grid poller and the
    ///   signal handler.
    /// - Executes the commands the core returns.
    pub async fn run(mut self) -> Result<RunSummary> {
        info!(
            total = self.core.total_runnable(),
            "rundag runtime started"
        );
        self.reporter.started(self.core.total_runnable());
        self.hooks.run_start();

        let step = self.core.start();
        let mut finished = self.execute_step(step).await?;

        while !finished {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    warn!("runtime event channel closed with tasks outstanding; stopping");
                    break;
                }
            };

            debug!(?event, "runtime received event");
            let step = self.core.step(event);
            finished = self.execute_step(step).await?;
        }

        let summary = self.core.summary();
        self.history.flush()?;
        self.reporter.finished(&summary);
        if !summary.interrupted {
            self.hooks.run_finished(summary.success());
        }
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "runtime exiting"
        );
        Ok(summary)
    }

    async fn execute_step(&mut self, step: CoreStep) -> Result<bool> {
        for command in step.commands {
            self.execute_command(command).await?;
        }
        Ok(step.finished)
    }

    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::Dispatch { task, grid } => {
                let task = self.core.graph().get(task).clone();
                match (grid, self.grid.as_mut()) {
                    (true, Some(backend)) => backend.dispatch(task).await?,
                    _ => self.local.dispatch(task).await?,
                }
            }
            CoreCommand::Report(event) => {
                self.reporter.event(&event);
            }
            CoreCommand::RecordHistory(task) => {
                self.record_history(task);
                self.history.flush()?;
            }
            CoreCommand::TaskHook { task, success } => {
                let return_code = match self.core.fail_reason(task) {
                    Some(FailReason::ActionFailed { exit_code, .. }) => *exit_code,
                    Some(_) => -1,
                    None => 0,
                };
                self.hooks
                    .task_finished(self.core.graph().get(task), success, return_code);
            }
        }
        Ok(())
    }

    /// Record fingerprints for a completed task: targets at their new state,
    /// depends at the state they were just used in.
    fn record_history(&mut self, task: crate::graph::TaskId) {
        let graph = self.core.graph();
        let task_ref = graph.get(task);
        let mut records = Vec::new();
        for item in task_ref.depends.iter().chain(task_ref.targets.iter()) {
            match item.fingerprint(&self.policy) {
                Ok(fp) => records.push((item.key(), fp)),
                Err(err) => {
                    warn!(
                        task,
                        key = %item.key(),
                        error = %err,
                        "could not fingerprint item after completion"
                    );
                }
            }
        }
        for (key, fp) in records {
            self.history.record(key, fp, task);
        }
    }
}
