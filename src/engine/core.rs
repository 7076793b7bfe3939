// src/engine/core.rs

//! Pure core runner state machine.
//!
//! This module contains a synchronous, deterministic core that consumes
//! [`RunnerEvent`]s and produces:
//! - an updated state per task
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for
//! reading events from channels, sending tasks to the executor and grid
//! backend, updating the history store and invoking hooks.
//!
//! The core has no channels, no Tokio types, and performs no IO, so the
//! whole scheduling semantics can be unit tested without processes or a
//! runtime.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, warn};

use crate::engine::{FailReason, RunnerEvent, TaskOutcome, TaskState};
use crate::graph::{TaskGraph, TaskId};
use crate::plan::RunPlan;
use crate::report::{RunSummary, StatusEvent};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Send this task to the local executor or the grid backend.
    Dispatch { task: TaskId, grid: bool },
    /// Emit a status event to the reporters.
    Report(StatusEvent),
    /// Record fingerprints of the task's depends and targets in the history
    /// store (the task just completed).
    RecordHistory(TaskId),
    /// Invoke the per-task success/failure hook. Never emitted for skipped,
    /// cascaded or interrupted tasks.
    TaskHook { task: TaskId, success: bool },
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// True once every task is terminal (or the run was halted and the last
    /// in-flight task finished).
    pub finished: bool,
}

/// Scheduling limits and flags, resolved from the run configuration.
#[derive(Debug, Clone, Copy)]
pub struct CoreOptions {
    pub local_jobs: usize,
    pub grid_jobs: usize,
    pub quit_early: bool,
    /// Whether a grid backend is attached; without one, gridable tasks run
    /// locally.
    pub grid_enabled: bool,
}

/// The core scheduler: walks the planned graph, honoring readiness and the
/// two concurrency limits, and reacts to completion events.
#[derive(Debug)]
pub struct CoreRunner {
    graph: TaskGraph,
    states: Vec<TaskState>,
    fail_reasons: Vec<Option<FailReason>>,
    options: CoreOptions,
    until_task: Option<TaskId>,
    total_runnable: usize,
    /// Terminal transitions among initially-runnable tasks.
    terminal_runnable: usize,
    local_active: usize,
    grid_active: usize,
    grid_dispatched: HashSet<TaskId>,
    /// No further Ready→Started transitions (quit-early fired, until-task
    /// reached, or interrupted).
    halted: bool,
    interrupted: bool,
}

impl CoreRunner {
    pub fn new(graph: TaskGraph, plan: RunPlan, options: CoreOptions) -> Self {
        let len = graph.len();
        Self {
            graph,
            states: plan.states,
            fail_reasons: vec![None; len],
            options,
            until_task: plan.until_task,
            total_runnable: plan.total_runnable,
            terminal_runnable: 0,
            local_active: 0,
            grid_active: 0,
            grid_dispatched: HashSet::new(),
            halted: false,
            interrupted: false,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        self.states[id]
    }

    pub fn fail_reason(&self, id: TaskId) -> Option<&FailReason> {
        self.fail_reasons[id].as_ref()
    }

    pub fn total_runnable(&self) -> usize {
        self.total_runnable
    }

    pub fn in_flight(&self) -> usize {
        self.local_active + self.grid_active
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            interrupted: self.interrupted,
            ..RunSummary::default()
        };
        for state in &self.states {
            match state {
                TaskState::Completed => summary.completed += 1,
                TaskState::Skipped => summary.skipped += 1,
                TaskState::Failed => summary.failed += 1,
                _ => {}
            }
        }
        summary
    }

    /// Begin the run: report planned skips, promote initially-ready tasks
    /// and dispatch up to the concurrency limits.
    pub fn start(&mut self) -> CoreStep {
        let mut commands = Vec::new();

        for id in 0..self.states.len() {
            if self.states[id] == TaskState::Skipped {
                commands.push(self.report(id, TaskState::Skipped, None));
            }
        }

        self.promote_and_dispatch(&mut commands);
        self.step_result(commands)
    }

    /// Handle a single runner event.
    pub fn step(&mut self, event: RunnerEvent) -> CoreStep {
        let mut commands = Vec::new();

        match event {
            RunnerEvent::TaskFinished { task, outcome } => {
                self.handle_finished(task, outcome, &mut commands);
            }
            RunnerEvent::TaskRunning { task, extra } => {
                if self.states[task] == TaskState::Started {
                    self.states[task] = TaskState::Running;
                    commands.push(self.report(task, TaskState::Running, extra));
                }
            }
            RunnerEvent::Interrupted => {
                self.handle_interrupt(&mut commands);
            }
        }

        self.promote_and_dispatch(&mut commands);
        self.step_result(commands)
    }

    fn handle_finished(
        &mut self,
        task: TaskId,
        outcome: TaskOutcome,
        commands: &mut Vec<CoreCommand>,
    ) {
        if !matches!(
            self.states[task],
            TaskState::Started | TaskState::Running
        ) {
            warn!(
                task,
                state = ?self.states[task],
                "completion event for a task that is not in flight; ignoring"
            );
            return;
        }

        self.settle_slot(task);

        match outcome {
            TaskOutcome::Success => {
                self.states[task] = TaskState::Completed;
                self.terminal_runnable += 1;
                debug!(task, "task completed");
                commands.push(CoreCommand::RecordHistory(task));
                commands.push(self.report(task, TaskState::Completed, None));
                commands.push(CoreCommand::TaskHook {
                    task,
                    success: true,
                });
            }
            TaskOutcome::Failed(reason) => {
                self.states[task] = TaskState::Failed;
                self.terminal_runnable += 1;
                warn!(task, reason = %reason, "task failed");
                commands.push(self.report(task, TaskState::Failed, Some(reason.to_string())));
                commands.push(CoreCommand::TaskHook {
                    task,
                    success: false,
                });
                self.fail_reasons[task] = Some(reason);

                self.fail_descendants(task, commands);

                if self.options.quit_early && !self.halted {
                    debug!("quit-early: halting further dispatch");
                    self.halted = true;
                }
            }
        }

        if self.until_task == Some(task) {
            debug!(task, "until-task reached a terminal state; halting dispatch");
            self.halted = true;
        }
    }

    /// Children of failed tasks are not executed: force every non-terminal
    /// descendant to Failed without running it. No hooks fire for these.
    fn fail_descendants(&mut self, failed: TaskId, commands: &mut Vec<CoreCommand>) {
        let mut descendants: Vec<TaskId> = self
            .graph
            .descendants_of(failed)
            .into_iter()
            .filter(|&id| id != failed)
            .collect();
        descendants.sort_unstable();

        for id in descendants {
            if self.states[id].is_terminal() || self.in_flight_state(id) {
                continue;
            }
            let reason = FailReason::UpstreamFailed { parent: failed };
            self.states[id] = TaskState::Failed;
            self.terminal_runnable += 1;
            commands.push(self.report(id, TaskState::Failed, Some(reason.to_string())));
            self.fail_reasons[id] = Some(reason);
        }
    }

    fn handle_interrupt(&mut self, commands: &mut Vec<CoreCommand>) {
        if self.interrupted {
            return;
        }
        self.interrupted = true;
        self.halted = true;
        warn!("interrupt received; letting in-flight tasks finish, failing the rest");

        for id in 0..self.states.len() {
            if self.states[id].is_terminal() || self.in_flight_state(id) {
                continue;
            }
            self.states[id] = TaskState::Failed;
            self.terminal_runnable += 1;
            commands.push(self.report(
                id,
                TaskState::Failed,
                Some(FailReason::Interrupted.to_string()),
            ));
            self.fail_reasons[id] = Some(FailReason::Interrupted);
        }
    }

    /// Promote Unevaluated tasks whose parents are all satisfied, then
    /// dispatch Ready tasks lowest-id first while slots remain.
    fn promote_and_dispatch(&mut self, commands: &mut Vec<CoreCommand>) {
        for id in 0..self.states.len() {
            if self.states[id] != TaskState::Unevaluated {
                continue;
            }
            let parents = self.graph.parents_of(id);
            if parents.iter().all(|&p| self.states[p].satisfies_children()) {
                self.states[id] = TaskState::Ready;
                commands.push(self.report(id, TaskState::Ready, None));
            }
        }

        if self.halted {
            return;
        }

        for id in 0..self.states.len() {
            if self.states[id] != TaskState::Ready {
                continue;
            }
            let grid = self.graph.get(id).gridable && self.options.grid_enabled;
            let slot_free = if grid {
                self.grid_active < self.options.grid_jobs
            } else {
                self.local_active < self.options.local_jobs
            };
            if !slot_free {
                continue;
            }

            if grid {
                self.grid_active += 1;
                self.grid_dispatched.insert(id);
            } else {
                self.local_active += 1;
            }
            self.states[id] = TaskState::Started;
            debug!(task = id, grid, "dispatching task");
            // The run log wants the exact commands, not just the task name.
            let commands_text = self
                .graph
                .get(id)
                .actions
                .iter()
                .map(crate::graph::Action::describe)
                .collect::<Vec<_>>()
                .join(" && ");
            commands.push(self.report(id, TaskState::Started, Some(commands_text)));
            commands.push(CoreCommand::Dispatch { task: id, grid });
        }
    }

    fn settle_slot(&mut self, task: TaskId) {
        if self.grid_dispatched.remove(&task) {
            self.grid_active = self.grid_active.saturating_sub(1);
        } else {
            self.local_active = self.local_active.saturating_sub(1);
        }
    }

    fn in_flight_state(&self, id: TaskId) -> bool {
        matches!(self.states[id], TaskState::Started | TaskState::Running)
    }

    fn finished(&self) -> bool {
        if self.in_flight() > 0 {
            return false;
        }
        if self.halted {
            return true;
        }
        self.states.iter().all(|s| s.is_terminal())
    }

    fn step_result(&self, commands: Vec<CoreCommand>) -> CoreStep {
        CoreStep {
            commands,
            finished: self.finished(),
        }
    }

    fn report(&self, task: TaskId, state: TaskState, extra: Option<String>) -> CoreCommand {
        CoreCommand::Report(StatusEvent {
            timestamp: Utc::now(),
            task_id: task,
            description: self.graph.get(task).name.clone(),
            state,
            completed: self.terminal_runnable,
            total: self.total_runnable,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskSpec;
    use crate::plan::RunPlan;

    fn options(local_jobs: usize) -> CoreOptions {
        CoreOptions {
            local_jobs,
            grid_jobs: 1,
            quit_early: false,
            grid_enabled: false,
        }
    }

    /// Build a graph from (name, depends, targets) triples, everything
    /// runnable.
    fn runner(tasks: &[(&str, &[&str], &[&str])], opts: CoreOptions) -> CoreRunner {
        let mut graph = TaskGraph::new();
        for (name, depends, targets) in tasks {
            graph
                .add_task(
                    TaskSpec::shell(format!("run {name}"))
                        .named(*name)
                        .depends_on(depends.iter().copied())
                        .produces(targets.iter().copied()),
                )
                .unwrap();
        }
        // Edges only; skip preexisting checks (these paths don't exist).
        let plan = RunPlan {
            states: vec![TaskState::Unevaluated; graph.len()],
            total_runnable: graph.len(),
            until_task: None,
        };
        CoreRunner::new(graph, plan, opts)
    }

    fn dispatched(step: &CoreStep) -> Vec<TaskId> {
        step.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Dispatch { task, .. } => Some(*task),
                _ => None,
            })
            .collect()
    }

    fn finish_ok(runner: &mut CoreRunner, task: TaskId) -> CoreStep {
        runner.step(RunnerEvent::TaskFinished {
            task,
            outcome: TaskOutcome::Success,
        })
    }

    fn finish_err(runner: &mut CoreRunner, task: TaskId) -> CoreStep {
        runner.step(RunnerEvent::TaskFinished {
            task,
            outcome: TaskOutcome::Failed(FailReason::ActionFailed {
                exit_code: 1,
                detail: "boom".into(),
            }),
        })
    }

    #[test]
    fn chain_runs_in_dependency_order() {
        let mut runner = runner(
            &[
                ("a", &[], &["o/a"]),
                ("b", &["o/a"], &["o/b"]),
                ("c", &["o/b"], &["o/c"]),
            ],
            options(4),
        );

        let step = runner.start();
        assert_eq!(dispatched(&step), vec![0]);

        let step = finish_ok(&mut runner, 0);
        assert_eq!(dispatched(&step), vec![1]);

        let step = finish_ok(&mut runner, 1);
        assert_eq!(dispatched(&step), vec![2]);

        let step = finish_ok(&mut runner, 2);
        assert!(step.finished);
        assert_eq!(runner.summary().completed, 3);
    }

    #[test]
    fn concurrency_limit_is_respected() {
        let tasks: Vec<(&str, &[&str], &[&str])> = vec![
            ("t0", &[], &["o/0"]),
            ("t1", &[], &["o/1"]),
            ("t2", &[], &["o/2"]),
            ("t3", &[], &["o/3"]),
        ];
        let mut runner = runner(&tasks, options(2));

        let step = runner.start();
        // Only two slots: lowest ids first.
        assert_eq!(dispatched(&step), vec![0, 1]);
        assert_eq!(runner.in_flight(), 2);

        let step = finish_ok(&mut runner, 0);
        assert_eq!(dispatched(&step), vec![2]);
        assert_eq!(runner.in_flight(), 2);
    }

    #[test]
    fn failure_cascades_to_descendants_without_running_them() {
        let mut runner = runner(
            &[
                ("a", &[], &["o/a"]),
                ("b", &["o/a"], &["o/b"]),
                ("c", &["o/b"], &["o/c"]),
                ("solo", &[], &["o/solo"]),
            ],
            options(1),
        );

        runner.start();
        let step = finish_err(&mut runner, 0);

        assert_eq!(runner.state(1), TaskState::Failed);
        assert_eq!(runner.state(2), TaskState::Failed);
        assert!(matches!(
            runner.fail_reason(1),
            Some(FailReason::UpstreamFailed { parent: 0 })
        ));
        // The independent branch still runs.
        assert_eq!(dispatched(&step), vec![3]);

        let step = finish_ok(&mut runner, 3);
        assert!(step.finished);
        let summary = runner.summary();
        assert_eq!((summary.completed, summary.failed), (1, 3));
        assert!(!summary.success());
    }

    #[test]
    fn quit_early_stops_dispatch_but_lets_in_flight_finish() {
        let tasks: Vec<(&str, &[&str], &[&str])> = vec![
            ("t0", &[], &["o/0"]),
            ("t1", &[], &["o/1"]),
            ("t2", &[], &["o/2"]),
        ];
        let mut runner = runner(
            &tasks,
            CoreOptions {
                quit_early: true,
                ..options(2)
            },
        );

        runner.start();
        // t0, t1 in flight. t0 fails: t2 must never start.
        let step = finish_err(&mut runner, 0);
        assert!(dispatched(&step).is_empty());
        assert!(!step.finished);

        let step = finish_ok(&mut runner, 1);
        assert!(step.finished);
        assert_eq!(runner.state(2), TaskState::Ready);
    }

    #[test]
    fn until_task_halts_after_terminal() {
        let mut runner = runner(
            &[
                ("a", &[], &["o/a"]),
                ("b", &["o/a"], &["o/b"]),
            ],
            options(2),
        );
        runner.until_task = Some(0);

        runner.start();
        let step = finish_ok(&mut runner, 0);
        assert!(dispatched(&step).is_empty());
        assert!(step.finished);
    }

    #[test]
    fn interrupt_fails_pending_tasks_and_waits_for_in_flight() {
        let tasks: Vec<(&str, &[&str], &[&str])> = vec![
            ("t0", &[], &["o/0"]),
            ("t1", &[], &["o/1"]),
        ];
        let mut runner = runner(&tasks, options(1));

        runner.start(); // t0 in flight, t1 waiting
        let step = runner.step(RunnerEvent::Interrupted);

        assert!(!step.finished, "in-flight task must be allowed to finish");
        assert_eq!(runner.state(1), TaskState::Failed);
        assert!(matches!(
            runner.fail_reason(1),
            Some(FailReason::Interrupted)
        ));
        // No failure hook for interrupted tasks.
        assert!(!step.commands.iter().any(|c| matches!(
            c,
            CoreCommand::TaskHook { .. }
        )));

        let step = finish_ok(&mut runner, 0);
        assert!(step.finished);
        assert!(runner.summary().interrupted);
    }

    #[test]
    fn cascaded_failures_emit_no_hooks() {
        let mut runner = runner(
            &[("a", &[], &["o/a"]), ("b", &["o/a"], &["o/b"])],
            options(1),
        );

        runner.start();
        let step = finish_err(&mut runner, 0);

        let hook_tasks: Vec<TaskId> = step
            .commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::TaskHook { task, .. } => Some(*task),
                _ => None,
            })
            .collect();
        // Only the genuinely failed task gets a hook, not the cascaded one.
        assert_eq!(hook_tasks, vec![0]);
    }

    #[test]
    fn empty_plan_finishes_immediately() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(TaskSpec::shell("x").named("x").produces(["o/x"]))
            .unwrap();
        let plan = RunPlan {
            states: vec![TaskState::Skipped],
            total_runnable: 0,
            until_task: None,
        };
        let mut runner = CoreRunner::new(graph, plan, options(1));
        let step = runner.start();
        assert!(step.finished);
        assert_eq!(runner.summary().skipped, 1);
    }

    #[test]
    fn skipped_parent_satisfies_children() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(TaskSpec::shell("a").named("a").produces(["o/a"]))
            .unwrap();
        graph
            .add_task(
                TaskSpec::shell("b")
                    .named("b")
                    .depends_on(["o/a"])
                    .produces(["o/b"]),
            )
            .unwrap();
        let plan = RunPlan {
            states: vec![TaskState::Skipped, TaskState::Unevaluated],
            total_runnable: 1,
            until_task: None,
        };
        let mut runner = CoreRunner::new(graph, plan, options(1));
        let step = runner.start();
        assert_eq!(dispatched(&step), vec![1]);
    }
}
