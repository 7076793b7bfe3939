// src/engine/mod.rs

//! Orchestration engine.
//!
//! The pure core state machine lives in [`core`]; the async/IO shell that
//! owns channels, executors, the grid backend, the history store and
//! reporters is implemented in [`runtime`].

use crate::graph::TaskId;

/// Per-run state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not yet classified for this run.
    Unevaluated,
    /// Up to date (or filtered out); counts as satisfied for children.
    Skipped,
    /// All parents terminal; waiting for a worker or submission slot.
    Ready,
    /// Dispatched; actions are executing (or the grid job is in flight).
    Started,
    /// Grid-submitted and confirmed running on a node.
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Terminal states: nothing further will happen to this task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Skipped | TaskState::Completed | TaskState::Failed
        )
    }

    /// States that satisfy a child's readiness check.
    pub fn satisfies_children(&self) -> bool {
        matches!(self, TaskState::Skipped | TaskState::Completed)
    }
}

/// Why a task failed; `Interrupted` is distinguished from genuine failures
/// in reporting and does not fire failure hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// A shell action exited non-zero. Captured output is included verbatim.
    ActionFailed { exit_code: i32, detail: String },
    /// An in-process function action returned an error.
    FuncError(String),
    /// Actions succeeded but a declared target does not exist.
    MissingTarget(String),
    /// Actions succeeded but a declared dependency no longer exists.
    MissingDepend(String),
    /// An ancestor failed; this task never ran.
    UpstreamFailed { parent: TaskId },
    /// Grid resources exhausted after the final escalation attempt.
    ResourcesExhausted(String),
    /// Grid submission/polling kept failing after infrastructure retries.
    GridInfrastructure(String),
    /// The run was interrupted before or while this task ran.
    Interrupted,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::ActionFailed { exit_code, detail } => {
                write!(f, "action exited with status {exit_code}: {detail}")
            }
            FailReason::FuncError(msg) => write!(f, "function action failed: {msg}"),
            FailReason::MissingTarget(key) => {
                write!(f, "target `{key}' missing after actions completed")
            }
            FailReason::MissingDepend(key) => {
                write!(f, "dependency `{key}' missing after actions completed")
            }
            FailReason::UpstreamFailed { parent } => {
                write!(f, "not run because parent task {parent} failed")
            }
            FailReason::ResourcesExhausted(msg) => write!(f, "grid resources exhausted: {msg}"),
            FailReason::GridInfrastructure(msg) => write!(f, "grid infrastructure error: {msg}"),
            FailReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Outcome of executing one task's actions.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success,
    Failed(FailReason),
}

/// Events flowing into the runtime from executors, the grid poller and the
/// signal handler.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// A dispatched task finished (locally or on the grid).
    TaskFinished { task: TaskId, outcome: TaskOutcome },
    /// A grid job was confirmed running on a node.
    TaskRunning { task: TaskId, extra: Option<String> },
    /// External interrupt (e.g. ctrl-c).
    Interrupted,
}

pub mod core;
pub mod runtime;

pub use self::core::{CoreCommand, CoreRunner, CoreStep};
pub use self::runtime::Runtime;
