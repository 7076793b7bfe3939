// src/exec/local.rs

//! Local task execution.
//!
//! Each dispatched task runs in its own Tokio task; the actions within a
//! task run sequentially and must all succeed. After the last action, every
//! declared target is re-checked for existence: a task whose process exited
//! zero but left a target missing is still a failure.
//!
//! On interrupt the runtime simply stops dispatching; in-flight processes
//! here are always allowed to finish (never killed), so partially-written
//! targets come only from the tasks' own crashes.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::engine::{FailReason, RunnerEvent, TaskOutcome};
use crate::errors::Result;
use crate::graph::{Action, Task};

use super::backend::ExecutorBackend;

/// Production executor: spawns one background Tokio task per dispatch.
pub struct LocalExecutor {
    event_tx: mpsc::Sender<RunnerEvent>,
}

impl LocalExecutor {
    pub fn new(event_tx: mpsc::Sender<RunnerEvent>) -> Self {
        Self { event_tx }
    }
}

impl ExecutorBackend for LocalExecutor {
    fn dispatch(&mut self, task: Task) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.event_tx.clone();
        Box::pin(async move {
            tokio::spawn(async move {
                let id = task.id;
                let outcome = run_actions(&task).await;
                if tx
                    .send(RunnerEvent::TaskFinished { task: id, outcome })
                    .await
                    .is_err()
                {
                    debug!(task = id, "runtime event channel closed before completion");
                }
            });
            Ok(())
        })
    }
}

/// Run a task's actions in order, then verify its targets exist.
pub async fn run_actions(task: &Task) -> TaskOutcome {
    for action in &task.actions {
        match action {
            Action::Shell(cmd) => {
                if let Some(reason) = run_shell(task, cmd).await {
                    return TaskOutcome::Failed(reason);
                }
            }
            Action::Func { name, f } => {
                let f = f.clone();
                let result = tokio::task::spawn_blocking(move || f()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(task = task.id, func = %name, error = ?err, "function action failed");
                        return TaskOutcome::Failed(FailReason::FuncError(format!("{err:?}")));
                    }
                    Err(join_err) => {
                        error!(task = task.id, func = %name, error = %join_err, "function action panicked");
                        return TaskOutcome::Failed(FailReason::FuncError(join_err.to_string()));
                    }
                }
            }
        }
    }

    match post_run_check(task) {
        Some(reason) => TaskOutcome::Failed(reason),
        None => TaskOutcome::Success,
    }
}

/// Verify a task's declared items after its actions succeeded: every target
/// must now exist, and no action may have deleted a declared dependency.
pub(crate) fn post_run_check(task: &Task) -> Option<FailReason> {
    for targ in &task.targets {
        if !targ.exists() {
            return Some(FailReason::MissingTarget(targ.key().0));
        }
    }
    for dep in &task.depends {
        if !dep.exists() {
            return Some(FailReason::MissingDepend(dep.key().0));
        }
    }
    None
}

/// Run one shell action; `None` means success.
async fn run_shell(task: &Task, cmd: &str) -> Option<FailReason> {
    info!(task = task.id, cmd = %cmd, "running shell command");

    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = match command.output().await {
        Ok(out) => out,
        Err(err) => {
            error!(task = task.id, cmd = %cmd, error = %err, "failed to spawn process");
            return Some(FailReason::ActionFailed {
                exit_code: -1,
                detail: format!("failed to spawn `{cmd}': {err}"),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        task = task.id,
        stdout = %stdout,
        stderr = %stderr,
        "command finished"
    );

    if output.status.success() {
        None
    } else {
        let exit_code = output.status.code().unwrap_or(-1);
        error!(
            task = task.id,
            cmd = %cmd,
            exit_code,
            stdout = %stdout,
            stderr = %stderr,
            "command exited non-zero"
        );
        Some(FailReason::ActionFailed {
            exit_code,
            detail: format!("`{cmd}'\nstdout: {stdout}\nstderr: {stderr}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskSpec;
    use crate::graph::TaskGraph;
    use tempfile::TempDir;

    fn build_task(spec: TaskSpec) -> Task {
        let mut graph = TaskGraph::new();
        let id = graph.add_task(spec).unwrap();
        graph.get(id).clone()
    }

    #[tokio::test]
    async fn successful_shell_action_with_target() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");

        let task = build_task(
            TaskSpec::shell(format!("echo hi > {}", out.display()))
                .named("t")
                .produces([out.to_string_lossy()]),
        );

        assert!(matches!(run_actions(&task).await, TaskOutcome::Success));
        assert!(out.exists());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_captured_output() {
        let task = build_task(TaskSpec::shell("echo oops >&2; exit 3").named("t"));

        match run_actions(&task).await {
            TaskOutcome::Failed(FailReason::ActionFailed { exit_code, detail }) => {
                assert_eq!(exit_code, 3);
                assert!(detail.contains("oops"));
            }
            other => panic!("expected ActionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_target_fails_despite_zero_exit() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("never-written.txt");

        let task = build_task(
            TaskSpec::shell("true")
                .named("t")
                .produces([out.to_string_lossy()]),
        );

        assert!(matches!(
            run_actions(&task).await,
            TaskOutcome::Failed(FailReason::MissingTarget(_))
        ));
    }

    #[tokio::test]
    async fn deleting_a_dependency_fails_despite_zero_exit() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "x").unwrap();

        let task = build_task(
            TaskSpec::shell(format!("rm {}", input.display()))
                .named("t")
                .depends_on([input.to_string_lossy()]),
        );

        assert!(matches!(
            run_actions(&task).await,
            TaskOutcome::Failed(FailReason::MissingDepend(_))
        ));
    }

    #[tokio::test]
    async fn actions_run_sequentially_and_stop_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("marker.txt");

        let task = build_task(
            TaskSpec::shell("exit 1")
                .then_shell(format!("touch {}", marker.display()))
                .named("t"),
        );

        assert!(matches!(run_actions(&task).await, TaskOutcome::Failed(_)));
        assert!(!marker.exists(), "second action must not run after a failure");
    }

    #[tokio::test]
    async fn function_action_errors_are_reported() {
        let task = build_task(
            TaskSpec::func("boom", || Err(anyhow::anyhow!("lookup failed"))).named("t"),
        );

        match run_actions(&task).await {
            TaskOutcome::Failed(FailReason::FuncError(msg)) => {
                assert!(msg.contains("lookup failed"));
            }
            other => panic!("expected FuncError, got {other:?}"),
        }
    }
}
