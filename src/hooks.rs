// src/hooks.rs

//! Lifecycle hook scripts.
//!
//! Users can attach external scripts to five lifecycle points: before the
//! whole run, after overall success, after overall failure, after each task
//! success and after each task failure. Context arrives via `RUNDAG_*`
//! environment variables.
//!
//! Hooks never fire for skipped tasks or for tasks that did not run
//! (interrupt, cascading failure). Hook processes run detached so they
//! cannot throttle the scheduler; a failing hook is logged and otherwise
//! ignored.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HooksSection;
use crate::graph::{Action, Task};

/// Spawns configured hook scripts at lifecycle points.
#[derive(Debug, Clone)]
pub struct HookRunner {
    hooks: HooksSection,
    log_file: PathBuf,
}

impl HookRunner {
    pub fn new(hooks: HooksSection, log_file: PathBuf) -> Self {
        Self { hooks, log_file }
    }

    /// Before any task runs.
    pub fn run_start(&self) {
        if let Some(script) = &self.hooks.start {
            self.fire(script, Vec::new());
        }
    }

    /// After the whole run; `success` means no task failed.
    pub fn run_finished(&self, success: bool) {
        let script = if success {
            &self.hooks.success
        } else {
            &self.hooks.failure
        };
        if let Some(script) = script {
            self.fire(
                script,
                vec![(
                    "RUNDAG_RESULT",
                    if success { "success" } else { "failure" }.to_string(),
                )],
            );
        }
    }

    /// After a task genuinely succeeded or failed (never for skipped,
    /// cascaded or interrupted tasks; the caller filters those).
    pub fn task_finished(&self, task: &Task, success: bool, return_code: i32) {
        let script = if success {
            &self.hooks.task_success
        } else {
            &self.hooks.task_failure
        };
        let Some(script) = script else {
            return;
        };

        let commands = task
            .actions
            .iter()
            .map(Action::describe)
            .collect::<Vec<_>>()
            .join("\n");
        let targets = task
            .targets
            .iter()
            .map(|t| t.key().0)
            .collect::<Vec<_>>()
            .join(":");

        self.fire(
            script,
            vec![
                ("RUNDAG_TASK_NAME", task.name.clone()),
                (
                    "RUNDAG_TASK_RESULT",
                    if success { "success" } else { "failure" }.to_string(),
                ),
                ("RUNDAG_RETURN_CODE", return_code.to_string()),
                ("RUNDAG_COMMAND", commands),
                ("RUNDAG_TARGETS", targets),
            ],
        );
    }

    fn fire(&self, script: &str, envs: Vec<(&'static str, String)>) {
        debug!(script = %script, "spawning hook");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .env("RUNDAG_LOG_FILE", &self.log_file)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in envs {
            command.env(key, value);
        }

        let script = script.to_string();
        tokio::spawn(async move {
            match command.status().await {
                Ok(status) if !status.success() => {
                    warn!(script = %script, code = status.code().unwrap_or(-1), "hook exited non-zero");
                }
                Err(err) => {
                    warn!(script = %script, error = %err, "failed to spawn hook");
                }
                Ok(_) => {}
            }
        });
    }
}
