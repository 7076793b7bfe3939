// src/grid/mod.rs

//! Grid backend: submission, polling and resource-escalation retries.
//!
//! Gridable tasks are shipped to an external batch scheduler (Slurm, SGE)
//! as generated job scripts. Each dispatched task gets its own async driver
//! that submits, polls at a fixed interval (grid schedulers rate-limit
//! status queries, so never busy-loop), and resubmits with doubled
//! resources on timeout / out-of-memory, up to three attempts.
//!
//! Submission and polling failures are infrastructure errors, retried a
//! short fixed number of times independent of the escalation counter.

pub mod resources;
pub mod sge;
pub mod slurm;

pub use resources::{ResourceRequest, ResourceSpec};
pub use sge::SgeQueue;
pub use slurm::SlurmQueue;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{FailReason, RunnerEvent, TaskOutcome};
use crate::errors::Result;
use crate::exec::ExecutorBackend;
use crate::graph::{Action, Task, TaskId};

/// Boxed future in the style the executor traits use.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Maximum submissions per task: the first plus two escalations.
pub const MAX_GRID_ATTEMPTS: u32 = 3;

/// Infrastructure retries for a single submit/poll call.
const INFRA_RETRIES: u32 = 3;

/// Identifier assigned by the external scheduler.
pub type JobId = String;

/// Observable states of an external job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridJobState {
    Submitted,
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    OutOfMemory,
}

impl GridJobState {
    /// Whether the scheduler is done with this job.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            GridJobState::Completed
                | GridJobState::Failed
                | GridJobState::Timeout
                | GridJobState::OutOfMemory
        )
    }
}

/// One submission attempt of a gridable task.
#[derive(Debug, Clone)]
pub struct GridJob {
    pub task_id: TaskId,
    pub external_id: JobId,
    pub state: GridJobState,
    /// 1-based; capped at [`MAX_GRID_ATTEMPTS`].
    pub attempt: u32,
    pub requested_mem_mb: u64,
    pub requested_time_min: u64,
}

/// Everything a queue needs to submit one job.
#[derive(Debug, Clone)]
pub struct GridScript {
    pub task_id: TaskId,
    pub task_name: String,
    pub commands: Vec<String>,
    pub mem_mb: u64,
    pub time_min: u64,
    pub cores: u32,
    pub partition: Option<String>,
}

/// Observed resource usage after a job stopped, for logging regardless of
/// whether escalation occurred.
#[derive(Debug, Clone, Default)]
pub struct GridBenchmark {
    pub state: String,
    pub elapsed: String,
    pub max_mem: String,
    pub cores: String,
}

/// Abstraction over a concrete batch scheduler.
pub trait GridQueue: Send + Sync {
    /// Submit a job; resolves to the external job id.
    fn submit(&self, script: &GridScript) -> BoxFuture<'_, Result<JobId>>;

    /// Ask the scheduler for the job's current state.
    fn status(&self, job: &JobId) -> BoxFuture<'_, Result<GridJobState>>;

    /// Fetch accounting data for a stopped job, if available.
    fn benchmark(&self, job: &JobId) -> BoxFuture<'_, Result<Option<GridBenchmark>>>;
}

/// Executor backend that drives gridable tasks through a [`GridQueue`].
///
/// Outstanding-submission concurrency is enforced by the core scheduler's
/// `grid_jobs` limit, so dispatch here just spawns a driver per task.
pub struct GridExecutor {
    queue: Arc<dyn GridQueue>,
    event_tx: mpsc::Sender<RunnerEvent>,
    poll_interval: Duration,
    collect_benchmark: bool,
    default_partition: Option<String>,
}

impl GridExecutor {
    pub fn new(
        queue: Arc<dyn GridQueue>,
        event_tx: mpsc::Sender<RunnerEvent>,
        poll_interval: Duration,
        collect_benchmark: bool,
        default_partition: Option<String>,
    ) -> Self {
        Self {
            queue,
            event_tx,
            poll_interval,
            collect_benchmark,
            default_partition,
        }
    }
}

impl ExecutorBackend for GridExecutor {
    fn dispatch(&mut self, task: Task) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let queue = Arc::clone(&self.queue);
        let tx = self.event_tx.clone();
        let poll_interval = self.poll_interval;
        let collect_benchmark = self.collect_benchmark;
        let partition = self.default_partition.clone();

        Box::pin(async move {
            tokio::spawn(async move {
                let id = task.id;
                let outcome =
                    drive_grid_task(&*queue, &task, &tx, poll_interval, collect_benchmark, partition)
                        .await;
                if tx
                    .send(RunnerEvent::TaskFinished { task: id, outcome })
                    .await
                    .is_err()
                {
                    debug!(task = id, "runtime event channel closed before grid completion");
                }
            });
            Ok(())
        })
    }
}

/// The submission & escalation state machine for one task.
async fn drive_grid_task(
    queue: &dyn GridQueue,
    task: &Task,
    event_tx: &mpsc::Sender<RunnerEvent>,
    poll_interval: Duration,
    collect_benchmark: bool,
    default_partition: Option<String>,
) -> TaskOutcome {
    let resources = task
        .resources
        .clone()
        .unwrap_or_else(|| ResourceRequest::fixed(1024, 60, 1));

    // Equations are evaluated now, at submission time, against dependency
    // sizes that may only exist since upstream tasks completed.
    let mut mem_mb = match resources.mem.evaluate(&task.depends, resources.cores) {
        Ok(v) => v,
        Err(e) => return infra_failure(task.id, format!("evaluating mem request: {e}")),
    };
    let mut time_min = match resources.time.evaluate(&task.depends, resources.cores) {
        Ok(v) => v,
        Err(e) => return infra_failure(task.id, format!("evaluating time request: {e}")),
    };
    let partition = resources.partition.clone().or(default_partition);

    let commands: Vec<String> = task
        .actions
        .iter()
        .map(|a| match a {
            Action::Shell(cmd) => cmd.clone(),
            // Rejected at graph validation; unreachable in a validated graph.
            Action::Func { name, .. } => format!("echo 'cannot run function {name} on grid'; exit 1"),
        })
        .collect();

    let mut last_reason = String::new();

    for attempt in 1..=MAX_GRID_ATTEMPTS {
        let script = GridScript {
            task_id: task.id,
            task_name: task.name.clone(),
            commands: commands.clone(),
            mem_mb,
            time_min,
            cores: resources.cores,
            partition: partition.clone(),
        };

        info!(
            task = task.id,
            attempt,
            mem_mb,
            time_min,
            cores = resources.cores,
            "submitting grid job"
        );

        let external_id = match submit_with_retry(queue, &script, poll_interval).await {
            Ok(id) => id,
            Err(e) => return infra_failure(task.id, format!("submission failed: {e}")),
        };

        let mut job = GridJob {
            task_id: task.id,
            external_id,
            state: GridJobState::Submitted,
            attempt,
            requested_mem_mb: mem_mb,
            requested_time_min: time_min,
        };

        let final_state = match poll_until_stopped(queue, &mut job, event_tx, poll_interval).await
        {
            Ok(state) => state,
            Err(e) => return infra_failure(task.id, format!("polling failed: {e}")),
        };

        if collect_benchmark && final_state.is_stopped() {
            report_benchmark(queue, &job).await;
        }

        match final_state {
            GridJobState::Completed => {
                return match crate::exec::local::post_run_check(task) {
                    Some(reason) => TaskOutcome::Failed(reason),
                    None => TaskOutcome::Success,
                };
            }
            GridJobState::Timeout => {
                last_reason = format!(
                    "timed out after {time_min} minutes (attempt {attempt}/{MAX_GRID_ATTEMPTS})"
                );
                warn!(task = task.id, %last_reason, "grid job timed out");
                time_min *= 2;
            }
            GridJobState::OutOfMemory => {
                last_reason = format!(
                    "out of memory at {mem_mb} MB (attempt {attempt}/{MAX_GRID_ATTEMPTS})"
                );
                warn!(task = task.id, %last_reason, "grid job ran out of memory");
                mem_mb *= 2;
            }
            GridJobState::Failed => {
                return TaskOutcome::Failed(FailReason::ActionFailed {
                    exit_code: -1,
                    detail: format!("grid job {} failed", job.external_id),
                });
            }
            // poll_until_stopped only returns stopped states.
            GridJobState::Submitted | GridJobState::Pending | GridJobState::Running => {
                unreachable!()
            }
        }
    }

    TaskOutcome::Failed(FailReason::ResourcesExhausted(last_reason))
}

fn infra_failure(task: TaskId, detail: String) -> TaskOutcome {
    warn!(task, %detail, "grid infrastructure failure");
    TaskOutcome::Failed(FailReason::GridInfrastructure(detail))
}

/// Submit, retrying transient failures with a linear backoff scaled to the
/// polling interval.
async fn submit_with_retry(
    queue: &dyn GridQueue,
    script: &GridScript,
    poll_interval: Duration,
) -> Result<JobId> {
    let mut last_err = None;
    for try_no in 1..=INFRA_RETRIES {
        match queue.submit(script).await {
            Ok(id) => return Ok(id),
            Err(e) => {
                warn!(
                    task = script.task_id,
                    try_no,
                    error = %e,
                    "grid submission attempt failed"
                );
                last_err = Some(e);
                if try_no < INFRA_RETRIES {
                    tokio::time::sleep(poll_interval * try_no).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        crate::errors::RundagError::Other(anyhow::anyhow!("submission retries exhausted"))
    }))
}

/// Poll the queue at a fixed interval until the job stops. Emits a
/// `TaskRunning` event the first time the job is seen on a node. Tolerates
/// a few consecutive polling errors before giving up.
async fn poll_until_stopped(
    queue: &dyn GridQueue,
    job: &mut GridJob,
    event_tx: &mpsc::Sender<RunnerEvent>,
    poll_interval: Duration,
) -> Result<GridJobState> {
    let mut consecutive_errors = 0;

    loop {
        tokio::time::sleep(poll_interval).await;

        let state = match queue.status(&job.external_id).await {
            Ok(state) => {
                consecutive_errors = 0;
                state
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    task = job.task_id,
                    grid_id = %job.external_id,
                    consecutive_errors,
                    error = %e,
                    "grid status query failed"
                );
                if consecutive_errors >= INFRA_RETRIES {
                    return Err(e);
                }
                continue;
            }
        };

        debug!(
            task = job.task_id,
            grid_id = %job.external_id,
            ?state,
            "grid job status"
        );

        if state == GridJobState::Running && job.state != GridJobState::Running {
            let _ = event_tx
                .send(RunnerEvent::TaskRunning {
                    task: job.task_id,
                    extra: Some(format!("grid id {}", job.external_id)),
                })
                .await;
        }
        job.state = state;

        if state.is_stopped() {
            return Ok(state);
        }
    }
}

/// Log observed usage for the attempt, whatever its final state.
async fn report_benchmark(queue: &dyn GridQueue, job: &GridJob) {
    match queue.benchmark(&job.external_id).await {
        Ok(Some(bench)) => {
            info!(
                task = job.task_id,
                grid_id = %job.external_id,
                attempt = job.attempt,
                requested_mem_mb = job.requested_mem_mb,
                requested_time_min = job.requested_time_min,
                state = %bench.state,
                elapsed = %bench.elapsed,
                max_mem = %bench.max_mem,
                cores = %bench.cores,
                "grid benchmark"
            );
        }
        Ok(None) => {}
        Err(e) => {
            warn!(
                task = job.task_id,
                grid_id = %job.external_id,
                error = %e,
                "failed to fetch grid benchmark"
            );
        }
    }
}

/// Run a scheduler command, capturing stdout; a non-zero exit is an error
/// carrying the command's stderr.
pub(crate) async fn capture_command(command: &mut tokio::process::Command) -> Result<String> {
    use anyhow::anyhow;

    let output = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .map_err(crate::errors::RundagError::IoError)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(crate::errors::RundagError::Other(anyhow!(
            "scheduler command exited with {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Format minutes as the `HH:MM:00` walltime string schedulers expect.
pub(crate) fn walltime(minutes: u64) -> String {
    let (hours, remaining) = (minutes / 60, minutes % 60);
    format!("{hours:02}:{remaining:02}:00")
}

/// Extract the first decimal run of a scheduler's submission output, e.g.
/// `Submitted batch job 123456` or `Your job 42 ("x") has been submitted`.
pub(crate) fn parse_job_id(stdout: &str) -> Option<JobId> {
    let re = regex::Regex::new(r"\d+").ok()?;
    re.find(stdout).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slurm_style_submission_output() {
        assert_eq!(
            parse_job_id("Submitted batch job 123456\n").as_deref(),
            Some("123456")
        );
    }

    #[test]
    fn parses_sge_style_submission_output() {
        assert_eq!(
            parse_job_id("Your job 42 (\"align\") has been submitted").as_deref(),
            Some("42")
        );
    }

    #[test]
    fn no_digits_means_no_job_id() {
        assert_eq!(parse_job_id("error: queue unreachable"), None);
    }

    #[test]
    fn stopped_states_are_terminal() {
        assert!(GridJobState::Completed.is_stopped());
        assert!(GridJobState::Timeout.is_stopped());
        assert!(GridJobState::OutOfMemory.is_stopped());
        assert!(GridJobState::Failed.is_stopped());
        assert!(!GridJobState::Pending.is_stopped());
        assert!(!GridJobState::Running.is_stopped());
    }
}
