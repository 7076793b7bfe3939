use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use rundag::engine::{FailReason, RunnerEvent, TaskOutcome};
use rundag::errors::Result;
use rundag::exec::ExecutorBackend;
use rundag::graph::{Task, TaskId};

/// Tracks how many fake tasks are "executing" at once.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneously-executing tasks observed.
    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// A fake executor that:
/// - records which tasks were dispatched (in order),
/// - optionally sleeps to simulate work,
/// - reports `TaskFinished` with success, or failure for tasks in the
///   failing set.
pub struct FakeExecutor {
    event_tx: mpsc::Sender<RunnerEvent>,
    executed: Arc<Mutex<Vec<TaskId>>>,
    failing: HashSet<TaskId>,
    delay: Option<Duration>,
    gauge: Arc<ConcurrencyGauge>,
}

impl FakeExecutor {
    pub fn new(event_tx: mpsc::Sender<RunnerEvent>, executed: Arc<Mutex<Vec<TaskId>>>) -> Self {
        Self {
            event_tx,
            executed,
            failing: HashSet::new(),
            delay: None,
            gauge: Arc::new(ConcurrencyGauge::default()),
        }
    }

    /// Make the given tasks report failure instead of success.
    pub fn failing(mut self, tasks: impl IntoIterator<Item = TaskId>) -> Self {
        self.failing.extend(tasks);
        self
    }

    /// Sleep this long per task before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn gauge(&self) -> Arc<ConcurrencyGauge> {
        Arc::clone(&self.gauge)
    }
}

impl ExecutorBackend for FakeExecutor {
    fn dispatch(&mut self, task: Task) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.event_tx.clone();
        let executed = Arc::clone(&self.executed);
        let gauge = Arc::clone(&self.gauge);
        let fail = self.failing.contains(&task.id);
        let delay = self.delay;

        Box::pin(async move {
            tokio::spawn(async move {
                gauge.enter();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                executed.lock().unwrap().push(task.id);
                gauge.exit();

                let outcome = if fail {
                    TaskOutcome::Failed(FailReason::ActionFailed {
                        exit_code: 1,
                        detail: "fake failure".to_string(),
                    })
                } else {
                    TaskOutcome::Success
                };
                let _ = tx
                    .send(RunnerEvent::TaskFinished {
                        task: task.id,
                        outcome,
                    })
                    .await;
            });
            Ok(())
        })
    }
}

/// An executor that drops every dispatch on the floor; tasks never finish.
/// Useful for asserting that something was (or was not) dispatched.
pub struct BlackHoleExecutor {
    pub dispatched: Arc<Mutex<Vec<TaskId>>>,
}

impl BlackHoleExecutor {
    pub fn new() -> Self {
        Self {
            dispatched: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for BlackHoleExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorBackend for BlackHoleExecutor {
    fn dispatch(&mut self, task: Task) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let dispatched = Arc::clone(&self.dispatched);
        Box::pin(async move {
            dispatched.lock().unwrap().push(task.id);
            Ok(())
        })
    }
}
