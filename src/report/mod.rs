// src/report/mod.rs

//! Status reporting.
//!
//! The engine emits one [`StatusEvent`] per task state transition. Sinks
//! implement [`Reporter`]; implementations must not block, and the engine
//! never depends on their return value for correctness. Console and log
//! output live here; richer sinks (dashboards) are external consumers of
//! the same events.

use std::fmt;
use std::io::Write;

use chrono::{DateTime, Utc};

use crate::engine::TaskState;
use crate::graph::TaskId;

/// One state transition, as seen by reporting sinks.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: TaskId,
    pub description: String,
    pub state: TaskState,
    /// Terminal tasks so far (completed + skipped + failed).
    pub completed: usize,
    /// Fixed at run start: the number of non-skipped tasks.
    pub total: usize,
    /// Failure reason, grid status text, and similar.
    pub extra: Option<String>,
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} skipped, {} failed",
            self.completed, self.skipped, self.failed
        )
    }
}

/// A reporting sink. Events arrive on the orchestrating thread; do not
/// block in these callbacks.
pub trait Reporter: Send + Sync {
    fn started(&self, total: usize);
    fn event(&self, ev: &StatusEvent);
    fn finished(&self, summary: &RunSummary);
}

/// Fans events out to several reporters.
#[derive(Default)]
pub struct ReporterSet {
    reporters: Vec<Box<dyn Reporter>>,
}

impl ReporterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reporter: Box<dyn Reporter>) {
        self.reporters.push(reporter);
    }
}

impl Reporter for ReporterSet {
    fn started(&self, total: usize) {
        for r in &self.reporters {
            r.started(total);
        }
    }

    fn event(&self, ev: &StatusEvent) {
        for r in &self.reporters {
            r.event(ev);
        }
    }

    fn finished(&self, summary: &RunSummary) {
        for r in &self.reporters {
            r.finished(summary);
        }
    }
}

/// Prints run progress to stderr, one line per transition:
///
/// ```text
/// (s)[  1/  6 -  16.67%] Track inputs
/// (+)[  2/  6 -  33.33%] align reads
/// ```
///
/// `( )` started, `(+)` completed, `(s)` skipped, `(!)` failed.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn started(&self, _total: usize) {}

    fn event(&self, ev: &StatusEvent) {
        let symbol = match ev.state {
            TaskState::Started | TaskState::Running => "( )",
            TaskState::Completed => "(+)",
            TaskState::Skipped => "(s)",
            TaskState::Failed => "(!)",
            TaskState::Unevaluated | TaskState::Ready => return,
        };
        let pct = if ev.total == 0 {
            100.0
        } else {
            ev.completed as f64 / ev.total as f64 * 100.0
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "{symbol}[{:3}/{:3} - {:6.2}%] {}",
            ev.completed, ev.total, pct, ev.description
        );
    }

    fn finished(&self, summary: &RunSummary) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "Run finished: {summary}");
    }
}

/// Forwards every event to the tracing run log.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn started(&self, total: usize) {
        tracing::info!(total, "run started");
    }

    fn event(&self, ev: &StatusEvent) {
        tracing::info!(
            task = ev.task_id,
            state = ?ev.state,
            completed = ev.completed,
            total = ev.total,
            extra = ev.extra.as_deref().unwrap_or(""),
            "{}",
            ev.description
        );
    }

    fn finished(&self, summary: &RunSummary) {
        tracing::info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            interrupted = summary.interrupted,
            "run finished"
        );
    }
}

/// Appends every event to a run log file, one line per transition.
///
/// The file is opened in append mode so successive runs against the same
/// output directory accumulate.
pub struct FileReporter {
    path: std::path::PathBuf,
}

impl FileReporter {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, line: &str) {
        let opened = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        match opened {
            Ok(mut f) => {
                let _ = writeln!(f, "{line}");
            }
            Err(err) => {
                tracing::warn!(path = ?self.path, error = %err, "could not append to run log");
            }
        }
    }
}

impl Reporter for FileReporter {
    fn started(&self, total: usize) {
        self.append(&format!("{} run started ({total} tasks to run)", Utc::now()));
    }

    fn event(&self, ev: &StatusEvent) {
        let extra = ev.extra.as_deref().unwrap_or("");
        self.append(&format!(
            "{} task {} {:?} [{}/{}] {} {}",
            ev.timestamp, ev.task_id, ev.state, ev.completed, ev.total, ev.description, extra
        ));
    }

    fn finished(&self, summary: &RunSummary) {
        self.append(&format!("{} run finished: {summary}", Utc::now()));
    }
}

/// Discards all events; useful in tests.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn started(&self, _total: usize) {}
    fn event(&self, _ev: &StatusEvent) {}
    fn finished(&self, _summary: &RunSummary) {}
}
