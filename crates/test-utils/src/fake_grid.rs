use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rundag::errors::{Result, RundagError};
use rundag::grid::{BoxFuture, GridBenchmark, GridJobState, GridQueue, GridScript, JobId};

/// A scripted grid queue.
///
/// Each submission consumes the next final state from the configured
/// sequence (so `[Timeout, Timeout, Completed]` simulates two escalations
/// before success). `status` reports `Running` on the first poll of a job
/// and the final state afterwards, letting callers observe the
/// Pending→Running→terminal progression without a real scheduler.
pub struct FakeGridQueue {
    final_states: Mutex<Vec<GridJobState>>,
    submissions: Mutex<Vec<GridScript>>,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    next_id: AtomicU64,
    benchmark_queries: AtomicU64,
    fail_submission: bool,
}

struct JobRecord {
    final_state: GridJobState,
    polls: u32,
}

impl FakeGridQueue {
    /// `final_states[i]` is the terminal state of the i-th submission.
    /// Submissions past the end of the list complete successfully.
    pub fn new(final_states: Vec<GridJobState>) -> Self {
        Self {
            final_states: Mutex::new(final_states),
            submissions: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            benchmark_queries: AtomicU64::new(0),
            fail_submission: false,
        }
    }

    /// A queue whose submissions always error (infrastructure failure).
    pub fn broken() -> Self {
        Self {
            final_states: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            benchmark_queries: AtomicU64::new(0),
            fail_submission: true,
        }
    }

    /// Scripts submitted so far, in order.
    pub fn submissions(&self) -> Vec<GridScript> {
        self.submissions.lock().unwrap().clone()
    }

    /// How many times accounting data was asked for.
    pub fn benchmark_queries(&self) -> u64 {
        self.benchmark_queries.load(Ordering::Relaxed)
    }
}

impl GridQueue for FakeGridQueue {
    fn submit(&self, script: &GridScript) -> BoxFuture<'_, Result<JobId>> {
        let script = script.clone();
        Box::pin(async move {
            if self.fail_submission {
                return Err(RundagError::Other(anyhow::anyhow!(
                    "fake queue rejects all submissions"
                )));
            }

            let index = {
                let mut submissions = self.submissions.lock().unwrap();
                submissions.push(script);
                submissions.len() - 1
            };
            let final_state = self
                .final_states
                .lock()
                .unwrap()
                .get(index)
                .copied()
                .unwrap_or(GridJobState::Completed);

            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            self.jobs.lock().unwrap().insert(
                id.clone(),
                JobRecord {
                    final_state,
                    polls: 0,
                },
            );
            Ok(id)
        })
    }

    fn status(&self, job: &JobId) -> BoxFuture<'_, Result<GridJobState>> {
        let job = job.clone();
        Box::pin(async move {
            let mut jobs = self.jobs.lock().unwrap();
            let record = jobs
                .get_mut(&job)
                .ok_or_else(|| RundagError::Other(anyhow::anyhow!("unknown job {job}")))?;
            record.polls += 1;
            if record.polls == 1 {
                Ok(GridJobState::Running)
            } else {
                Ok(record.final_state)
            }
        })
    }

    fn benchmark(&self, job: &JobId) -> BoxFuture<'_, Result<Option<GridBenchmark>>> {
        let job = job.clone();
        Box::pin(async move {
            self.benchmark_queries.fetch_add(1, Ordering::Relaxed);
            let jobs = self.jobs.lock().unwrap();
            Ok(jobs.get(&job).map(|record| GridBenchmark {
                state: format!("{:?}", record.final_state),
                elapsed: "00:01:00".to_string(),
                max_mem: "100M".to_string(),
                cores: "1".to_string(),
            }))
        })
    }
}
