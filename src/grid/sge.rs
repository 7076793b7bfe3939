// src/grid/sge.rs

//! SGE queue: `qsub` submission, `qstat`/`qacct` polling and accounting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, anyhow};
use tokio::process::Command;
use tracing::debug;

use crate::errors::{Result, RundagError};

use super::{
    BoxFuture, GridBenchmark, GridJobState, GridQueue, GridScript, JobId, capture_command,
    parse_job_id, walltime,
};

/// Submits to SGE (or compatible, e.g. OGE) via generated `#$` scripts.
pub struct SgeQueue {
    tmpdir: PathBuf,
    script_seq: AtomicU64,
}

impl SgeQueue {
    pub fn new(tmpdir: PathBuf) -> Self {
        Self {
            tmpdir,
            script_seq: AtomicU64::new(0),
        }
    }

    fn write_script(&self, script: &GridScript) -> Result<PathBuf> {
        let seq = self.script_seq.fetch_add(1, Ordering::Relaxed);
        let path = self
            .tmpdir
            .join(format!("task_{}_{}.sge", script.task_id, seq));

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#$ -N rundag_{}", script.task_id),
            "#$ -cwd".to_string(),
            format!("#$ -pe smp {}", script.cores),
            format!("#$ -l h_rt={}", walltime(script.time_min)),
            format!("#$ -l h_vmem={}M", script.mem_mb),
            format!("#$ -o {}/task_{}.out", self.tmpdir.display(), script.task_id),
            format!("#$ -e {}/task_{}.err", self.tmpdir.display(), script.task_id),
        ];
        if let Some(queue_name) = &script.partition {
            lines.push(format!("#$ -q {queue_name}"));
        }
        lines.push(String::new());
        lines.extend(script.commands.iter().cloned());
        lines.push(String::new());

        std::fs::create_dir_all(&self.tmpdir)
            .with_context(|| format!("creating grid tmpdir {:?}", self.tmpdir))
            .map_err(RundagError::Other)?;
        std::fs::write(&path, lines.join("\n"))
            .with_context(|| format!("writing sge script {path:?}"))
            .map_err(RundagError::Other)?;
        debug!(task = script.task_id, path = ?path, "wrote sge script");
        Ok(path)
    }

    /// Look up a finished job's accounting record.
    async fn qacct(&self, job: &JobId) -> Result<GridJobState> {
        let stdout = capture_command(Command::new("qacct").args(["-j", job])).await?;

        let field = |name: &str| -> Option<String> {
            stdout.lines().find_map(|l| {
                l.strip_prefix(name)
                    .map(|rest| rest.trim().to_string())
            })
        };

        let failed = field("failed").unwrap_or_default();
        let exit_status = field("exit_status").unwrap_or_default();

        // SGE encodes resource kills in the `failed' field, e.g.
        // `37  : qmaster enforced h_rt limit'.
        if failed.contains("h_rt") || failed.contains("wallclock") {
            return Ok(GridJobState::Timeout);
        }
        if failed.contains("h_vmem") || failed.contains("mem") {
            return Ok(GridJobState::OutOfMemory);
        }
        if exit_status.starts_with('0') && failed.starts_with('0') {
            Ok(GridJobState::Completed)
        } else {
            Ok(GridJobState::Failed)
        }
    }
}

/// Map a `qstat` state column: `qw`/`hqw` pending, `r`/`t` running,
/// `Eqw` stuck with an error.
fn parse_qstat_state(raw: &str) -> GridJobState {
    if raw.contains('E') {
        GridJobState::Failed
    } else if raw.contains('r') || raw.contains('t') {
        GridJobState::Running
    } else {
        GridJobState::Pending
    }
}

impl GridQueue for SgeQueue {
    fn submit(&self, script: &GridScript) -> BoxFuture<'_, Result<JobId>> {
        let script = script.clone();
        Box::pin(async move {
            let path = self.write_script(&script)?;
            let stdout = capture_command(Command::new("qsub").arg(&path)).await?;
            parse_job_id(&stdout).ok_or_else(|| {
                RundagError::Other(anyhow!("no job id in qsub output: {}", stdout.trim()))
            })
        })
    }

    fn status(&self, job: &JobId) -> BoxFuture<'_, Result<GridJobState>> {
        let job = job.clone();
        Box::pin(async move {
            let stdout = capture_command(&mut Command::new("qstat")).await?;

            // While the job is listed, qstat's state column is live truth;
            // once it disappears, accounting has the final word.
            for line in stdout.lines() {
                let mut fields = line.split_whitespace();
                if fields.next() == Some(job.as_str()) {
                    let state = fields.nth(3).unwrap_or("");
                    return Ok(parse_qstat_state(state));
                }
            }

            self.qacct(&job).await
        })
    }

    fn benchmark(&self, job: &JobId) -> BoxFuture<'_, Result<Option<GridBenchmark>>> {
        let job = job.clone();
        Box::pin(async move {
            let stdout = capture_command(Command::new("qacct").args(["-j", &job])).await?;

            let field = |name: &str| -> String {
                stdout
                    .lines()
                    .find_map(|l| l.strip_prefix(name).map(|rest| rest.trim().to_string()))
                    .unwrap_or_default()
            };

            Ok(Some(GridBenchmark {
                state: field("exit_status"),
                elapsed: field("ru_wallclock"),
                max_mem: field("maxvmem"),
                cores: field("slots"),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qstat_states_map_to_job_states() {
        assert_eq!(parse_qstat_state("qw"), GridJobState::Pending);
        assert_eq!(parse_qstat_state("hqw"), GridJobState::Pending);
        assert_eq!(parse_qstat_state("r"), GridJobState::Running);
        assert_eq!(parse_qstat_state("t"), GridJobState::Running);
        assert_eq!(parse_qstat_state("Eqw"), GridJobState::Failed);
    }

    #[test]
    fn scripts_carry_resources_and_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = SgeQueue::new(dir.path().to_path_buf());

        let script = GridScript {
            task_id: 3,
            task_name: "sort".into(),
            commands: vec!["sort big.txt > sorted.txt".into()],
            mem_mb: 2000,
            time_min: 30,
            cores: 2,
            partition: Some("short.q".into()),
        };

        let path = queue.write_script(&script).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("#$ -pe smp 2"));
        assert!(contents.contains("#$ -l h_rt=00:30:00"));
        assert!(contents.contains("#$ -l h_vmem=2000M"));
        assert!(contents.contains("#$ -q short.q"));
        assert!(contents.contains("sort big.txt"));
    }
}
