// src/grid/slurm.rs

//! Slurm queue: `sbatch` submission, `sacct` polling and accounting.

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

/// Submits to Slurm via generated `#SBATCH` scripts.
pub struct SlurmQueue {
    tmpdir: PathBuf,
    script_seq: AtomicU64,
}

impl SlurmQueue {
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
            .join(format!("task_{}_{}.slurm", script.task_id, seq));

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name={}", job_name(script)),
            format!("#SBATCH --mem={}", script.mem_mb),
            format!("#SBATCH --time={}", walltime(script.time_min)),
            "#SBATCH --ntasks=1".to_string(),
            format!("#SBATCH --cpus-per-task={}", script.cores),
            format!(
                "#SBATCH --output={}/task_{}_%j.out",
                self.tmpdir.display(),
                script.task_id
            ),
            format!(
                "#SBATCH --error={}/task_{}_%j.err",
                self.tmpdir.display(),
                script.task_id
            ),
        ];
        if let Some(partition) = &script.partition {
            lines.push(format!("#SBATCH --partition={partition}"));
        }
        lines.push(String::new());
        lines.extend(script.commands.iter().cloned());
        lines.push(String::new());

        std::fs::create_dir_all(&self.tmpdir)
            .with_context(|| format!("creating grid tmpdir {:?}", self.tmpdir))
            .map_err(RundagError::Other)?;
        std::fs::write(&path, lines.join("\n"))
            .with_context(|| format!("writing slurm script {path:?}"))
            .map_err(RundagError::Other)?;
        debug!(task = script.task_id, path = ?path, "wrote slurm script");
        Ok(path)
    }
}

fn job_name(script: &GridScript) -> String {
    format!("rundag_{}", script.task_id)
}

/// Map an `sacct` State field. Cancellation carries a suffix
/// (`CANCELLED by 1234`), so match on prefixes.
fn parse_state(raw: &str) -> GridJobState {
    let s = raw.trim().to_uppercase();
    if s.starts_with("PENDING") {
        GridJobState::Pending
    } else if s.starts_with("RUNNING") || s.starts_with("COMPLETING") {
        GridJobState::Running
    } else if s.starts_with("COMPLETED") {
        GridJobState::Completed
    } else if s.starts_with("TIMEOUT") {
        GridJobState::Timeout
    } else if s.starts_with("OUT_OF_MEMORY") || s.contains("OOM") {
        GridJobState::OutOfMemory
    } else if s.starts_with("FAILED")
        || s.starts_with("CANCELLED")
        || s.starts_with("NODE_FAIL")
        || s.starts_with("PREEMPTED")
    {
        GridJobState::Failed
    } else {
        // Anything unrecognized (e.g. REQUEUED) reads as still pending.
        GridJobState::Pending
    }
}

impl GridQueue for SlurmQueue {
    fn submit(&self, script: &GridScript) -> BoxFuture<'_, Result<JobId>> {
        let script = script.clone();
        Box::pin(async move {
            let path = self.write_script(&script)?;
            let stdout = capture_command(Command::new("sbatch").arg(&path)).await?;
            parse_job_id(&stdout).ok_or_else(|| {
                RundagError::Other(anyhow!("no job id in sbatch output: {}", stdout.trim()))
            })
        })
    }

    fn status(&self, job: &JobId) -> BoxFuture<'_, Result<GridJobState>> {
        let job = job.clone();
        Box::pin(async move {
            let stdout = capture_command(
                Command::new("sacct")
                    .args(["-j", &job, "--format=State", "--noheader", "--parsable2"]),
            )
            .await?;

            // An empty answer means accounting hasn't caught up yet.
            match stdout.lines().find(|l| !l.trim().is_empty()) {
                Some(line) => Ok(parse_state(line)),
                None => Ok(GridJobState::Pending),
            }
        })
    }

    fn benchmark(&self, job: &JobId) -> BoxFuture<'_, Result<Option<GridBenchmark>>> {
        let job = job.clone();
        Box::pin(async move {
            let stdout = capture_command(Command::new("sacct").args([
                "-j",
                &job,
                "--format=State,Elapsed,MaxRSS,AllocCPUS",
                "--noheader",
                "--parsable2",
            ]))
            .await?;

            // The batch line (second row) carries MaxRSS; fall back to the
            // first row when there is no batch step.
            let line = stdout
                .lines()
                .filter(|l| !l.trim().is_empty())
                .max_by_key(|l| l.split('|').nth(2).map(|m| m.len()).unwrap_or(0));

            Ok(line.map(|l| {
                let mut fields = l.split('|');
                GridBenchmark {
                    state: fields.next().unwrap_or("").to_string(),
                    elapsed: fields.next().unwrap_or("").to_string(),
                    max_mem: fields.next().unwrap_or("").to_string(),
                    cores: fields.next().unwrap_or("").to_string(),
                }
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sacct_states_map_to_job_states() {
        assert_eq!(parse_state("PENDING"), GridJobState::Pending);
        assert_eq!(parse_state("RUNNING"), GridJobState::Running);
        assert_eq!(parse_state("COMPLETED"), GridJobState::Completed);
        assert_eq!(parse_state("TIMEOUT"), GridJobState::Timeout);
        assert_eq!(parse_state("OUT_OF_MEMORY"), GridJobState::OutOfMemory);
        assert_eq!(parse_state("FAILED"), GridJobState::Failed);
        assert_eq!(parse_state("CANCELLED by 1001"), GridJobState::Failed);
    }

    #[test]
    fn scripts_carry_resources_and_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = SlurmQueue::new(dir.path().to_path_buf());

        let script = GridScript {
            task_id: 7,
            task_name: "align".into(),
            commands: vec!["bwa mem ref.fa reads.fq > out.sam".into()],
            mem_mb: 4000,
            time_min: 90,
            cores: 4,
            partition: Some("general".into()),
        };

        let path = queue.write_script(&script).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("#SBATCH --mem=4000"));
        assert!(contents.contains("#SBATCH --time=01:30:00"));
        assert!(contents.contains("#SBATCH --cpus-per-task=4"));
        assert!(contents.contains("#SBATCH --partition=general"));
        assert!(contents.contains("bwa mem"));
    }
}
