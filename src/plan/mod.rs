// src/plan/mod.rs

//! Run planning: which tasks are in scope, which can be skipped.
//!
//! Planning happens once, before execution:
//!
//! 1. `--target` / `--exclude-target` / `--exclude-task` filters are
//!    resolved to a keep set (ancestor closures of matched producers) and a
//!    drop set (descendant closures of exclusions).
//! 2. Every task left in scope is checked against the history store: a task
//!    whose targets and depends all exist with unchanged fingerprints is
//!    skipped. A change anywhere propagates to all descendants.
//!
//! The result fixes `total` for progress accounting; skipped tasks satisfy
//! their children without running.

use std::collections::HashSet;

use globset::Glob;
use tracing::debug;

use crate::config::RunConfig;
use crate::engine::TaskState;
use crate::errors::{Result, RundagError};
use crate::graph::{TaskGraph, TaskId};
use crate::history::HistoryStore;
use crate::tracked::{FingerprintPolicy, is_different};

/// The planned run: initial state per task plus progress bookkeeping.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Initial state per task id: `Unevaluated` (will run) or `Skipped`.
    pub states: Vec<TaskState>,
    /// Fixed at plan time: how many tasks are not skipped.
    pub total_runnable: usize,
    /// Resolved `--until-task`, if any.
    pub until_task: Option<TaskId>,
}

impl RunPlan {
    /// Ids of tasks that would run, ascending.
    pub fn would_run(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s, TaskState::Skipped))
            .map(|(id, _)| id)
    }

    pub fn is_skipped(&self, id: TaskId) -> bool {
        matches!(self.states[id], TaskState::Skipped)
    }
}

/// Compute the run plan for a validated graph.
pub fn plan(graph: &TaskGraph, history: &HistoryStore, config: &RunConfig) -> Result<RunPlan> {
    let policy = FingerprintPolicy {
        huge_file_threshold_mb: config.huge_file_threshold_mb,
    };

    let in_scope = filter_scope(graph, config)?;
    let should_run = evaluate_skips(graph, history, &policy, &in_scope, config.skip_nothing);

    let mut states = vec![TaskState::Skipped; graph.len()];
    let mut total_runnable = 0;
    for id in 0..graph.len() {
        if in_scope.contains(&id) && should_run.contains(&id) {
            states[id] = TaskState::Unevaluated;
            total_runnable += 1;
        }
    }

    let until_task = match &config.until_task {
        Some(name) => Some(
            graph
                .find(name)
                .ok_or_else(|| RundagError::TaskNotFound(name.clone()))?,
        ),
        None => None,
    };

    debug!(
        total = graph.len(),
        runnable = total_runnable,
        "run plan computed"
    );

    Ok(RunPlan {
        states,
        total_runnable,
        until_task,
    })
}

/// Apply target/exclude filters; returns the ids still in scope.
fn filter_scope(graph: &TaskGraph, config: &RunConfig) -> Result<HashSet<TaskId>> {
    let mut keep: HashSet<TaskId> = HashSet::new();
    let mut drop: HashSet<TaskId> = HashSet::new();

    for pattern in &config.targets {
        for producer in match_target_producers(graph, pattern)? {
            keep.extend(graph.ancestors_of(producer));
        }
    }
    for pattern in &config.exclude_targets {
        for producer in match_target_producers(graph, pattern)? {
            drop.extend(graph.descendants_of(producer));
        }
    }
    for name in &config.exclude_tasks {
        let id = graph
            .find(name)
            .ok_or_else(|| RundagError::TaskNotFound(name.clone()))?;
        drop.extend(graph.descendants_of(id));
    }

    if keep.is_empty() {
        keep.extend(0..graph.len());
    }

    Ok(keep.difference(&drop).copied().collect())
}

/// Tasks producing a target matching `pattern`. Patterns containing
/// `*`, `?` or `[` use glob semantics; anything else must match a target
/// path exactly (relative forms are compared absolutized). Matching
/// nothing is an error, not a silent no-op.
fn match_target_producers(graph: &TaskGraph, pattern: &str) -> Result<Vec<TaskId>> {
    let is_glob = pattern.contains(['*', '?', '[']);
    let mut producers = Vec::new();

    if is_glob {
        let matcher = Glob::new(pattern)
            .map_err(|e| RundagError::ConfigError(format!("bad target pattern `{pattern}': {e}")))?
            .compile_matcher();
        let abs_matcher = Glob::new(&absolutize_str(pattern))
            .ok()
            .map(|g| g.compile_matcher());

        for (key, producer) in graph.all_targets() {
            let path = key_path(&key.0);
            if matcher.is_match(path)
                || abs_matcher.as_ref().is_some_and(|m| m.is_match(path))
            {
                producers.push(producer);
            }
        }
    } else {
        let absolute = absolutize_str(pattern);
        for (key, producer) in graph.all_targets() {
            let path = key_path(&key.0);
            if path == pattern || path == absolute {
                producers.push(producer);
            }
        }
    }

    if producers.is_empty() {
        return Err(RundagError::ConfigError(format!(
            "target `{pattern}' matched no task targets"
        )));
    }
    producers.sort_unstable();
    producers.dedup();
    Ok(producers)
}

/// Strip the kind prefix off an item key, leaving the path/identity part.
fn key_path(key: &str) -> &str {
    key.split_once(':').map(|(_, rest)| rest).unwrap_or(key)
}

fn absolutize_str(s: &str) -> String {
    std::path::absolute(s)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Which in-scope tasks actually need to run.
fn evaluate_skips(
    graph: &TaskGraph,
    history: &HistoryStore,
    policy: &FingerprintPolicy,
    in_scope: &HashSet<TaskId>,
    skip_nothing: bool,
) -> HashSet<TaskId> {
    let mut should_run: HashSet<TaskId> = HashSet::new();

    for &id in in_scope {
        if skip_nothing || task_needs_run(graph, history, policy, id) {
            should_run.insert(id);
        }
    }

    // A change anywhere reruns the whole downstream subtree: a parent that
    // runs will rewrite its targets, so children cannot trust their stored
    // fingerprints.
    let roots: Vec<TaskId> = should_run.iter().copied().collect();
    for id in roots {
        for descendant in graph.descendants_of(id) {
            if in_scope.contains(&descendant) {
                should_run.insert(descendant);
            }
        }
    }

    should_run
}

fn task_needs_run(
    graph: &TaskGraph,
    history: &HistoryStore,
    policy: &FingerprintPolicy,
    id: TaskId,
) -> bool {
    let task = graph.get(id);

    // Nothing tracked means nothing to compare against.
    if task.targets.is_empty() && task.depends.is_empty() {
        debug!(task = id, "must run: no targets or depends to check");
        return true;
    }

    for item in task.targets.iter().chain(task.depends.iter()) {
        if !item.exists() {
            debug!(task = id, key = %item.key(), "must run: item missing");
            return true;
        }
        if is_different(item, history.lookup(&item.key()), policy) {
            debug!(task = id, key = %item.key(), "must run: item changed");
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskSpec;
    use crate::tracked::TrackedItem;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// a -> b -> c chain over real files.
    fn chain_graph(dir: &TempDir) -> (TaskGraph, [String; 3]) {
        let input = write(dir, "input.txt", "data");
        let mid = dir.path().join("mid.txt").to_string_lossy().into_owned();
        let out = dir.path().join("out.txt").to_string_lossy().into_owned();

        let mut graph = TaskGraph::new();
        graph
            .add_task(
                TaskSpec::shell("step a")
                    .named("a")
                    .depends_on([input.as_str()])
                    .produces([mid.as_str()]),
            )
            .unwrap();
        graph
            .add_task(
                TaskSpec::shell("step b")
                    .named("b")
                    .depends_on([mid.as_str()])
                    .produces([out.as_str()]),
            )
            .unwrap();
        graph
            .add_task(TaskSpec::shell("step c").named("c").depends_on([out.as_str()]))
            .unwrap();
        graph.validate(false).unwrap();
        (graph, [input, mid, out])
    }

    fn record_all(graph: &TaskGraph, history: &mut HistoryStore) {
        let policy = FingerprintPolicy::default();
        for task in graph.tasks() {
            for item in task.targets.iter().chain(task.depends.iter()) {
                if let Ok(fp) = item.fingerprint(&policy) {
                    history.record(item.key(), fp, task.id);
                }
            }
        }
    }

    #[test]
    fn fresh_graph_runs_everything() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = chain_graph(&dir);
        let history = HistoryStore::in_memory();

        let plan = plan(&graph, &history, &RunConfig::default()).unwrap();
        assert_eq!(plan.would_run().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(plan.total_runnable, 3);
    }

    #[test]
    fn unchanged_graph_skips_everything() {
        let dir = TempDir::new().unwrap();
        let (graph, [_, mid, out]) = chain_graph(&dir);
        fs::write(&mid, "mid").unwrap();
        fs::write(&out, "out").unwrap();

        let mut history = HistoryStore::in_memory();
        record_all(&graph, &mut history);

        let plan = plan(&graph, &history, &RunConfig::default()).unwrap();
        assert_eq!(plan.total_runnable, 0);
    }

    #[test]
    fn deleted_target_reruns_its_task_and_descendants_only() {
        let dir = TempDir::new().unwrap();
        let (graph, [_, mid, out]) = chain_graph(&dir);
        fs::write(&mid, "mid").unwrap();
        fs::write(&out, "out").unwrap();

        let mut history = HistoryStore::in_memory();
        record_all(&graph, &mut history);

        fs::remove_file(&out).unwrap();

        let plan = plan(&graph, &history, &RunConfig::default()).unwrap();
        // b's target is gone; b and its dependent c rerun, a stays skipped.
        assert_eq!(plan.would_run().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn skip_nothing_runs_everything() {
        let dir = TempDir::new().unwrap();
        let (graph, [_, mid, out]) = chain_graph(&dir);
        fs::write(&mid, "mid").unwrap();
        fs::write(&out, "out").unwrap();

        let mut history = HistoryStore::in_memory();
        record_all(&graph, &mut history);

        let config = RunConfig {
            skip_nothing: true,
            ..RunConfig::default()
        };
        let plan = plan(&graph, &history, &config).unwrap();
        assert_eq!(plan.total_runnable, 3);
    }

    #[test]
    fn target_filter_keeps_ancestor_closure() {
        let dir = TempDir::new().unwrap();
        let (graph, [_, mid, _]) = chain_graph(&dir);
        let history = HistoryStore::in_memory();

        let config = RunConfig {
            targets: vec![mid.clone()],
            ..RunConfig::default()
        };
        let plan = plan(&graph, &history, &config).unwrap();
        // mid is produced by a; only a is kept, b and c are filtered out.
        assert_eq!(plan.would_run().collect::<Vec<_>>(), vec![0]);
        assert!(plan.is_skipped(1));
        assert!(plan.is_skipped(2));
    }

    #[test]
    fn target_glob_patterns_match() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = chain_graph(&dir);
        let history = HistoryStore::in_memory();

        let config = RunConfig {
            targets: vec![format!("{}/mid.*", dir.path().display())],
            ..RunConfig::default()
        };
        let plan = plan(&graph, &history, &config).unwrap();
        assert_eq!(plan.would_run().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn exclude_task_drops_descendants() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = chain_graph(&dir);
        let history = HistoryStore::in_memory();

        let config = RunConfig {
            exclude_tasks: vec!["b".to_string()],
            ..RunConfig::default()
        };
        let plan = plan(&graph, &history, &config).unwrap();
        assert_eq!(plan.would_run().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn unmatched_target_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = chain_graph(&dir);
        let history = HistoryStore::in_memory();

        let config = RunConfig {
            targets: vec!["no/such/target".to_string()],
            ..RunConfig::default()
        };
        assert!(plan(&graph, &history, &config).is_err());
    }

    #[test]
    fn variable_change_invalidates_dependents() {
        let dir = TempDir::new().unwrap();
        let out = write(&dir, "out.txt", "x");

        let mut graph = TaskGraph::new();
        graph
            .add_task(
                TaskSpec::shell("run")
                    .named("t")
                    .depends_on_items([TrackedItem::variable("run", "threads", 4)])
                    .produces([out.as_str()]),
            )
            .unwrap();
        graph.validate(false).unwrap();

        let mut history = HistoryStore::in_memory();
        record_all(&graph, &mut history);

        // Unchanged: skipped.
        let p = plan(&graph, &history, &RunConfig::default()).unwrap();
        assert_eq!(p.total_runnable, 0);

        // Rebuild with a different value: must run.
        let mut graph = TaskGraph::new();
        graph
            .add_task(
                TaskSpec::shell("run")
                    .named("t")
                    .depends_on_items([TrackedItem::variable("run", "threads", 8)])
                    .produces([out.as_str()]),
            )
            .unwrap();
        graph.validate(false).unwrap();

        let p = plan(&graph, &history, &RunConfig::default()).unwrap();
        assert_eq!(p.total_runnable, 1);
    }
}
