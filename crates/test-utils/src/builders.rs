#![allow(dead_code)]

use rundag::config::RunConfig;
use rundag::engine::TaskState;
use rundag::engine::core::CoreOptions;
use rundag::graph::{TaskGraph, TaskId, TaskSpec};
use rundag::plan::RunPlan;

/// Builder for small task graphs in tests.
///
/// Tasks are registered in call order, so ids are predictable; item paths
/// are passed through [`TaskSpec::depends_on`] / [`TaskSpec::produces`]
/// normalization.
pub struct GraphBuilder {
    graph: TaskGraph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            graph: TaskGraph::new(),
        }
    }

    /// Add a shell task; returns the builder for chaining.
    pub fn task(mut self, name: &str, depends: &[&str], targets: &[&str]) -> Self {
        self.graph
            .add_task(
                TaskSpec::shell(format!("run {name}"))
                    .named(name)
                    .depends_on(depends.iter().copied())
                    .produces(targets.iter().copied()),
            )
            .expect("failed to add task in GraphBuilder");
        self
    }

    /// Add a pre-built spec.
    pub fn spec(mut self, spec: TaskSpec) -> Self {
        self.graph
            .add_task(spec)
            .expect("failed to add spec in GraphBuilder");
        self
    }

    /// Finish without validation; edges come from incremental linking.
    pub fn build(self) -> TaskGraph {
        self.graph
    }

    /// Finish with full validation (non-strict).
    pub fn build_validated(mut self) -> TaskGraph {
        self.graph
            .validate(false)
            .expect("GraphBuilder graph failed validation");
        self.graph
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A plan that runs every task in the graph, bypassing fingerprint checks.
pub fn all_runnable_plan(graph: &TaskGraph) -> RunPlan {
    RunPlan {
        states: vec![TaskState::Unevaluated; graph.len()],
        total_runnable: graph.len(),
        until_task: None,
    }
}

/// A plan with the given tasks skipped and the rest runnable.
pub fn plan_with_skips(graph: &TaskGraph, skipped: &[TaskId]) -> RunPlan {
    let mut states = vec![TaskState::Unevaluated; graph.len()];
    for &id in skipped {
        states[id] = TaskState::Skipped;
    }
    let total_runnable = graph.len() - skipped.len();
    RunPlan {
        states,
        total_runnable,
        until_task: None,
    }
}

/// Local-only core options with the given worker count.
pub fn local_options(local_jobs: usize) -> CoreOptions {
    CoreOptions {
        local_jobs,
        grid_jobs: 1,
        quit_early: false,
        grid_enabled: false,
    }
}

/// Grid-enabled core options.
pub fn grid_options(local_jobs: usize, grid_jobs: usize) -> CoreOptions {
    CoreOptions {
        local_jobs,
        grid_jobs,
        quit_early: false,
        grid_enabled: true,
    }
}

/// A default run config pointed at a temp output directory.
pub fn run_config_for(output_dir: &std::path::Path) -> RunConfig {
    RunConfig {
        output_dir: output_dir.to_path_buf(),
        ..RunConfig::default()
    }
}
