// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cli::CliArgs;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [run]
/// output = "out"
/// local_jobs = 4
///
/// [grid]
/// backend = "slurm"
/// partition = "general"
///
/// [task.align]
/// actions = ["bwa mem {depends[0]} > {targets[0]}"]
/// depends = ["reads.fq"]
/// targets = ["out/aligned.sam"]
/// gridable = true
/// mem = 4000
/// time = 60
/// cores = 4
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Run defaults from `[run]`.
    #[serde(default)]
    pub run: RunSection,

    /// Grid settings from `[grid]`; absent means local-only execution.
    #[serde(default)]
    pub grid: Option<GridSection>,

    /// Lifecycle hook scripts from `[hooks]`.
    #[serde(default)]
    pub hooks: HooksSection,

    /// All tasks from `[task.<name>]`. Keys are the task names.
    #[serde(default)]
    pub task: BTreeMap<String, TaskSection>,
}

/// `[run]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_input")]
    pub input: String,

    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_jobs")]
    pub local_jobs: usize,

    #[serde(default = "default_jobs")]
    pub grid_jobs: usize,

    #[serde(default)]
    pub quit_early: bool,

    #[serde(default)]
    pub skip_nothing: bool,

    #[serde(default)]
    pub strict: bool,

    /// `File` items larger than this many MB are fingerprinted by
    /// size + mtime only, as if declared huge. Unset means only
    /// explicitly-declared huge files skip checksumming.
    #[serde(default)]
    pub huge_file_threshold_mb: Option<u64>,
}

fn default_input() -> String {
    "input".to_string()
}

fn default_output() -> String {
    "output".to_string()
}

fn default_jobs() -> usize {
    1
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            input: default_input(),
            output: default_output(),
            local_jobs: default_jobs(),
            grid_jobs: default_jobs(),
            quit_early: false,
            skip_nothing: false,
            strict: false,
            huge_file_threshold_mb: None,
        }
    }
}

/// `[grid]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GridSection {
    /// `"slurm"` or `"sge"`.
    pub backend: String,

    #[serde(default)]
    pub partition: Option<String>,

    /// How often to ask the scheduler about outstanding jobs, in seconds.
    /// Grid schedulers rate-limit status queries; never poll finer than this.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Where grid scripts and captured output land. Must be readable by all
    /// nodes in the cluster.
    #[serde(default = "default_grid_tmpdir")]
    pub tmpdir: String,

    /// Capture observed wall time / memory / cores after each job.
    #[serde(default = "default_true")]
    pub benchmark: bool,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_grid_tmpdir() -> String {
    ".rundag/grid".to_string()
}

fn default_true() -> bool {
    true
}

/// `[hooks]` section: optional external scripts run at lifecycle points.
///
/// Hooks for skipped tasks and for tasks that never ran (interrupt,
/// cascading failure) are not invoked.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HooksSection {
    /// Before the whole run.
    #[serde(default)]
    pub start: Option<String>,

    /// After the run, when every task completed or was skipped.
    #[serde(default)]
    pub success: Option<String>,

    /// After the run, when any task failed.
    #[serde(default)]
    pub failure: Option<String>,

    /// After each individual task success.
    #[serde(default)]
    pub task_success: Option<String>,

    /// After each individual task failure.
    #[serde(default)]
    pub task_failure: Option<String>,
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    /// Shell commands executed in order. `{depends[i]}`, `{targets[i]}`,
    /// `{input}` and `{output}` are interpolated at registration time.
    pub actions: Vec<String>,

    /// Tracked dependencies. Bare paths become file items; a trailing `/`
    /// marks a directory; `glob:`, `exe:`, `bigfile:` prefixes select the
    /// other kinds.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Tracked targets, same syntax as `depends`.
    #[serde(default)]
    pub targets: Vec<String>,

    /// Submit to the grid backend instead of running locally.
    #[serde(default)]
    pub gridable: bool,

    /// Memory request in MB, or an equation over `cores` / `depends[i]`.
    #[serde(default)]
    pub mem: Option<ResourceField>,

    /// Time request in minutes, or an equation.
    #[serde(default)]
    pub time: Option<ResourceField>,

    #[serde(default)]
    pub cores: Option<u32>,

    /// Per-task partition override.
    #[serde(default)]
    pub partition: Option<String>,
}

/// A resource request: either a literal amount or an equation string that
/// is evaluated at submission time (sizes of upstream outputs may not be
/// known until their producers complete).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResourceField {
    Amount(u64),
    Equation(String),
}

/// Validated configuration file.
///
/// Constructed via `TryFrom<RawConfigFile>` (see [`super::validate`]);
/// use [`super::loader::load_and_validate`] to obtain one from disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub run: RunSection,
    pub grid: Option<GridSection>,
    pub hooks: HooksSection,
    pub task: BTreeMap<String, TaskSection>,
}

impl ConfigFile {
    /// Construct without validation. Only `validate` should call this.
    pub(crate) fn new_unchecked(
        run: RunSection,
        grid: Option<GridSection>,
        hooks: HooksSection,
        task: BTreeMap<String, TaskSection>,
    ) -> Self {
        Self {
            run,
            grid,
            hooks,
            task,
        }
    }
}

/// Which grid backend to submit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridKind {
    Slurm,
    Sge,
}

impl GridKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "slurm" => Some(GridKind::Slurm),
            "sge" => Some(GridKind::Sge),
            _ => None,
        }
    }
}

/// Resolved grid settings.
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub kind: GridKind,
    pub partition: Option<String>,
    pub poll_interval: Duration,
    pub tmpdir: PathBuf,
    pub benchmark: bool,
}

/// The fully resolved run configuration the engine consumes.
///
/// CLI flags override file values. The engine treats this as an opaque,
/// pre-parsed struct; nothing downstream re-reads the CLI or the TOML.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub local_jobs: usize,
    pub grid_jobs: usize,
    pub grid: Option<GridConfig>,
    pub targets: Vec<String>,
    pub exclude_targets: Vec<String>,
    pub exclude_tasks: Vec<String>,
    pub until_task: Option<String>,
    pub dry_run: bool,
    pub quit_early: bool,
    pub skip_nothing: bool,
    pub strict: bool,
    pub huge_file_threshold_mb: Option<u64>,
    pub hooks: HooksSection,
}

impl RunConfig {
    /// Merge CLI arguments over file values.
    pub fn resolve(args: &CliArgs, cfg: &ConfigFile) -> crate::errors::Result<Self> {
        let grid_name = args
            .grid
            .clone()
            .or_else(|| cfg.grid.as_ref().map(|g| g.backend.clone()));

        let grid = match grid_name {
            Some(name) => {
                let kind = GridKind::parse(&name).ok_or_else(|| {
                    crate::errors::RundagError::ConfigError(format!(
                        "unknown grid backend `{name}' (expected \"slurm\" or \"sge\")"
                    ))
                })?;
                let section = cfg.grid.clone().unwrap_or(GridSection {
                    backend: name,
                    partition: None,
                    poll_interval_secs: default_poll_interval_secs(),
                    tmpdir: default_grid_tmpdir(),
                    benchmark: true,
                });
                Some(GridConfig {
                    kind,
                    partition: args
                        .grid_partition
                        .clone()
                        .or_else(|| section.partition.clone()),
                    poll_interval: Duration::from_secs(section.poll_interval_secs),
                    tmpdir: PathBuf::from(&section.tmpdir),
                    benchmark: section.benchmark,
                })
            }
            None => None,
        };

        Ok(Self {
            input_dir: PathBuf::from(args.input.clone().unwrap_or_else(|| cfg.run.input.clone())),
            output_dir: PathBuf::from(
                args.output.clone().unwrap_or_else(|| cfg.run.output.clone()),
            ),
            local_jobs: args.local_jobs.unwrap_or(cfg.run.local_jobs).max(1),
            grid_jobs: args.grid_jobs.unwrap_or(cfg.run.grid_jobs).max(1),
            grid,
            targets: args.target.clone(),
            exclude_targets: args.exclude_target.clone(),
            exclude_tasks: args.exclude_task.clone(),
            until_task: args.until_task.clone(),
            dry_run: args.dry_run,
            quit_early: args.quit_early || cfg.run.quit_early,
            skip_nothing: args.skip_nothing || cfg.run.skip_nothing,
            strict: args.strict || cfg.run.strict,
            huge_file_threshold_mb: cfg.run.huge_file_threshold_mb,
            hooks: cfg.hooks.clone(),
        })
    }
}

impl Default for RunConfig {
    /// Local-only defaults, mostly useful for library callers and tests.
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            local_jobs: 1,
            grid_jobs: 1,
            grid: None,
            targets: Vec::new(),
            exclude_targets: Vec::new(),
            exclude_tasks: Vec::new(),
            until_task: None,
            dry_run: false,
            quit_early: false,
            skip_nothing: false,
            strict: false,
            huge_file_threshold_mb: None,
            hooks: HooksSection::default(),
        }
    }
}
