// src/graph/task.rs

//! Task and action types.

use std::fmt;
use std::sync::Arc;

use crate::grid::resources::ResourceRequest;
use crate::tracked::TrackedItem;

/// Index of a task in the graph arena; assigned in registration order.
pub type TaskId = usize;

/// Signature of in-process function actions.
pub type ActionFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;

/// One executable step of a task. A task's actions run sequentially and
/// must all succeed for the task to succeed.
#[derive(Clone)]
pub enum Action {
    /// A shell command, run via `sh -c`.
    Shell(String),
    /// An in-process function.
    Func { name: String, f: Arc<ActionFn> },
}

impl Action {
    pub fn shell(cmd: impl Into<String>) -> Self {
        Action::Shell(cmd.into())
    }

    pub fn func(
        name: impl Into<String>,
        f: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Action::Func {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    /// Human-readable form, used in status events and failure reasons.
    pub fn describe(&self) -> String {
        match self {
            Action::Shell(cmd) => cmd.clone(),
            Action::Func { name, .. } => format!("<fn {name}>"),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Shell(cmd) => write!(f, "Shell({cmd:?})"),
            Action::Func { name, .. } => write!(f, "Func({name})"),
        }
    }
}

/// A registered unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub actions: Vec<Action>,
    pub depends: Vec<TrackedItem>,
    pub targets: Vec<TrackedItem>,
    pub gridable: bool,
    pub resources: Option<ResourceRequest>,
}

/// Everything `add_task` needs; built fluently.
///
/// ```
/// use rundag::graph::TaskSpec;
///
/// let spec = TaskSpec::shell("gzip -c {depends[0]} > {targets[0]}")
///     .named("compress")
///     .depends_on(["data.txt"])
///     .produces(["data.txt.gz"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub actions: Vec<Action>,
    pub depends: Vec<TrackedItem>,
    pub targets: Vec<TrackedItem>,
    pub gridable: bool,
    pub resources: Option<ResourceRequest>,
}

impl TaskSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a spec with a single shell action.
    pub fn shell(cmd: impl Into<String>) -> Self {
        Self::new().then_shell(cmd)
    }

    /// Start a spec with a single function action.
    pub fn func(
        name: impl Into<String>,
        f: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        let mut spec = Self::new();
        spec.actions.push(Action::func(name, f));
        spec
    }

    /// Append another shell action.
    pub fn then_shell(mut self, cmd: impl Into<String>) -> Self {
        self.actions.push(Action::shell(cmd));
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declare dependencies; bare strings are normalized via
    /// [`TrackedItem::auto`].
    pub fn depends_on<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.depends
            .extend(items.into_iter().map(|s| TrackedItem::auto(s.as_ref())));
        self
    }

    pub fn depends_on_items<I>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = TrackedItem>,
    {
        self.depends.extend(items);
        self
    }

    /// Declare targets; bare strings are normalized via [`TrackedItem::auto`].
    pub fn produces<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.targets
            .extend(items.into_iter().map(|s| TrackedItem::auto(s.as_ref())));
        self
    }

    pub fn produces_items<I>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = TrackedItem>,
    {
        self.targets.extend(items);
        self
    }

    /// Mark the task for grid submission with the given resource request.
    pub fn gridable(mut self, resources: ResourceRequest) -> Self {
        self.gridable = true;
        self.resources = Some(resources);
        self
    }
}
