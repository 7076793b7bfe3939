// src/graph/mod.rs

//! Task graph: registration, derived parent/child edges, validation.
//!
//! Tasks live in a flat arena indexed by [`TaskId`]; edges are stored as
//! id-based adjacency sets rather than object references, which keeps the
//! structure serializable and free of ownership cycles. Task A is a parent
//! of task B iff some target of A is a depend of B.

pub mod task;

pub use task::{Action, ActionFn, Task, TaskId, TaskSpec};

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, warn};

use crate::errors::{Result, RundagError};
use crate::tracked::{ItemKey, TrackedItem};

/// The full set of registered tasks plus the derived dependency DAG.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    parents: Vec<BTreeSet<TaskId>>,
    children: Vec<BTreeSet<TaskId>>,
    /// Which task produces which target key.
    producer_of: HashMap<ItemKey, TaskId>,
    /// Dependency keys declared as existing before any task runs.
    preexisting: HashSet<ItemKey>,
    by_name: HashMap<String, TaskId>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn parents_of(&self, id: TaskId) -> &BTreeSet<TaskId> {
        &self.parents[id]
    }

    pub fn children_of(&self, id: TaskId) -> &BTreeSet<TaskId> {
        &self.children[id]
    }

    /// Look a task up by name, or by id given in decimal.
    pub fn find(&self, name_or_id: &str) -> Option<TaskId> {
        if let Some(&id) = self.by_name.get(name_or_id) {
            return Some(id);
        }
        name_or_id
            .parse::<TaskId>()
            .ok()
            .filter(|&id| id < self.tasks.len())
    }

    /// Register a task, assigning the next sequential id.
    ///
    /// Shell actions get `{depends[i]}` / `{targets[i]}` interpolation here,
    /// while the declared lists are fresh. Adjacency is updated incrementally
    /// against producers registered so far; `validate` re-links everything,
    /// so registration order does not constrain producer/consumer order.
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<TaskId> {
        let id = self.tasks.len();
        let name = spec.name.unwrap_or_else(|| format!("Step {id}"));

        if self.by_name.contains_key(&name) {
            return Err(RundagError::ConfigError(format!(
                "duplicate task name `{name}'"
            )));
        }

        let actions = spec
            .actions
            .into_iter()
            .map(|a| interpolate_action(a, &spec.depends, &spec.targets))
            .collect::<Result<Vec<_>>>()?;

        let task = Task {
            id,
            name: name.clone(),
            actions,
            depends: spec.depends,
            targets: spec.targets,
            gridable: spec.gridable,
            resources: spec.resources,
        };

        self.parents.push(BTreeSet::new());
        self.children.push(BTreeSet::new());

        for targ in &task.targets {
            let key = targ.key();
            if let Some(&other) = self.producer_of.get(&key) {
                warn!(
                    target = %key,
                    first = other,
                    second = id,
                    "target is produced by more than one task; keeping the later producer"
                );
            }
            self.producer_of.insert(key, id);
        }

        for dep in &task.depends {
            if let Some(&parent) = self.producer_of.get(&dep.key()) {
                if parent != id {
                    self.parents[id].insert(parent);
                    self.children[parent].insert(id);
                }
            }
        }

        self.by_name.insert(name, id);
        self.tasks.push(task);
        debug!(task = id, "registered task");
        Ok(id)
    }

    /// Declare dependencies as pre-existing: nothing in the graph creates
    /// them, they are simply there before any task runs.
    pub fn already_exists<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = TrackedItem>,
    {
        for item in items {
            self.preexisting.insert(item.key());
        }
    }

    /// Validate the graph, after which it is ready to plan against:
    ///
    /// 1. glob patterns are expanded to their concrete match lists,
    /// 2. parent/child edges are (re-)derived from target→depend links,
    /// 3. every must-preexist dependency is either produced by a task,
    ///    declared via [`already_exists`](Self::already_exists), or (outside
    ///    strict mode) found on disk,
    /// 4. the derived graph must be acyclic,
    /// 5. gridable tasks may not carry in-process function actions.
    ///
    /// All failures here abort the run before anything executes.
    pub fn validate(&mut self, strict: bool) -> Result<()> {
        for task in &mut self.tasks {
            for item in task.depends.iter_mut().chain(task.targets.iter_mut()) {
                item.resolve();
            }
        }

        self.relink_edges();
        self.check_preexisting(strict)?;
        self.check_acyclic()?;
        self.check_grid_actions()?;
        Ok(())
    }

    fn relink_edges(&mut self) {
        for set in self.parents.iter_mut().chain(self.children.iter_mut()) {
            set.clear();
        }
        for id in 0..self.tasks.len() {
            let dep_keys: Vec<ItemKey> =
                self.tasks[id].depends.iter().map(|d| d.key()).collect();
            for key in dep_keys {
                if let Some(&parent) = self.producer_of.get(&key) {
                    if parent != id {
                        self.parents[id].insert(parent);
                        self.children[parent].insert(id);
                    }
                }
            }
        }
    }

    fn check_preexisting(&mut self, strict: bool) -> Result<()> {
        for task in &self.tasks {
            for dep in &task.depends {
                if !dep.must_preexist() {
                    continue;
                }
                let key = dep.key();
                if self.producer_of.contains_key(&key) || self.preexisting.contains(&key) {
                    continue;
                }
                if !strict && dep.exists() {
                    // Implicitly track it, the way non-strict mode always has.
                    self.preexisting.insert(key);
                    continue;
                }
                return Err(RundagError::UnresolvedDependency {
                    key: key.0,
                    task: task.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut dag: DiGraphMap<TaskId, ()> = DiGraphMap::new();
        for id in 0..self.tasks.len() {
            dag.add_node(id);
        }
        for (child, parents) in self.parents.iter().enumerate() {
            for &parent in parents {
                dag.add_edge(parent, child, ());
            }
        }

        match toposort(&dag, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => {
                let id = cycle.node_id();
                Err(RundagError::CycleDetected(format!(
                    "task `{}' is reachable from itself via target→depend edges",
                    self.tasks[id].name
                )))
            }
        }
    }

    fn check_grid_actions(&self) -> Result<()> {
        for task in &self.tasks {
            if task.gridable
                && task
                    .actions
                    .iter()
                    .any(|a| matches!(a, Action::Func { .. }))
            {
                return Err(RundagError::ConfigError(format!(
                    "gridable task `{}' has an in-process function action; \
                     only shell actions can be submitted to a grid",
                    task.name
                )));
            }
        }
        Ok(())
    }

    /// All ancestors of `id` (transitively), including `id` itself.
    pub fn ancestors_of(&self, id: TaskId) -> HashSet<TaskId> {
        self.closure_of(id, |t| &self.parents[t])
    }

    /// All descendants of `id` (transitively), including `id` itself.
    pub fn descendants_of(&self, id: TaskId) -> HashSet<TaskId> {
        self.closure_of(id, |t| &self.children[t])
    }

    fn closure_of<'a, F>(&'a self, id: TaskId, step: F) -> HashSet<TaskId>
    where
        F: Fn(TaskId) -> &'a BTreeSet<TaskId>,
    {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            stack.extend(step(current).iter().copied());
        }
        seen
    }

    /// Iterator over `(target key, producing task)` pairs, for target
    /// filter matching.
    pub fn all_targets(&self) -> impl Iterator<Item = (ItemKey, TaskId)> + '_ {
        self.tasks
            .iter()
            .flat_map(|t| t.targets.iter().map(move |targ| (targ.key(), t.id)))
    }
}

/// Substitute `{depends[i]}` and `{targets[i]}` placeholders in shell
/// actions. An index past the end of the declared list is an error.
fn interpolate_action(
    action: Action,
    depends: &[TrackedItem],
    targets: &[TrackedItem],
) -> Result<Action> {
    let mut cmd = match action {
        Action::Shell(cmd) => cmd,
        func => return Ok(func),
    };

    for (i, dep) in depends.iter().enumerate() {
        cmd = cmd.replace(&format!("{{depends[{i}]}}"), &item_text(dep));
    }
    for (i, targ) in targets.iter().enumerate() {
        cmd = cmd.replace(&format!("{{targets[{i}]}}"), &item_text(targ));
    }

    for marker in ["{depends[", "{targets["] {
        if cmd.contains(marker) {
            return Err(RundagError::ConfigError(format!(
                "unresolved `{marker}...]' placeholder in command `{cmd}'"
            )));
        }
    }
    Ok(Action::Shell(cmd))
}

/// How an item reads when spliced into a shell command.
fn item_text(item: &TrackedItem) -> String {
    match item {
        TrackedItem::File(p) | TrackedItem::HugeFile(p) | TrackedItem::Directory(p) => {
            p.to_string_lossy().into_owned()
        }
        TrackedItem::Executable { path, .. } => path.to_string_lossy().into_owned(),
        TrackedItem::Variable { value, .. } => value.clone(),
        TrackedItem::Function { name, .. } => name.clone(),
        TrackedItem::Pattern { pattern, .. } => pattern.clone(),
    }
}
