// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of spawning processes
//! itself. Production uses [`LocalExecutor`](super::LocalExecutor) for local
//! tasks and [`GridExecutor`](crate::grid::GridExecutor) for gridable ones;
//! tests provide their own implementation that records dispatches and emits
//! `TaskFinished` events directly.

use std::future::Future;
use std::pin::Pin;

use crate::errors::Result;
use crate::graph::Task;

/// Trait abstracting how dispatched tasks are executed.
///
/// `dispatch` must return quickly: implementations spawn the real work in
/// the background and later deliver a
/// [`RunnerEvent::TaskFinished`](crate::engine::RunnerEvent) on the runtime
/// event channel. Concurrency limits are enforced by the core scheduler, not
/// here.
pub trait ExecutorBackend: Send {
    fn dispatch(&mut self, task: Task) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
