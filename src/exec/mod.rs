// src/exec/mod.rs

//! Task execution layer.
//!
//! This module is responsible for actually running a task's actions, using
//! `tokio::process::Command` for shell actions and `spawn_blocking` for
//! in-process function actions, and reporting back to the orchestration
//! runtime via `RunnerEvent`s.
//!
//! - [`backend`] provides the `ExecutorBackend` trait the runtime talks to,
//!   so tests can substitute a fake that never spawns processes.
//! - [`local`] is the production local executor.

pub mod backend;
pub mod local;

pub use backend::ExecutorBackend;
pub use local::LocalExecutor;
