// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RundagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cycle detected in task graph: {0}")]
    CycleDetected(String),

    #[error("Unresolved dependency `{key}' required by task `{task}'")]
    UnresolvedDependency { key: String, task: String },

    #[error("Unable to find binary or script `{0}' on $PATH")]
    UnresolvedExecutable(String),

    #[error("History store at {0} is locked by another run (store busy)")]
    StoreBusy(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RundagError>;
