// src/config/mod.rs

//! Workflow configuration.
//!
//! - [`model`] maps the `Rundag.toml` sections onto serde structs and holds
//!   the resolved [`RunConfig`] the engine consumes.
//! - [`loader`] reads and validates a config file from disk.
//! - [`validate`] performs semantic checks on the raw file.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ConfigFile, GridConfig, GridKind, HooksSection, RawConfigFile, ResourceField, RunConfig,
    RunSection, TaskSection,
};
