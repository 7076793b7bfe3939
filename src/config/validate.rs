// src/config/validate.rs

use crate::config::model::{ConfigFile, GridKind, RawConfigFile, ResourceField};
use crate::errors::{Result, RundagError};
use crate::grid::resources::check_equation;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = RundagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.run, raw.grid, raw.hooks, raw.task))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_grid_section(cfg)?;
    validate_tasks(cfg)?;
    Ok(())
}

fn validate_grid_section(cfg: &RawConfigFile) -> Result<()> {
    if let Some(grid) = &cfg.grid {
        if GridKind::parse(&grid.backend).is_none() {
            return Err(RundagError::ConfigError(format!(
                "unknown grid backend `{}' in [grid] (expected \"slurm\" or \"sge\")",
                grid.backend
            )));
        }
        if grid.poll_interval_secs == 0 {
            return Err(RundagError::ConfigError(
                "[grid].poll_interval_secs must be >= 1 (got 0)".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_tasks(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        if task.actions.is_empty() {
            return Err(RundagError::ConfigError(format!(
                "task '{name}' has no actions"
            )));
        }

        if task.gridable {
            for (field, value) in [("mem", &task.mem), ("time", &task.time)] {
                match value {
                    None => {
                        return Err(RundagError::ConfigError(format!(
                            "gridable task '{name}' is missing required field `{field}'"
                        )));
                    }
                    Some(ResourceField::Equation(eq)) => {
                        check_equation(eq).map_err(|e| {
                            RundagError::ConfigError(format!(
                                "task '{name}': bad `{field}' equation: {e}"
                            ))
                        })?;
                    }
                    Some(ResourceField::Amount(_)) => {}
                }
            }
            if task.cores.is_none() {
                return Err(RundagError::ConfigError(format!(
                    "gridable task '{name}' is missing required field `cores'"
                )));
            }
        }
    }
    Ok(())
}
