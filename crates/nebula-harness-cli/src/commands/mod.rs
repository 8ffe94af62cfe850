//! CLI command implementations.

pub mod config;
pub mod down;
pub mod ports;
pub mod up;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nebula_harness::HarnessConfig;

/// Loads configuration for `project`, or the current directory.
pub(crate) fn load_config(project: Option<&Path>) -> Result<HarnessConfig> {
    let project = match project {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    HarnessConfig::load_from_dir(&project)
        .with_context(|| format!("Failed to load configuration from {}", project.display()))
}
