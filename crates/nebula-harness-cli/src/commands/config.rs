//! Config command - shows the merged configuration.

use std::path::Path;

use anyhow::{Context, Result};

pub fn run(project: Option<&Path>) -> Result<()> {
    let config = super::load_config(project)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
