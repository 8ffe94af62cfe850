//! Down command - stops the nodes of a leaked run.

use std::path::Path;

use anyhow::{Result, bail};
use nebula_harness::{ShutdownPolicy, SignalLiveness, reclaim};

pub fn run(work_dir: &Path, keep: bool) -> Result<()> {
    if !work_dir.is_dir() {
        bail!("Working directory '{}' does not exist", work_dir.display());
    }

    let found = reclaim(work_dir, !keep, &ShutdownPolicy::default(), &SignalLiveness);
    println!("Reclaimed {found} node(s) under {}", work_dir.display());
    Ok(())
}
