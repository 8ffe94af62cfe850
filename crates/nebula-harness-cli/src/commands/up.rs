//! Up command - runs a cluster until SIGINT or SIGTERM.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use nebula_harness::NebulaCluster;
use nebula_harness::process::HOST;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Overrides taken from the command line.
pub struct UpOptions {
    pub project: Option<PathBuf>,
    pub metad: Option<usize>,
    pub storaged: Option<usize>,
    pub graphd: Option<usize>,
    pub ca_signed: bool,
    pub keep: bool,
    pub flags: Vec<(String, String)>,
}

pub fn run(options: UpOptions) -> Result<()> {
    let mut config = super::load_config(options.project.as_deref())?;

    if let Some(n) = options.metad {
        config.topology.metad = n;
    }
    if let Some(n) = options.storaged {
        config.topology.storaged = n;
    }
    if let Some(n) = options.graphd {
        config.topology.graphd = n;
    }
    if options.ca_signed {
        config.tls.ca_signed = true;
    }
    config.flags.extend(options.flags);

    let mut cluster = NebulaCluster::from_config(&config).context("Invalid cluster configuration")?;

    // Registered before start so an early Ctrl+C still goes through stop().
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&interrupted))
            .context("Failed to install signal handler")?;
    }

    cluster.install().context("Failed to install nebula cluster")?;
    let graphd_ports = cluster.start().context("Failed to start nebula cluster")?;

    let mut stdout = std::io::stdout().lock();
    for port in &graphd_ports {
        writeln!(stdout, "GRAPHD_ADDR={HOST}:{port}")?;
    }
    writeln!(stdout, "WORK_DIR={}", cluster.work_dir().display())?;
    stdout.flush()?;
    drop(stdout);

    info!("cluster is up, press Ctrl+C to stop");
    while !interrupted.load(Ordering::Relaxed) {
        sleep(POLL_INTERVAL);
    }

    cluster.stop(!options.keep);
    info!("cluster stopped");
    Ok(())
}
