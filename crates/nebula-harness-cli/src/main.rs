//! Nebula test cluster CLI.
//!
//! # Quick Start
//!
//! ```bash
//! # Bring up 1 metad, 3 storaged, 1 graphd from a nebula checkout
//! nebula-harness up --project ~/src/nebula --storaged 3
//!
//! # Stop a run whose owner crashed
//! nebula-harness down ~/src/nebula/build/server_2026-10-19T10-00-00_1a2b3c
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};

/// Nebula Graph test clusters - install, start and stop local nodes.
#[derive(Parser)]
#[command(name = "nebula-harness")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and start a cluster, then run until interrupted.
    Up {
        /// Project directory holding nebula-harness.toml (default: current directory).
        #[arg(short, long)]
        project: Option<PathBuf>,

        /// Number of metad instances.
        #[arg(long)]
        metad: Option<usize>,

        /// Number of storaged instances.
        #[arg(long)]
        storaged: Option<usize>,

        /// Number of graphd instances.
        #[arg(long)]
        graphd: Option<usize>,

        /// Use the CA-signed certificate pair.
        #[arg(long)]
        ca_signed: bool,

        /// Keep the working directory after shutdown.
        #[arg(long)]
        keep: bool,

        /// Extra node flag, repeatable (e.g. --flag enable_ssl=true).
        #[arg(long = "flag", value_name = "KEY=VALUE", value_parser = parse_flag)]
        flags: Vec<(String, String)>,
    },

    /// Stop the nodes of a leaked working directory.
    Down {
        /// Working directory of the run.
        work_dir: PathBuf,

        /// Keep the working directory after shutdown.
        #[arg(long)]
        keep: bool,
    },

    /// Print free ports, one per line.
    Ports {
        /// How many ports (multiple of 4).
        #[arg(short, long, default_value = "4")]
        count: usize,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Project directory holding nebula-harness.toml (default: current directory).
        #[arg(short, long)]
        project: Option<PathBuf>,
    },
}

fn parse_flag(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim().trim_start_matches("--");
    if key.is_empty() {
        return Err(anyhow!("empty flag name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the machine-readable output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Up {
            project,
            metad,
            storaged,
            graphd,
            ca_signed,
            keep,
            flags,
        } => commands::up::run(commands::up::UpOptions {
            project,
            metad,
            storaged,
            graphd,
            ca_signed,
            keep,
            flags,
        }),
        Commands::Down { work_dir, keep } => commands::down::run(&work_dir, keep),
        Commands::Ports { count } => commands::ports::run(count),
        Commands::Config { project } => commands::config::run(project.as_deref()),
    }
}
