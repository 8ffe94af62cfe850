//! Error types for cluster provisioning.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::Role;
use crate::cluster::ClusterState;

/// Cluster provisioning errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Port count is not a whole number of quartets.
    #[error("Invalid port count: {0} (must be a multiple of 4)")]
    InvalidPortCount(usize),

    /// Port allocation retries exhausted.
    #[error("Could not find free ports: requested {requested}, allocated {allocated}")]
    PortsExhausted { requested: usize, allocated: usize },

    /// A file the working layout is built from does not exist.
    #[error("Missing install source: {0}")]
    MissingSource(PathBuf),

    /// IO error on a specific path.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The launcher for a node could not be created.
    #[error("Failed to spawn nebula-{role} #{index}: {source}")]
    Spawn {
        role: Role,
        index: usize,
        source: std::io::Error,
    },

    /// Some primary port never accepted connections.
    #[error("nebula servers not ready in {:.3}s", elapsed.as_secs_f64())]
    NotReady { elapsed: Duration },

    /// Operation called in the wrong lifecycle state.
    #[error("Cannot {operation} cluster in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ClusterState,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
