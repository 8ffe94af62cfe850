//! Harness configuration.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `nebula-harness.toml` in the project directory
//! 3. `nebula-harness.local.toml` (gitignored, local overrides)
//! 4. Environment variables (`NEBULA_HARNESS_<SECTION>__<KEY>`)

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{ShutdownPolicy, Topology};
use crate::readiness::ReadinessPolicy;
use crate::{Error, Params, Result};

pub const PROJECT_CONFIG_FILE: &str = "nebula-harness.toml";
pub const LOCAL_CONFIG_FILE: &str = "nebula-harness.local.toml";
pub const DEFAULT_ENV_PREFIX: &str = "NEBULA_HARNESS";

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub paths: PathsConfig,
    pub topology: TopologyConfig,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
    pub readiness: ReadinessConfig,
    pub shutdown: ShutdownConfig,
    /// Extra flags passed to every node, overriding role defaults.
    pub flags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Build output with `bin/nebula-*`.
    pub build_dir: PathBuf,
    /// Source checkout with `conf/` and `tests/cert/`.
    pub src_dir: PathBuf,
    /// Fixed working directory; a fresh one under `build_dir` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("build"),
            src_dir: PathBuf::from("."),
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub metad: usize,
    pub storaged: usize,
    pub graphd: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        let topology = Topology::default();
        Self {
            metad: topology.metad,
            storaged: topology.storaged,
            graphd: topology.graphd,
        }
    }
}

impl TopologyConfig {
    pub fn to_topology(&self) -> Topology {
        Topology {
            metad: self.metad,
            storaged: self.storaged,
            graphd: self.graphd,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_signed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Run nodes with `--v=4`.
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { verbose: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub rounds: u32,
    pub interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        let policy = ReadinessPolicy::default();
        Self {
            rounds: policy.rounds,
            interval_ms: policy.interval.as_millis() as u64,
            connect_timeout_ms: policy.connect_timeout.as_millis() as u64,
        }
    }
}

impl ReadinessConfig {
    pub fn to_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            rounds: self.rounds,
            interval: Duration::from_millis(self.interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub retries: u32,
    pub interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        let policy = ShutdownPolicy::default();
        Self {
            retries: policy.retries,
            interval_ms: policy.interval.as_millis() as u64,
        }
    }
}

impl ShutdownConfig {
    pub fn to_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            retries: self.retries,
            interval: Duration::from_millis(self.interval_ms),
        }
    }
}

impl HarnessConfig {
    /// Loads configuration for the current directory.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Loads configuration for `project_dir`.
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Rejects configurations that cannot produce a working cluster.
    pub fn validate(&self) -> Result<()> {
        if self.topology.metad == 0 {
            return Err(Error::InvalidConfig(
                "topology.metad must be at least 1".to_string(),
            ));
        }
        if self.readiness.rounds == 0 {
            return Err(Error::InvalidConfig(
                "readiness.rounds must be at least 1".to_string(),
            ));
        }
        // A zero timeout makes every connect attempt fail outright.
        if self.readiness.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "readiness.connect_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves relative paths against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.paths.build_dir.is_relative() {
            self.paths.build_dir = base.join(&self.paths.build_dir);
        }
        if self.paths.src_dir.is_relative() {
            self.paths.src_dir = base.join(&self.paths.src_dir);
        }
        if let Some(work_dir) = &self.paths.work_dir {
            if work_dir.is_relative() {
                self.paths.work_dir = Some(base.join(work_dir));
            }
        }
    }

    /// The `[flags]` table as node params.
    pub fn flag_params(&self) -> Params {
        self.flags.iter().collect()
    }
}

/// Configuration loader with builder pattern.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    /// Variables read instead of the process environment.
    env_vars: Option<config::Map<String, String>>,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            env_vars: None,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default: `NEBULA_HARNESS`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Reads environment overrides from `vars` instead of the process
    /// environment. The prefix still applies.
    pub fn with_env_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Loads and merges every source, then resolves and validates.
    pub fn load(self) -> Result<HarnessConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&HarnessConfig::default())?);

        for name in [PROJECT_CONFIG_FILE, LOCAL_CONFIG_FILE] {
            let file = self.project_dir.join(name);
            if file.exists() {
                tracing::debug!(path = %file.display(), "loading config file");
                builder = builder.add_source(
                    config::File::from(file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // Double underscore keeps `build_dir` from splitting into `build.dir`.
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(self.env_vars),
        );

        let mut harness_config: HarnessConfig = builder.build()?.try_deserialize()?;
        harness_config.resolve_paths(&self.project_dir);
        harness_config.validate()?;

        Ok(harness_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
