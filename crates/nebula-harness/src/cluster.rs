//! Cluster lifecycle: install, start, stop.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::layout::{self, InstallSources};
use crate::liveness::{NodeSignal, ProcessLiveness, SignalLiveness, signal_if_alive};
use crate::params::{ParamOptions, Params, role_params};
use crate::ports::{PORTS_PER_PROCESS, PortAllocator, PortQuartet};
use crate::readiness::{self, ReadinessPolicy};
use crate::{Error, HarnessConfig, NebulaProcess, Result, Role};

/// Polls after a SIGKILL before giving up on a process disappearing.
const KILL_SETTLE_ROUNDS: u32 = 10;
const KILL_SETTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle state of a [`NebulaCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Working directory not staged yet.
    Uninstalled,

    /// Layout staged; nothing running.
    Installed,

    /// All nodes reachable.
    Started,

    /// Nodes terminated.
    Stopped,
}

/// Retry budget for graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Liveness polls after SIGTERM before escalating to SIGKILL.
    pub retries: u32,

    /// Sleep between polls.
    pub interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            retries: 20,
            interval: Duration::from_secs(1),
        }
    }
}

/// Instances per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub metad: usize,
    pub storaged: usize,
    pub graphd: usize,
}

impl Topology {
    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Metad => self.metad,
            Role::Storaged => self.storaged,
            Role::Graphd => self.graphd,
        }
    }

    /// Total node count.
    pub fn total(&self) -> usize {
        self.metad + self.storaged + self.graphd
    }

    /// Largest instance count of any role; sizes the `logs{i}`/`pids{i}` set.
    pub fn max_instances(&self) -> usize {
        self.metad.max(self.storaged).max(self.graphd)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            metad: 1,
            storaged: 1,
            graphd: 1,
        }
    }
}

/// Builder for [`NebulaCluster`].
pub struct NebulaClusterBuilder {
    sources: InstallSources,
    topology: Topology,
    options: ParamOptions,
    flags: Params,
    work_dir: Option<PathBuf>,
    readiness: ReadinessPolicy,
    shutdown: ShutdownPolicy,
    liveness: Box<dyn ProcessLiveness>,
}

impl NebulaClusterBuilder {
    pub fn new(build_dir: impl Into<PathBuf>, src_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources: InstallSources::new(build_dir, src_dir),
            topology: Topology::default(),
            options: ParamOptions::default(),
            flags: Params::new(),
            work_dir: None,
            readiness: ReadinessPolicy::default(),
            shutdown: ShutdownPolicy::default(),
            liveness: Box::new(SignalLiveness),
        }
    }

    pub fn metad(mut self, count: usize) -> Self {
        self.topology.metad = count;
        self
    }

    pub fn storaged(mut self, count: usize) -> Self {
        self.topology.storaged = count;
        self
    }

    pub fn graphd(mut self, count: usize) -> Self {
        self.topology.graphd = count;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn ca_signed(mut self, ca_signed: bool) -> Self {
        self.options.ca_signed = ca_signed;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.options.verbose = verbose;
        self
    }

    /// Adds a flag passed to every node, overriding role defaults.
    pub fn flag(mut self, key: impl Into<String>, value: impl std::fmt::Display) -> Self {
        self.flags.set(key, value);
        self
    }

    pub fn flags(mut self, flags: &Params) -> Self {
        self.flags.overlay(flags);
        self
    }

    /// Uses `work_dir` instead of a fresh timestamped directory.
    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = policy;
        self
    }

    pub fn shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    pub fn liveness(mut self, liveness: impl ProcessLiveness + 'static) -> Self {
        self.liveness = Box::new(liveness);
        self
    }

    pub fn build(self) -> Result<NebulaCluster> {
        if self.topology.metad == 0 {
            return Err(Error::InvalidConfig(
                "a cluster needs at least one metad".to_string(),
            ));
        }

        let work_dir = self
            .work_dir
            .unwrap_or_else(|| unique_work_dir(&self.sources.build_dir));

        let role_params = Role::ALL
            .into_iter()
            .map(|role| (role, role_params(role, self.options, &self.flags)))
            .collect();

        Ok(NebulaCluster {
            topology: self.topology,
            sources: self.sources,
            work_dir,
            role_params,
            processes: Vec::new(),
            pids: BTreeMap::new(),
            state: ClusterState::Uninstalled,
            readiness: self.readiness,
            shutdown: self.shutdown,
            liveness: self.liveness,
        })
    }
}

/// `build_dir/server_<local time>_<random suffix>`.
fn unique_work_dir(build_dir: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    build_dir.join(format!("server_{timestamp}_{suffix:06x}"))
}

/// A local Nebula cluster for integration tests.
///
/// Owns its working directory and PID table. Not shared between test runs.
pub struct NebulaCluster {
    topology: Topology,
    sources: InstallSources,
    work_dir: PathBuf,
    role_params: BTreeMap<Role, Params>,
    processes: Vec<NebulaProcess>,
    /// PID file path to PID; the source of truth for shutdown.
    pids: BTreeMap<PathBuf, u32>,
    state: ClusterState,
    readiness: ReadinessPolicy,
    shutdown: ShutdownPolicy,
    liveness: Box<dyn ProcessLiveness>,
}

impl NebulaCluster {
    pub fn builder(build_dir: impl Into<PathBuf>, src_dir: impl Into<PathBuf>) -> NebulaClusterBuilder {
        NebulaClusterBuilder::new(build_dir, src_dir)
    }

    /// Builds a cluster from loaded configuration.
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = Self::builder(&config.paths.build_dir, &config.paths.src_dir)
            .topology(config.topology.to_topology())
            .ca_signed(config.tls.ca_signed)
            .verbose(config.logging.verbose)
            .flags(&config.flag_params())
            .readiness(config.readiness.to_policy())
            .shutdown(config.shutdown.to_policy());
        if let Some(work_dir) = &config.paths.work_dir {
            builder = builder.work_dir(work_dir);
        }
        builder.build()
    }

    /// Stages the working directory.
    ///
    /// Any previous contents are removed first. Missing binaries, configs or
    /// credentials are fatal.
    pub fn install(&mut self) -> Result<()> {
        if self.state == ClusterState::Started {
            return Err(Error::InvalidState {
                operation: "install",
                state: self.state,
            });
        }

        tracing::info!(work_dir = %self.work_dir.display(), "installing nebula cluster");
        layout::install(&self.sources, &self.work_dir)?;

        self.processes.clear();
        self.pids.clear();
        self.state = ClusterState::Installed;
        Ok(())
    }

    /// Allocates ports, launches every node and waits for them to listen.
    ///
    /// Returns the primary ports of the query nodes. On failure, everything
    /// launched so far is killed before the error is returned and the
    /// cluster goes back to [`ClusterState::Installed`].
    pub fn start(&mut self) -> Result<Vec<u16>> {
        if self.state != ClusterState::Installed {
            return Err(Error::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.forget_exited();

        let port_count = self.topology.total() * PORTS_PER_PROCESS;
        let ports = PortAllocator::new().find_free_ports(port_count)?;
        self.processes = self.build_processes(&ports)?;

        let meta_server_addrs = self.metad_addrs();
        for process in &mut self.processes {
            process.set_meta_server_addrs(&meta_server_addrs);
        }

        layout::create_instance_dirs(&self.work_dir, self.topology.max_instances())?;

        let started = Instant::now();
        for i in 0..self.processes.len() {
            if let Err(e) = self.processes[i].start(&self.work_dir) {
                self.rollback();
                return Err(e);
            }
        }

        let primaries: Vec<u16> = self.processes.iter().map(|p| p.ports().primary).collect();
        if !readiness::wait_for_ports(&primaries, &self.readiness) {
            self.rollback();
            let elapsed = started.elapsed();
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "nebula servers not ready");
            return Err(Error::NotReady { elapsed });
        }

        self.collect_pids();
        self.state = ClusterState::Started;

        let graphd_ports = self.graphd_ports();
        tracing::info!(
            nodes = self.processes.len(),
            pids = self.pids.len(),
            ?graphd_ports,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "nebula cluster started"
        );
        Ok(graphd_ports)
    }

    fn build_processes(&self, ports: &[u16]) -> Result<Vec<NebulaProcess>> {
        let mut quartets = ports
            .chunks_exact(PORTS_PER_PROCESS)
            .filter_map(PortQuartet::from_slice);
        let mut processes = Vec::with_capacity(self.topology.total());

        for role in Role::ALL {
            let params = &self.role_params[&role];
            for index in 0..self.topology.count(role) {
                let quartet = quartets.next().ok_or(Error::PortsExhausted {
                    requested: ports.len(),
                    allocated: processes.len() * PORTS_PER_PROCESS,
                })?;
                processes.push(NebulaProcess::new(role, quartet, index, params.clone()));
            }
        }

        Ok(processes)
    }

    /// Kills whatever a failed start left behind.
    fn rollback(&mut self) {
        self.collect_pids();
        tracing::warn!(pids = self.pids.len(), "rolling back failed start");
        self.kill_all(NodeSignal::Kill);
        self.wait_for_exit(KILL_SETTLE_ROUNDS, KILL_SETTLE_INTERVAL);
        self.forget_exited();
        self.state = ClusterState::Installed;
    }

    /// Drops exited PIDs and deletes their PID files.
    ///
    /// Nothing may signal a PID once its process is gone; the number can be
    /// recycled for an unrelated process.
    fn forget_exited(&mut self) {
        let liveness = self.liveness.as_ref();
        self.pids.retain(|path, &mut pid| {
            if liveness.is_alive(pid) {
                tracing::warn!(pid, path = %path.display(), "process survived SIGKILL");
                return true;
            }
            if let Err(e) = fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "pid file not removed");
            }
            false
        });
    }

    /// Terminates every node, escalating to SIGKILL, and optionally removes
    /// the working directory.
    ///
    /// Never fails; stragglers are force-killed and cleanup errors ignored.
    pub fn stop(&mut self, cleanup: bool) {
        tracing::info!(work_dir = %self.work_dir.display(), "stopping nebula services");
        self.collect_pids();
        terminate(&self.pids, self.liveness.as_ref(), &self.shutdown);

        if cleanup {
            remove_work_dir(&self.work_dir);
        }
        self.state = ClusterState::Stopped;
    }

    /// Re-reads every PID file under the working directory.
    fn collect_pids(&mut self) {
        self.pids.extend(layout::collect_pids(&self.work_dir));
    }

    fn kill_all(&self, signal: NodeSignal) {
        kill_all(&self.pids, self.liveness.as_ref(), signal);
    }

    fn wait_for_exit(&self, rounds: u32, interval: Duration) -> bool {
        wait_for_exit(&self.pids, self.liveness.as_ref(), rounds, interval)
    }

    /// Whether any recorded node process is still running.
    pub fn any_alive(&self) -> bool {
        any_alive(&self.pids, self.liveness.as_ref())
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn sources(&self) -> &InstallSources {
        &self.sources
    }

    /// Merged flags handed to every node of `role`.
    pub fn params(&self, role: Role) -> &Params {
        &self.role_params[&role]
    }

    /// Every node, metad first, then storaged, then graphd.
    pub fn processes(&self) -> &[NebulaProcess] {
        &self.processes
    }

    pub fn processes_of(&self, role: Role) -> impl Iterator<Item = &NebulaProcess> {
        self.processes.iter().filter(move |p| p.role() == role)
    }

    /// Primary ports of the query nodes, in instance order.
    pub fn graphd_ports(&self) -> Vec<u16> {
        self.processes_of(Role::Graphd)
            .map(|p| p.ports().primary)
            .collect()
    }

    /// Comma-separated `host:port` of every metad.
    pub fn metad_addrs(&self) -> String {
        self.processes_of(Role::Metad)
            .map(NebulaProcess::address)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// PID file path to PID, as last collected.
    pub fn pids(&self) -> &BTreeMap<PathBuf, u32> {
        &self.pids
    }
}

impl Drop for NebulaCluster {
    fn drop(&mut self) {
        if self.state != ClusterState::Started {
            return;
        }
        tracing::warn!(
            work_dir = %self.work_dir.display(),
            "cluster dropped while running, killing nodes"
        );
        self.collect_pids();
        self.kill_all(NodeSignal::Kill);
    }
}

/// Stops the nodes of a run whose working directory outlived its
/// [`NebulaCluster`], e.g. after a crashed test process.
///
/// Returns the number of PID files found.
pub fn reclaim(
    work_dir: &Path,
    cleanup: bool,
    policy: &ShutdownPolicy,
    liveness: &dyn ProcessLiveness,
) -> usize {
    let pids = layout::collect_pids(work_dir);
    tracing::info!(work_dir = %work_dir.display(), pids = pids.len(), "reclaiming nebula run");
    terminate(&pids, liveness, policy);
    if cleanup {
        remove_work_dir(work_dir);
    }
    pids.len()
}

/// SIGTERM, wait up to the retry budget, then SIGKILL whatever is left.
fn terminate(pids: &BTreeMap<PathBuf, u32>, liveness: &dyn ProcessLiveness, policy: &ShutdownPolicy) {
    kill_all(pids, liveness, NodeSignal::Terminate);

    if !wait_for_exit(pids, liveness, policy.retries, policy.interval) {
        tracing::warn!("nodes ignored SIGTERM, escalating to SIGKILL");
    }

    kill_all(pids, liveness, NodeSignal::Kill);
    wait_for_exit(pids, liveness, KILL_SETTLE_ROUNDS, KILL_SETTLE_INTERVAL);
}

fn kill_all(pids: &BTreeMap<PathBuf, u32>, liveness: &dyn ProcessLiveness, signal: NodeSignal) {
    for (path, &pid) in pids {
        signal_if_alive(liveness, pid, signal, &path.display().to_string());
    }
}

fn any_alive(pids: &BTreeMap<PathBuf, u32>, liveness: &dyn ProcessLiveness) -> bool {
    pids.values().any(|&pid| liveness.is_alive(pid))
}

/// Polls until no PID is alive. Returns whether that happened within
/// `rounds` polls.
fn wait_for_exit(
    pids: &BTreeMap<PathBuf, u32>,
    liveness: &dyn ProcessLiveness,
    rounds: u32,
    interval: Duration,
) -> bool {
    for _ in 0..rounds {
        if !any_alive(pids, liveness) {
            return true;
        }
        sleep(interval);
    }
    !any_alive(pids, liveness)
}

fn remove_work_dir(work_dir: &Path) {
    if let Err(e) = fs::remove_dir_all(work_dir) {
        tracing::debug!(work_dir = %work_dir.display(), error = %e, "working directory not removed");
    }
}
