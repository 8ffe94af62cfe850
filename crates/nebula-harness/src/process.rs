//! A single node instance.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use nix::errno::Errno;

use crate::liveness::{NodeSignal, ProcessLiveness, signal_if_alive};
use crate::{Error, Params, PortQuartet, Result, Role};

/// Address every node binds to.
pub const HOST: &str = "127.0.0.1";

/// Flag carrying the metadata quorum addresses.
pub const META_SERVER_ADDRS: &str = "meta_server_addrs";

/// A node invocation: program plus argument vector.
///
/// Paths are relative to the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl NodeCommand {
    /// Space-joined form, for logs.
    pub fn to_command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// One node of the cluster.
#[derive(Debug, Clone)]
pub struct NebulaProcess {
    role: Role,
    ports: PortQuartet,
    index: usize,
    params: Params,
    pid: Option<u32>,
}

impl NebulaProcess {
    /// Creates a node that has not been started.
    pub fn new(role: Role, ports: PortQuartet, index: usize, params: Params) -> Self {
        Self {
            role,
            ports,
            index,
            params,
            pid: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn ports(&self) -> PortQuartet {
        self.ports
    }

    /// Instance index within the role.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// PID of the launcher, once started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn host(&self) -> &'static str {
        HOST
    }

    /// `host:primary`.
    pub fn address(&self) -> String {
        format!("{HOST}:{}", self.ports.primary)
    }

    /// Points this node at the metadata quorum.
    pub fn set_meta_server_addrs(&mut self, addrs: &str) {
        self.params.set(META_SERVER_ADDRS, addrs);
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(format!("logs{}", self.index))
    }

    pub fn pid_file(&self) -> PathBuf {
        PathBuf::from(format!("pids{}", self.index)).join(format!("{}.pid", self.role.binary_name()))
    }

    pub fn data_path(&self) -> Option<PathBuf> {
        self.role
            .has_data_path()
            .then(|| PathBuf::from(format!("data{}", self.index)).join(self.role.name()))
    }

    /// Flags derived from the instance itself, before node params apply.
    fn derived_params(&self) -> Params {
        let mut params = Params::new();
        params
            .set("log_dir", self.log_dir().display())
            .set("pid_file", self.pid_file().display())
            .set("port", self.ports.primary)
            .set("ws_http_port", self.ports.http)
            .set("ws_h2_port", self.ports.https);
        if let Some(data_path) = self.data_path() {
            params.set("data_path", data_path.display());
        }
        params
    }

    /// Builds the invocation for this node.
    ///
    /// Node params override derived flags. Query nodes never get a data path.
    pub fn format_command(&self) -> NodeCommand {
        let mut flags = self.derived_params();
        flags.overlay(&self.params);
        if !self.role.has_data_path() {
            flags.remove("data_path");
        }

        let mut args = vec![
            "--flagfile".to_string(),
            Path::new("conf").join(self.role.conf_name()).display().to_string(),
        ];
        args.extend(flags.iter().map(|(key, value)| format!("--{key}={value}")));

        NodeCommand {
            program: Path::new("bin").join(self.role.binary_name()),
            args,
        }
    }

    /// Runs the launcher from `work_dir` and waits for it to return.
    ///
    /// The node binaries daemonize, so a clean exit only means the launch
    /// went through; readiness is checked separately. A non-zero exit is
    /// logged with the captured output and is not an error. The recorded PID
    /// belongs to the launcher; the PID file is authoritative.
    pub fn start(&mut self, work_dir: &Path) -> Result<u32> {
        let command = self.format_command();
        tracing::info!(node = %self.label(), command = %command.to_command_line(), "exec");

        let log_dir = work_dir.join(self.log_dir());
        fs::create_dir_all(&log_dir).map_err(|e| Error::io(&log_dir, e))?;
        let output_path = log_dir.join(format!("{}.stdout", self.role.binary_name()));
        let stdout = File::create(&output_path).map_err(|e| Error::io(&output_path, e))?;
        let stderr = stdout.try_clone().map_err(|e| Error::io(&output_path, e))?;

        let mut launcher = Command::new(work_dir.join(&command.program));
        launcher
            .args(&command.args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        let mut child = spawn_retrying_busy(&mut launcher).map_err(|source| Error::Spawn {
            role: self.role,
            index: self.index,
            source,
        })?;

        let pid = child.id();
        self.pid = Some(pid);

        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                let output = fs::read_to_string(&output_path).unwrap_or_default();
                tracing::warn!(
                    node = %self.label(),
                    %status,
                    output = %output.trim_end(),
                    "launcher exited with failure"
                );
            }
            Err(e) => {
                tracing::warn!(node = %self.label(), error = %e, "failed to wait for launcher");
            }
        }

        Ok(pid)
    }

    /// Whether the recorded PID is still running.
    pub fn is_alive(&self, liveness: &dyn ProcessLiveness) -> bool {
        self.pid.is_some_and(|pid| liveness.is_alive(pid))
    }

    /// Signals the recorded PID if it is alive.
    pub fn kill(&self, liveness: &dyn ProcessLiveness, signal: NodeSignal) {
        if let Some(pid) = self.pid {
            signal_if_alive(liveness, pid, signal, &self.label());
        }
    }

    /// `nebula-{role}#{index}`.
    pub fn label(&self) -> String {
        format!("{}#{}", self.role.binary_name(), self.index)
    }
}

/// Spawns `command`, retrying while the executable is still held open for
/// writing by a freshly forked sibling (ETXTBSY right after a copy).
fn spawn_retrying_busy(command: &mut Command) -> std::io::Result<Child> {
    const ATTEMPTS: u32 = 5;
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempt < ATTEMPTS => {
                tracing::debug!(attempt, "executable busy, retrying spawn");
                attempt += 1;
                sleep(Duration::from_millis(50));
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::SignalLiveness;

    fn quartet() -> PortQuartet {
        PortQuartet {
            primary: 9669,
            internal: 9670,
            http: 19669,
            https: 19670,
        }
    }

    #[test]
    fn test_command_layout() {
        let node = NebulaProcess::new(Role::Metad, quartet(), 0, Params::new());
        let command = node.format_command();

        assert_eq!(command.program, PathBuf::from("bin/nebula-metad"));
        assert_eq!(command.args[0], "--flagfile");
        assert_eq!(command.args[1], "conf/nebula-metad.conf");
        assert!(command.args.contains(&"--port=9669".to_string()));
        assert!(command.args.contains(&"--ws_http_port=19669".to_string()));
        assert!(command.args.contains(&"--ws_h2_port=19670".to_string()));
        assert!(command.args.contains(&"--log_dir=logs0".to_string()));
        assert!(
            command
                .args
                .contains(&"--pid_file=pids0/nebula-metad.pid".to_string())
        );
        assert!(command.args.contains(&"--data_path=data0/metad".to_string()));
    }

    #[test]
    fn test_internal_port_is_not_passed() {
        let node = NebulaProcess::new(Role::Storaged, quartet(), 0, Params::new());
        let line = node.format_command().to_command_line();
        assert!(!line.contains("9670"));
    }

    #[test]
    fn test_instance_index_namespaces_paths() {
        let node = NebulaProcess::new(Role::Storaged, quartet(), 2, Params::new());
        let args = node.format_command().args;
        assert!(args.contains(&"--log_dir=logs2".to_string()));
        assert!(args.contains(&"--pid_file=pids2/nebula-storaged.pid".to_string()));
        assert!(args.contains(&"--data_path=data2/storaged".to_string()));
    }

    #[test]
    fn test_graphd_has_no_data_path() {
        let params = Params::new().with("data_path", "somewhere");
        let node = NebulaProcess::new(Role::Graphd, quartet(), 0, params);
        let command = node.format_command();
        assert!(!command.args.iter().any(|a| a.starts_with("--data_path")));
        assert!(node.data_path().is_none());
    }

    #[test]
    fn test_node_params_override_derived() {
        let params = Params::new().with("log_dir", "custom_logs");
        let node = NebulaProcess::new(Role::Metad, quartet(), 0, params);
        let args = node.format_command().args;
        assert!(args.contains(&"--log_dir=custom_logs".to_string()));
        assert!(!args.contains(&"--log_dir=logs0".to_string()));
    }

    #[test]
    fn test_command_is_deterministic() {
        let params = Params::new().with("b", 2).with("a", 1);
        let node = NebulaProcess::new(Role::Graphd, quartet(), 0, params);
        assert_eq!(node.format_command(), node.format_command());
        let line = node.format_command().to_command_line();
        assert!(line.starts_with("bin/nebula-graphd --flagfile conf/nebula-graphd.conf --a=1 --b=2"));
    }

    #[test]
    fn test_meta_server_addrs() {
        let mut node = NebulaProcess::new(Role::Graphd, quartet(), 0, Params::new());
        node.set_meta_server_addrs("127.0.0.1:9559,127.0.0.1:9560");
        assert_eq!(
            node.params().get(META_SERVER_ADDRS),
            Some("127.0.0.1:9559,127.0.0.1:9560")
        );
        assert_eq!(node.address(), "127.0.0.1:9669");
    }

    #[test]
    fn test_not_started_is_not_alive() {
        let node = NebulaProcess::new(Role::Metad, quartet(), 0, Params::new());
        assert!(node.pid().is_none());
        assert!(!node.is_alive(&SignalLiveness));
        // No PID: nothing to signal.
        node.kill(&SignalLiveness, NodeSignal::Kill);
    }

    #[test]
    fn test_start_missing_binary_is_spawn_error() {
        let temp = tempfile::TempDir::new().expect("Failed to create temp dir");
        let mut node = NebulaProcess::new(Role::Metad, quartet(), 0, Params::new());
        let result = node.start(temp.path());
        assert!(matches!(
            result,
            Err(Error::Spawn {
                role: Role::Metad,
                index: 0,
                ..
            })
        ));
        assert!(node.pid().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_launcher_is_not_an_error() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().expect("Failed to create temp dir");
        let bin = temp.path().join("bin");
        fs::create_dir_all(&bin).expect("Failed to create directory");
        let script = bin.join("nebula-graphd");
        fs::write(&script, "#!/bin/sh\necho boom\nexit 3\n").expect("Failed to write file");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .expect("Failed to set permissions");

        let mut node = NebulaProcess::new(Role::Graphd, quartet(), 0, Params::new());
        let pid = node.start(temp.path()).unwrap();

        assert_eq!(node.pid(), Some(pid));
        assert!(!node.is_alive(&SignalLiveness));
        let captured =
            fs::read_to_string(temp.path().join("logs0/nebula-graphd.stdout")).unwrap();
        assert_eq!(captured.trim(), "boom");
    }
}
