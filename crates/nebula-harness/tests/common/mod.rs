//! Shared fixtures for the lifecycle tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, sleep};
use std::time::Duration;

use nebula_harness::liveness::Delivery;
use nebula_harness::{
    NodeSignal, ProcessLiveness, ReadinessPolicy, Role, ShutdownPolicy, SignalLiveness,
};

/// Stub node: records its arguments next to `--pid_file`, daemonizes a
/// `sleep` and writes that PID to `--pid_file`, the way a real node would.
///
/// Nothing listens unless a [`PortResponder`] watches the working directory.
pub const NODE_STUB: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --pid_file=*) pid_file="${arg#--pid_file=}" ;;
  esac
done
echo "$@" > "${pid_file%.pid}.args"
sleep 600 </dev/null >/dev/null 2>&1 &
echo $! > "$pid_file"
"#;

pub const CERT_FILES: [&str; 5] = [
    "test.ca.key",
    "test.ca.pem",
    "test.ca.password",
    "test.derive.key",
    "test.derive.crt",
];

/// A fake nebula checkout under `root`: `build/bin`, `conf/`, `tests/cert`
/// and `resources/gflags.json`, with every binary replaced by [`NODE_STUB`].
pub struct FakeTree {
    pub build_dir: PathBuf,
    pub src_dir: PathBuf,
}

impl FakeTree {
    pub fn new(root: &Path) -> Self {
        let src_dir = root.join("nebula");
        let build_dir = src_dir.join("build");

        for dir in [
            build_dir.join("bin"),
            src_dir.join("conf"),
            src_dir.join("tests/cert"),
            src_dir.join("resources"),
        ] {
            fs::create_dir_all(&dir).expect("Failed to create directory");
        }

        for role in Role::ALL {
            let binary = build_dir.join("bin").join(role.binary_name());
            fs::write(&binary, NODE_STUB).expect("Failed to write node stub");
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))
                .expect("Failed to set permissions");
            fs::write(
                src_dir.join("conf").join(role.default_conf_name()),
                "--daemonize=true\n",
            )
            .expect("Failed to write config template");
        }
        fs::write(src_dir.join("resources/gflags.json"), "{}").expect("Failed to write gflags");
        for name in CERT_FILES {
            fs::write(src_dir.join("tests/cert").join(name), name)
                .expect("Failed to write certificate");
        }

        Self { build_dir, src_dir }
    }
}

/// Opens a listener on the `--port` of every stub node that starts under a
/// working directory, standing in for the node's own socket.
///
/// Listeners live until the responder is dropped.
pub struct PortResponder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortResponder {
    pub fn watch(work_dir: &Path) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let work_dir = work_dir.to_path_buf();
        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut listeners: HashMap<PathBuf, TcpListener> = HashMap::new();
                while !stop.load(Ordering::Relaxed) {
                    for args_file in args_files(&work_dir) {
                        if listeners.contains_key(&args_file) {
                            continue;
                        }
                        let Some(port) = recorded_port(&args_file) else {
                            continue;
                        };
                        if let Ok(listener) = TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                            listeners.insert(args_file, listener);
                        }
                    }
                    sleep(Duration::from_millis(20));
                }
            })
        };

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for PortResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// `pids*/*.args` files written by [`NODE_STUB`].
fn args_files(work_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(work_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("pids"))
        .filter_map(|dir| fs::read_dir(dir.path()).ok())
        .flat_map(|files| files.flatten().map(|f| f.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "args"))
        .collect()
}

/// The `--port=` value of a fully written args file.
fn recorded_port(args_file: &Path) -> Option<u16> {
    let args = fs::read_to_string(args_file).ok()?;
    if !args.ends_with('\n') {
        return None;
    }
    args.split_whitespace()
        .find_map(|arg| arg.strip_prefix("--port="))
        .and_then(|port| port.parse().ok())
}

/// Real signal delivery that also records which PIDs were signalled.
#[derive(Clone, Default)]
pub struct SignalRecorder {
    sent: Arc<Mutex<Vec<u32>>>,
}

impl SignalRecorder {
    pub fn signalled(&self) -> HashSet<u32> {
        self.sent
            .lock()
            .expect("Failed to lock signal log")
            .iter()
            .copied()
            .collect()
    }
}

impl ProcessLiveness for SignalRecorder {
    fn is_alive(&self, pid: u32) -> bool {
        SignalLiveness.is_alive(pid)
    }

    fn send_signal(&self, pid: u32, signal: NodeSignal) -> io::Result<Delivery> {
        self.sent.lock().expect("Failed to lock signal log").push(pid);
        SignalLiveness.send_signal(pid, signal)
    }
}

pub fn quick_readiness(rounds: u32) -> ReadinessPolicy {
    ReadinessPolicy {
        rounds,
        interval: Duration::from_millis(250),
        connect_timeout: Duration::from_millis(250),
    }
}

pub fn quick_shutdown() -> ShutdownPolicy {
    ShutdownPolicy {
        retries: 20,
        interval: Duration::from_millis(100),
    }
}

/// Counts `pids*/*.pid` files under `work_dir`.
pub fn pid_file_count(work_dir: &Path) -> usize {
    fs::read_dir(work_dir)
        .expect("Failed to read working directory")
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("pids"))
        .filter_map(|dir| fs::read_dir(dir.path()).ok())
        .flat_map(|files| files.flatten())
        .filter(|f| f.path().extension().is_some_and(|ext| ext == "pid"))
        .count()
}
