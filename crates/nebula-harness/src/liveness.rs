//! Process liveness probes and signal delivery.

use std::fmt;
use std::fs;
use std::io;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Signals the harness sends to nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSignal {
    /// Cooperative shutdown (SIGTERM).
    Terminate,

    /// Forced kill (SIGKILL).
    Kill,
}

impl NodeSignal {
    fn as_nix(self) -> Signal {
        match self {
            NodeSignal::Terminate => Signal::SIGTERM,
            NodeSignal::Kill => Signal::SIGKILL,
        }
    }
}

impl fmt::Display for NodeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nix().as_str())
    }
}

/// Result of a signal delivery that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal reached the process.
    Sent,

    /// The process exited between the liveness check and the signal.
    AlreadyExited,
}

/// Capability for checking and signalling OS processes by PID.
pub trait ProcessLiveness: Send {
    /// Whether `pid` names a running (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Delivers `signal` to `pid`.
    fn send_signal(&self, pid: u32, signal: NodeSignal) -> io::Result<Delivery>;
}

/// [`ProcessLiveness`] backed by `kill(2)`.
///
/// A null signal answers the existence question. On Linux, processes in the
/// zombie state count as dead since they no longer hold any port.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalLiveness;

impl ProcessLiveness for SignalLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => !is_zombie(pid),
            // Exists, owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn send_signal(&self, pid: u32, signal: NodeSignal) -> io::Result<Delivery> {
        let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        match signal::kill(Pid::from_raw(raw), signal.as_nix()) {
            Ok(()) => Ok(Delivery::Sent),
            Err(Errno::ESRCH) => Ok(Delivery::AlreadyExited),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // `pid (comm) S ...`; comm may itself contain parentheses.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// Sends `signal` to `pid` if it is alive.
///
/// An already-exited race is logged and ignored. Other delivery failures are
/// logged as warnings; none are returned.
pub fn signal_if_alive(liveness: &dyn ProcessLiveness, pid: u32, signal: NodeSignal, label: &str) {
    if !liveness.is_alive(pid) {
        return;
    }
    match liveness.send_signal(pid, signal) {
        Ok(Delivery::Sent) => {
            tracing::debug!(pid, %signal, node = label, "signal sent");
        }
        Ok(Delivery::AlreadyExited) => {
            tracing::debug!(pid, %signal, node = label, "process already exited");
        }
        Err(e) => {
            tracing::warn!(pid, %signal, node = label, error = %e, "failed to signal process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_self_is_alive() {
        assert!(SignalLiveness.is_alive(std::process::id()));
    }

    #[test]
    fn test_out_of_range_pid_is_dead() {
        assert!(!SignalLiveness.is_alive(u32::MAX));
    }

    #[test]
    fn test_kill_then_dead() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(SignalLiveness.is_alive(pid));

        signal_if_alive(&SignalLiveness, pid, NodeSignal::Kill, "sleep");
        child.wait().unwrap();

        assert!(!SignalLiveness.is_alive(pid));
    }

    #[test]
    fn test_reaped_process_reports_already_exited() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        sleep(Duration::from_millis(10));

        // PID reuse within this window is possible but vanishingly rare.
        let delivery = SignalLiveness.send_signal(pid, NodeSignal::Terminate).unwrap();
        assert_eq!(delivery, Delivery::AlreadyExited);
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(NodeSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(NodeSignal::Kill.to_string(), "SIGKILL");
    }
}
