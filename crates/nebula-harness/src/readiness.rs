//! TCP readiness polling.
//!
//! A port counts as ready once a connection to it succeeds. This proves the
//! listener is open, not that the node finished bootstrapping.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread::sleep;
use std::time::Duration;

/// Round budget and timings for a readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Maximum probe rounds.
    pub rounds: u32,

    /// Sleep between rounds.
    pub interval: Duration,

    /// Timeout of a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            rounds: 20,
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub fn probe_port(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

/// Polls `ports` until every one accepted a connection or the rounds run out.
///
/// Confirmed ports are not probed again.
pub fn wait_for_ports(ports: &[u16], policy: &ReadinessPolicy) -> bool {
    let mut confirmed: BTreeMap<u16, bool> = ports.iter().map(|&p| (p, false)).collect();

    for round in 0..policy.rounds {
        for (&port, ready) in &mut confirmed {
            if *ready {
                continue;
            }
            if probe_port(port, policy.connect_timeout) {
                tracing::debug!(port, round, "port is accepting connections");
                *ready = true;
            }
        }

        if confirmed.values().all(|&ready| ready) {
            return true;
        }

        let pending: Vec<u16> = confirmed
            .iter()
            .filter(|&(_, &ready)| !ready)
            .map(|(&port, _)| port)
            .collect();
        tracing::debug!(round, ?pending, "waiting for ports");
        sleep(policy.interval);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn fast_policy(rounds: u32) -> ReadinessPolicy {
        ReadinessPolicy {
            rounds,
            interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
        }
    }

    fn closed_port() -> u16 {
        // Bind, read the port, release. Nothing listens afterwards.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_listening_ports_are_ready() {
        let a = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let b = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let ports = [a.local_addr().unwrap().port(), b.local_addr().unwrap().port()];

        assert!(wait_for_ports(&ports, &fast_policy(3)));
    }

    #[test]
    fn test_empty_port_set_is_ready() {
        assert!(wait_for_ports(&[], &fast_policy(1)));
    }

    #[test]
    fn test_closed_port_exhausts_rounds() {
        let open = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let ports = [open.local_addr().unwrap().port(), closed_port()];

        let started = Instant::now();
        assert!(!wait_for_ports(&ports, &fast_policy(3)));
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_zero_rounds_is_never_ready() {
        let open = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let ports = [open.local_addr().unwrap().port()];
        assert!(!wait_for_ports(&ports, &fast_policy(0)));
    }

    #[test]
    fn test_port_that_comes_up_late() {
        let port = closed_port();
        let handle = std::thread::spawn(move || {
            sleep(Duration::from_millis(100));
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
            sleep(Duration::from_millis(500));
            drop(listener);
        });

        assert!(wait_for_ports(&[port], &fast_policy(20)));
        handle.join().unwrap();
    }

    #[test]
    fn test_default_policy_budget() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.rounds, 20);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.connect_timeout, Duration::from_secs(1));
    }
}
