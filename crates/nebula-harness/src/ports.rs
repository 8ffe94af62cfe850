//! Free TCP port discovery on localhost.
//!
//! Ports are found by binding a random candidate and releasing it right away,
//! so a port handed out here is only "free at the time of the check". Another
//! process can grab it before the node binds it; the rejection set and the
//! retry bounds below are the only mitigation.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Error, Result};

/// Ports assigned to each node instance.
pub const PORTS_PER_PROCESS: usize = 4;

/// Candidate range for `get_free_port`.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 10_000..=20_000;

/// Bind attempts per `get_free_port` call.
const BIND_ATTEMPTS: usize = 30;

/// Draws per quartet slot before giving up.
const DRAW_ATTEMPTS: usize = 100;

/// The four ports of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortQuartet {
    /// Client-facing port.
    pub primary: u16,

    /// Peer port, always `primary + 1`.
    pub internal: u16,

    /// HTTP status port.
    pub http: u16,

    /// HTTP/2 status port.
    pub https: u16,
}

impl PortQuartet {
    /// Builds a quartet from exactly four ports in allocation order.
    pub fn from_slice(ports: &[u16]) -> Option<Self> {
        match *ports {
            [primary, internal, http, https] => Some(Self {
                primary,
                internal,
                http,
                https,
            }),
            _ => None,
        }
    }

    pub fn as_array(&self) -> [u16; PORTS_PER_PROCESS] {
        [self.primary, self.internal, self.http, self.https]
    }
}

/// Random-probe port allocator.
pub struct PortAllocator {
    rng: StdRng,
    range: RangeInclusive<u16>,
}

impl PortAllocator {
    /// Creates an allocator seeded from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates an allocator with a caller-provided random source.
    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            range: DEFAULT_PORT_RANGE,
        }
    }

    /// Restricts candidates to `range`.
    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.range = range;
        self
    }

    /// Binds a random candidate port, releases it and returns it.
    ///
    /// Returns `None` once every bind attempt failed.
    pub fn get_free_port(&mut self) -> Option<u16> {
        for _ in 0..BIND_ATTEMPTS {
            let candidate = self.rng.gen_range(self.range.clone());
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, candidate)) {
                Ok(listener) => match listener.local_addr() {
                    Ok(addr) => return Some(addr.port()),
                    Err(e) => {
                        tracing::debug!(port = candidate, error = %e, "bound port has no local address");
                    }
                },
                Err(e) => {
                    tracing::trace!(port = candidate, error = %e, "candidate port busy");
                }
            }
        }
        None
    }

    /// Allocates `count` ports laid out as consecutive quartets.
    ///
    /// Within each quartet the first two ports are `p` and `p + 1`; the last
    /// two are independent. All returned ports are distinct.
    pub fn find_free_ports(&mut self, count: usize) -> Result<Vec<u16>> {
        if count % PORTS_PER_PROCESS != 0 {
            return Err(Error::InvalidPortCount(count));
        }

        let mut ports = Vec::with_capacity(count);
        let mut taken = HashSet::with_capacity(count);

        for slot in 0..count {
            match slot % PORTS_PER_PROCESS {
                0 => {
                    let (primary, internal) = self
                        .draw_pair(&taken)
                        .ok_or(Error::PortsExhausted {
                            requested: count,
                            allocated: ports.len(),
                        })?;
                    ports.extend([primary, internal]);
                    taken.extend([primary, internal]);
                }
                // Pushed together with the primary port.
                1 => {}
                _ => {
                    let port = self.draw_single(&taken).ok_or(Error::PortsExhausted {
                        requested: count,
                        allocated: ports.len(),
                    })?;
                    ports.push(port);
                    taken.insert(port);
                }
            }
        }

        Ok(ports)
    }

    /// Allocates `n` quartets.
    pub fn find_free_quartets(&mut self, n: usize) -> Result<Vec<PortQuartet>> {
        let ports = self.find_free_ports(n * PORTS_PER_PROCESS)?;
        Ok(ports
            .chunks_exact(PORTS_PER_PROCESS)
            .filter_map(PortQuartet::from_slice)
            .collect())
    }

    fn draw_pair(&mut self, taken: &HashSet<u16>) -> Option<(u16, u16)> {
        for _ in 0..DRAW_ATTEMPTS {
            let Some(port) = self.get_free_port() else {
                continue;
            };
            let Some(next) = port.checked_add(1) else {
                continue;
            };
            if !taken.contains(&port) && !taken.contains(&next) {
                return Some((port, next));
            }
        }
        None
    }

    fn draw_single(&mut self, taken: &HashSet<u16>) -> Option<u16> {
        for _ in 0..DRAW_ATTEMPTS {
            match self.get_free_port() {
                Some(port) if !taken.contains(&port) => return Some(port),
                _ => {}
            }
        }
        None
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates `count` ports with a fresh allocator.
pub fn find_free_ports(count: usize) -> Result<Vec<u16>> {
    PortAllocator::new().find_free_ports(count)
}
