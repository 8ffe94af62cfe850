//! Local Nebula Graph clusters for integration tests.
//!
//! Provisions a working directory from a build tree, launches metad,
//! storaged and graphd nodes on freshly allocated ports, waits until every
//! node accepts TCP connections, and tears everything down afterwards:
//! - Free port discovery with `port`/`port + 1` pairs per node
//! - Layered node flags (base, role, caller)
//! - Rollback of a failed start, SIGTERM-then-SIGKILL shutdown
//!
//! ```no_run
//! use nebula_harness::NebulaCluster;
//!
//! # fn main() -> nebula_harness::Result<()> {
//! let mut cluster = NebulaCluster::builder("/src/nebula/build", "/src/nebula")
//!     .storaged(3)
//!     .flag("enable_ssl", true)
//!     .build()?;
//! cluster.install()?;
//! let graphd_ports = cluster.start()?;
//! // ... connect to 127.0.0.1:{graphd_ports[0]} ...
//! cluster.stop(true);
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod layout;
pub mod liveness;
pub mod params;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod role;

#[cfg(test)]
mod test_support;

pub use cluster::{ClusterState, NebulaCluster, NebulaClusterBuilder, ShutdownPolicy, Topology, reclaim};
pub use config::{ConfigLoader, HarnessConfig};
pub use error::{Error, Result};
pub use layout::InstallSources;
pub use liveness::{NodeSignal, ProcessLiveness, SignalLiveness};
pub use params::{ParamOptions, Params};
pub use ports::{PortAllocator, PortQuartet, find_free_ports};
pub use process::{NebulaProcess, NodeCommand};
pub use readiness::ReadinessPolicy;
pub use role::Role;
