//! Worker pool driver.
//!
//! Starting and stopping worker units bound to deterministic ports. Ordinal
//! `i` always listens on `base_port + i`, so the reconciler can derive every
//! port and member name from counts alone. `DockerDriver` runs real
//! containers; `InMemoryDriver` backs the tests.

pub mod docker;
pub mod memory;

use async_trait::async_trait;

use crate::error::DriverError;

pub use docker::DockerDriver;
pub use memory::InMemoryDriver;

/// A running worker unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    /// 0-based position in the pool; ordinals are contiguous.
    pub ordinal: usize,
    /// Runtime identifier (container id).
    pub id: String,
    /// Host port the worker is reachable on.
    pub port: u16,
}

/// Capability to list, start, and stop workers.
///
/// Implementations must tolerate concurrent external mutation (an operator
/// killing a container by hand); the reconciler re-reads `list()` every
/// cycle and treats it as the source of truth.
#[async_trait]
pub trait WorkerPoolDriver: Send + Sync {
    /// Live workers, ordered by ordinal.
    async fn list(&self) -> Result<Vec<Worker>, DriverError>;

    /// Launches the worker for an ordinal, bound to its deterministic port.
    async fn start(&self, ordinal: usize) -> Result<Worker, DriverError>;

    /// Kills a worker immediately. Draining happens upstream: the member is
    /// removed from the proxy (and the drain wait observed) before this is
    /// called.
    async fn stop(&self, worker: &Worker) -> Result<(), DriverError>;

    /// Reclaims resources of terminated workers. Best-effort.
    async fn prune(&self) -> Result<(), DriverError>;
}
