//! Error types for proxyscale operations.
//!
//! Defines error types for the major subsystems:
//! - Proxy configuration (HAProxy Data Plane API)
//! - Worker pool driver (Docker container management)
//! - Reconciliation cycles and bootstrap

use thiserror::Error;

/// Errors that can occur when talking to the proxy's configuration API.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Proxy management endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid response from proxy: {0}")]
    InvalidResponse(String),

    #[error("Configuration version {requested} is no longer current")]
    StaleVersion { requested: u64 },

    #[error("Transaction '{0}' is unknown or expired")]
    UnknownTransaction(String),

    #[error("Backend member '{0}' already exists")]
    DuplicateMember(String),

    #[error("Backend member '{0}' not found")]
    MissingMember(String),

    #[error("Transaction commit failed: {0}")]
    CommitFailed(String),
}

/// Errors that can occur in the worker pool driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Container runtime not available: {0}")]
    DaemonUnavailable(String),

    #[error("Host port {0} is already in use")]
    PortInUse(u16),

    #[error("Failed to launch worker {ordinal}: {reason}")]
    LaunchFailed { ordinal: usize, reason: String },

    #[error("Worker container '{0}' not found")]
    ContainerNotFound(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Errors that can occur during a reconciliation cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A worker failed to start during scale-up. The cycle is abandoned and
    /// the open transaction never committed.
    #[error("Scale-up failed at ordinal {ordinal}: {source}")]
    ScaleUpFailed {
        ordinal: usize,
        #[source]
        source: DriverError,
    },

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Bootstrap transaction did not apply: {0}")]
    BootstrapFailed(String),
}
