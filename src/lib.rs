//! proxyscale: CPU-driven autoscaler for a Docker worker pool behind HAProxy.
//!
//! Samples host CPU utilization, derives a target worker count, and
//! reconciles the running container set and the proxy's backend member list
//! to match, one Data Plane API transaction per cycle.

// Core modules
pub mod cli;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod reconciler;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{DriverError, ProxyError, ReconcileError};
