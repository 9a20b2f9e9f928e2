//! Configuration for the autoscaler.
//!
//! Provides the `ScalerConfig` struct shared by the proxy client, worker
//! pool driver, reconciler, and control loop, with environment-variable
//! loading and validation.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the autoscaler.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    // Proxy settings
    /// Base URL of the HAProxy Data Plane API (including the /v2 prefix).
    pub dataplane_url: String,
    /// Basic-auth user for the Data Plane API.
    pub dataplane_user: String,
    /// Basic-auth password for the Data Plane API.
    pub dataplane_password: String,
    /// Name of the managed backend.
    pub backend_name: String,
    /// Name of the managed frontend.
    pub frontend_name: String,
    /// Per-member connection cap.
    pub member_maxconn: u32,
    /// Frontend-wide connection cap.
    pub frontend_maxconn: u32,
    /// Port the frontend bind listens on.
    pub bind_port: u16,
    /// URI prefix for the HAProxy stats page.
    pub stats_uri_prefix: String,
    /// Timeout applied to every Data Plane API request.
    pub request_timeout: Duration,

    // Worker pool settings
    /// Docker image for worker containers.
    pub worker_image: String,
    /// Port the worker process listens on inside its container.
    pub container_port: u16,
    /// Host port for ordinal 0; ordinal i maps to base_port + i.
    pub base_port: u16,
    /// Upper bound on the worker count regardless of CPU load.
    pub max_workers: usize,

    // Control loop settings
    /// Interval between CPU samples / reconciliation cycles.
    pub sample_interval: Duration,
    /// Wait between committing member removals and killing the workers,
    /// giving in-flight requests time to finish.
    pub drain_wait: Duration,
    /// Attempts per cycle when the proxy reports a stale version.
    pub stale_retry_attempts: u32,
    /// Backoff before retrying after a transient proxy failure.
    pub transient_backoff: Duration,
    /// Consecutive cycle failures before the loop enters a cool-off pause.
    pub max_consecutive_failures: u32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            // Proxy defaults
            dataplane_url: "http://localhost:5555/v2".to_string(),
            dataplane_user: "dataplaneapi".to_string(),
            dataplane_password: "admin".to_string(),
            backend_name: "server_backend".to_string(),
            frontend_name: "server_frontend".to_string(),
            member_maxconn: 30,
            frontend_maxconn: 2000,
            bind_port: 80,
            stats_uri_prefix: "/haproxy?stats".to_string(),
            request_timeout: Duration::from_secs(10),

            // Worker pool defaults
            worker_image: "project-2".to_string(),
            container_port: 5000,
            base_port: 5000,
            max_workers: 10,

            // Control loop defaults
            sample_interval: Duration::from_secs(10),
            drain_wait: Duration::from_secs(3),
            stale_retry_attempts: 3,
            transient_backoff: Duration::from_secs(2),
            max_consecutive_failures: 5,
        }
    }
}

impl ScalerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PROXYSCALE_DATAPLANE_URL`: Data Plane API base URL (default: http://localhost:5555/v2)
    /// - `PROXYSCALE_DATAPLANE_USER`: Basic-auth user (default: dataplaneapi)
    /// - `PROXYSCALE_DATAPLANE_PASSWORD`: Basic-auth password (default: admin)
    /// - `PROXYSCALE_BACKEND`: Backend name (default: server_backend)
    /// - `PROXYSCALE_FRONTEND`: Frontend name (default: server_frontend)
    /// - `PROXYSCALE_WORKER_IMAGE`: Worker container image (default: project-2)
    /// - `PROXYSCALE_CONTAINER_PORT`: In-container worker port (default: 5000)
    /// - `PROXYSCALE_BASE_PORT`: Host port for ordinal 0 (default: 5000)
    /// - `PROXYSCALE_MAX_WORKERS`: Worker count ceiling (default: 10)
    /// - `PROXYSCALE_INTERVAL_SECS`: Sampling interval in seconds (default: 10)
    /// - `PROXYSCALE_DRAIN_SECS`: Drain wait in seconds (default: 3)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PROXYSCALE_DATAPLANE_URL") {
            config.dataplane_url = val;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_DATAPLANE_USER") {
            config.dataplane_user = val;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_DATAPLANE_PASSWORD") {
            config.dataplane_password = val;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_BACKEND") {
            config.backend_name = val;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_FRONTEND") {
            config.frontend_name = val;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_WORKER_IMAGE") {
            config.worker_image = val;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_CONTAINER_PORT") {
            config.container_port = parse_env_value(&val, "PROXYSCALE_CONTAINER_PORT")?;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_BASE_PORT") {
            config.base_port = parse_env_value(&val, "PROXYSCALE_BASE_PORT")?;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "PROXYSCALE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("PROXYSCALE_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "PROXYSCALE_INTERVAL_SECS")?;
            config.sample_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PROXYSCALE_DRAIN_SECS") {
            let secs: u64 = parse_env_value(&val, "PROXYSCALE_DRAIN_SECS")?;
            config.drain_wait = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the Data Plane API base URL.
    pub fn with_dataplane_url(mut self, url: impl Into<String>) -> Self {
        self.dataplane_url = url.into();
        self
    }

    /// Sets the worker image.
    pub fn with_worker_image(mut self, image: impl Into<String>) -> Self {
        self.worker_image = image.into();
        self
    }

    /// Sets the base host port.
    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Sets the worker count ceiling.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Sets the sampling interval.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Sets the drain wait.
    pub fn with_drain_wait(mut self, wait: Duration) -> Self {
        self.drain_wait = wait;
        self
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.sample_interval.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "sample_interval must be greater than 0".to_string(),
            ));
        }

        if self.backend_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "backend_name cannot be empty".to_string(),
            ));
        }

        if self.frontend_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "frontend_name cannot be empty".to_string(),
            ));
        }

        if self.worker_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "worker_image cannot be empty".to_string(),
            ));
        }

        // Every ordinal below the ceiling must map to a representable port.
        let highest = self.base_port as usize + self.max_workers - 1;
        if highest > u16::MAX as usize {
            return Err(ConfigError::ValidationFailed(format!(
                "base_port {} + max_workers {} exceeds the port range",
                self.base_port, self.max_workers
            )));
        }

        Ok(())
    }

    /// Returns the host port assigned to a worker ordinal.
    pub fn port_for(&self, ordinal: usize) -> u16 {
        self.base_port + ordinal as u16
    }

    /// Returns the backend member name for a worker ordinal.
    pub fn member_name(&self, ordinal: usize) -> String {
        format!("server{ordinal}")
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ScalerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dataplane_url, "http://localhost:5555/v2");
        assert_eq!(config.backend_name, "server_backend");
        assert_eq!(config.base_port, 5000);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.sample_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_setters() {
        let config = ScalerConfig::new()
            .with_dataplane_url("http://127.0.0.1:5556/v2")
            .with_worker_image("webapp:latest")
            .with_base_port(9000)
            .with_max_workers(4)
            .with_sample_interval(Duration::from_secs(5))
            .with_drain_wait(Duration::from_secs(1));

        assert_eq!(config.dataplane_url, "http://127.0.0.1:5556/v2");
        assert_eq!(config.worker_image, "webapp:latest");
        assert_eq!(config.base_port, 9000);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.sample_interval, Duration::from_secs(5));
        assert_eq!(config.drain_wait, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_max_workers() {
        let config = ScalerConfig::new().with_max_workers(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_port_overflow() {
        let config = ScalerConfig::new().with_base_port(65530).with_max_workers(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_and_member_name_derivation() {
        let config = ScalerConfig::default();
        assert_eq!(config.port_for(0), 5000);
        assert_eq!(config.port_for(7), 5007);
        assert_eq!(config.member_name(0), "server0");
        assert_eq!(config.member_name(12), "server12");
    }
}
