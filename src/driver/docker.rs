//! Docker-backed worker pool driver using the bollard crate.
//!
//! Pool membership is tracked with container labels so `list()` never picks
//! up unrelated containers on the host:
//! - `proxyscale.pool`: the pool (backend) name
//! - `proxyscale.ordinal`: the worker's ordinal

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    PruneContainersOptions, StartContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use tracing::{debug, warn};

use crate::config::ScalerConfig;
use crate::error::DriverError;

use super::{Worker, WorkerPoolDriver};

const POOL_LABEL: &str = "proxyscale.pool";
const ORDINAL_LABEL: &str = "proxyscale.ordinal";

/// Worker pool driver backed by the local Docker daemon.
pub struct DockerDriver {
    docker: Docker,
    /// Pool name stamped on every container (the backend name).
    pool: String,
    image: String,
    container_port: u16,
    base_port: u16,
}

impl DockerDriver {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::DaemonUnavailable` if the daemon is not
    /// accessible.
    pub fn new(config: &ScalerConfig) -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self {
            docker,
            pool: config.backend_name.clone(),
            image: config.worker_image.clone(),
            container_port: config.container_port,
            base_port: config.base_port,
        })
    }

    /// Creates a driver from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker, config: &ScalerConfig) -> Self {
        Self {
            docker,
            pool: config.backend_name.clone(),
            image: config.worker_image.clone(),
            container_port: config.container_port,
            base_port: config.base_port,
        }
    }

    fn container_name(&self, ordinal: usize) -> String {
        format!("{}-worker{ordinal}", self.pool)
    }

    fn pool_filter(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{POOL_LABEL}={}", self.pool)],
        );
        filters
    }
}

#[async_trait]
impl WorkerPoolDriver for DockerDriver {
    async fn list(&self) -> Result<Vec<Worker>, DriverError> {
        let options = ListContainersOptions {
            all: false, // running only
            filters: self.pool_filter(),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| DriverError::Runtime(format!("Failed to list containers: {e}")))?;

        let mut workers = Vec::with_capacity(containers.len());
        for container in containers {
            let id = container.id.unwrap_or_default();
            let ordinal = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(ORDINAL_LABEL))
                .and_then(|v| v.parse::<usize>().ok());

            match ordinal {
                Some(ordinal) => workers.push(Worker {
                    ordinal,
                    id,
                    port: self.base_port + ordinal as u16,
                }),
                None => {
                    // A pool-labeled container without a readable ordinal was
                    // not created by us; leave it alone.
                    warn!(container_id = %id, "Ignoring pool container without ordinal label");
                }
            }
        }

        workers.sort_by_key(|w| w.ordinal);
        Ok(workers)
    }

    async fn start(&self, ordinal: usize) -> Result<Worker, DriverError> {
        let host_port = self.base_port + ordinal as u16;
        let container_key = format!("{}/tcp", self.container_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_key, HashMap::new());

        let mut labels = HashMap::new();
        labels.insert(POOL_LABEL.to_string(), self.pool.clone());
        labels.insert(ORDINAL_LABEL.to_string(), ordinal.to_string());

        let container_config = Config {
            image: Some(self.image.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: self.container_name(ordinal),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DriverError::LaunchFailed {
                ordinal,
                reason: format!("create failed: {e}"),
            })?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let message = e.to_string();
            // Remove the half-created container so a retry can reuse the name.
            let _ = self.docker.remove_container(&created.id, None).await;

            if message.contains("port is already allocated")
                || message.contains("address already in use")
            {
                return Err(DriverError::PortInUse(host_port));
            }
            return Err(DriverError::LaunchFailed {
                ordinal,
                reason: format!("start failed: {message}"),
            });
        }

        debug!(ordinal, container_id = %created.id, host_port, "Worker container started");

        Ok(Worker {
            ordinal,
            id: created.id,
            port: host_port,
        })
    }

    async fn stop(&self, worker: &Worker) -> Result<(), DriverError> {
        self.docker
            .kill_container(&worker.id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    DriverError::ContainerNotFound(worker.id.clone())
                } else {
                    DriverError::Runtime(format!("Failed to kill container: {e}"))
                }
            })?;

        debug!(ordinal = worker.ordinal, container_id = %worker.id, "Worker container killed");
        Ok(())
    }

    async fn prune(&self) -> Result<(), DriverError> {
        let options = PruneContainersOptions {
            filters: self.pool_filter(),
        };

        self.docker
            .prune_containers(Some(options))
            .await
            .map_err(|e| DriverError::Runtime(format!("Failed to prune containers: {e}")))?;

        Ok(())
    }
}
