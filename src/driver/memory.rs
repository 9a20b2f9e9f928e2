//! In-memory worker pool driver for tests.
//!
//! Tracks live workers by ordinal, records every start/stop call in order,
//! and supports failure injection so reconciliation error paths can be
//! exercised without a container runtime.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::DriverError;

use super::{Worker, WorkerPoolDriver};

#[derive(Debug)]
struct DriverState {
    workers: BTreeMap<usize, Worker>,
    started: Vec<usize>,
    stopped: Vec<usize>,
    prunes: u32,
    next_id: u64,
    // Failure injection
    fail_start_of: Option<usize>,
    ports_in_use: Vec<u16>,
}

/// In-memory implementation of [`WorkerPoolDriver`].
#[derive(Debug)]
pub struct InMemoryDriver {
    base_port: u16,
    state: Mutex<DriverState>,
}

impl InMemoryDriver {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            state: Mutex::new(DriverState {
                workers: BTreeMap::new(),
                started: Vec::new(),
                stopped: Vec::new(),
                prunes: 0,
                next_id: 0,
                fail_start_of: None,
                ports_in_use: Vec::new(),
            }),
        }
    }

    /// Seeds the pool with workers for ordinals `0..count` without
    /// recording start calls, as if they were running before this process.
    pub fn seed(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        for ordinal in 0..count {
            state.next_id += 1;
            let worker = Worker {
                ordinal,
                id: format!("c{}", state.next_id),
                port: self.base_port + ordinal as u16,
            };
            state.workers.insert(ordinal, worker);
        }
    }

    /// Live worker ordinals, ascending.
    pub fn live_ordinals(&self) -> Vec<usize> {
        self.state.lock().unwrap().workers.keys().copied().collect()
    }

    /// Ordinals passed to `start`, in call order.
    pub fn started(&self) -> Vec<usize> {
        self.state.lock().unwrap().started.clone()
    }

    /// Ordinals of workers passed to `stop`, in call order.
    pub fn stopped(&self) -> Vec<usize> {
        self.state.lock().unwrap().stopped.clone()
    }

    /// Number of `prune` calls.
    pub fn prunes(&self) -> u32 {
        self.state.lock().unwrap().prunes
    }

    /// The next `start` of this ordinal fails with `LaunchFailed`.
    pub fn fail_start_of(&self, ordinal: usize) {
        self.state.lock().unwrap().fail_start_of = Some(ordinal);
    }

    /// Marks a host port as taken by something outside the pool.
    pub fn occupy_port(&self, port: u16) {
        self.state.lock().unwrap().ports_in_use.push(port);
    }
}

#[async_trait]
impl WorkerPoolDriver for InMemoryDriver {
    async fn list(&self) -> Result<Vec<Worker>, DriverError> {
        Ok(self.state.lock().unwrap().workers.values().cloned().collect())
    }

    async fn start(&self, ordinal: usize) -> Result<Worker, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.started.push(ordinal);

        if state.fail_start_of == Some(ordinal) {
            state.fail_start_of = None;
            return Err(DriverError::LaunchFailed {
                ordinal,
                reason: "injected launch failure".to_string(),
            });
        }

        let port = self.base_port + ordinal as u16;
        if state.ports_in_use.contains(&port) {
            return Err(DriverError::PortInUse(port));
        }

        state.next_id += 1;
        let worker = Worker {
            ordinal,
            id: format!("c{}", state.next_id),
            port,
        };
        state.workers.insert(ordinal, worker.clone());
        Ok(worker)
    }

    async fn stop(&self, worker: &Worker) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.stopped.push(worker.ordinal);
        state
            .workers
            .remove(&worker.ordinal)
            .map(|_| ())
            .ok_or_else(|| DriverError::ContainerNotFound(worker.id.clone()))
    }

    async fn prune(&self) -> Result<(), DriverError> {
        self.state.lock().unwrap().prunes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_stop_roundtrip() {
        let driver = InMemoryDriver::new(5000);

        let worker = driver.start(0).await.unwrap();
        assert_eq!(worker.ordinal, 0);
        assert_eq!(worker.port, 5000);
        assert_eq!(driver.live_ordinals(), vec![0]);

        driver.stop(&worker).await.unwrap();
        assert!(driver.live_ordinals().is_empty());
        assert_eq!(driver.started(), vec![0]);
        assert_eq!(driver.stopped(), vec![0]);
    }

    #[tokio::test]
    async fn test_injected_launch_failure() {
        let driver = InMemoryDriver::new(5000);
        driver.fail_start_of(1);

        driver.start(0).await.unwrap();
        let err = driver.start(1).await.unwrap_err();
        assert!(matches!(err, DriverError::LaunchFailed { ordinal: 1, .. }));

        // The injection is one-shot.
        driver.start(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_occupied_port_is_reported() {
        let driver = InMemoryDriver::new(5000);
        driver.occupy_port(5002);

        let err = driver.start(2).await.unwrap_err();
        assert!(matches!(err, DriverError::PortInUse(5002)));
    }

    #[tokio::test]
    async fn test_seed_does_not_record_starts() {
        let driver = InMemoryDriver::new(5000);
        driver.seed(3);
        assert_eq!(driver.live_ordinals(), vec![0, 1, 2]);
        assert!(driver.started().is_empty());
    }
}
