//! Proxy configuration client.
//!
//! All backend-pool mutations go through the proxy's transactional
//! configuration API: read the active version, open a transaction against
//! it, stage member additions/removals, then apply atomically. The
//! `ProxyClient` trait is the seam between the reconciler and the wire;
//! `DataPlaneClient` talks to a real HAProxy Data Plane API and
//! `InMemoryProxy` backs the tests.

pub mod dataplane;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

pub use dataplane::DataPlaneClient;
pub use memory::InMemoryProxy;

/// Opaque identifier of an open configuration transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A backend member entry: one upstream target in the proxy's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    /// Member name, `server{ordinal}`.
    pub name: String,
    /// Address the proxy routes to.
    pub address: String,
    /// Port the worker listens on.
    pub port: u16,
    /// Whether the proxy health-checks this member.
    pub check: bool,
    /// Per-member connection cap.
    pub maxconn: u32,
}

impl MemberSpec {
    /// Builds the member record for a worker ordinal on the local host.
    pub fn for_worker(name: impl Into<String>, port: u16, maxconn: u32) -> Self {
        Self {
            name: name.into(),
            address: "localhost".to_string(),
            port,
            check: true,
            maxconn,
        }
    }
}

/// Backend definition, created once at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    /// Load-balancing algorithm, e.g. "roundrobin".
    pub balance_algorithm: String,
    /// HTTP health-check method, e.g. "HEAD".
    pub httpchk_method: String,
    /// HTTP health-check URI.
    pub httpchk_uri: String,
}

impl BackendSpec {
    /// Round-robin backend with a `HEAD /` health check.
    pub fn round_robin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            balance_algorithm: "roundrobin".to_string(),
            httpchk_method: "HEAD".to_string(),
            httpchk_uri: "/".to_string(),
        }
    }
}

/// Frontend definition, created once at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendSpec {
    pub name: String,
    /// Backend receiving the frontend's traffic.
    pub default_backend: String,
    /// Frontend-wide connection cap.
    pub maxconn: u32,
    /// URI prefix of the stats page.
    pub stats_uri_prefix: String,
}

/// Listener bind for a frontend, created once at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindSpec {
    pub name: String,
    /// Listen address; "*" binds all interfaces.
    pub address: String,
    pub port: u16,
}

impl BindSpec {
    /// Wildcard HTTP bind on the given port.
    pub fn http(port: u16) -> Self {
        Self {
            name: "http".to_string(),
            address: "*".to_string(),
            port,
        }
    }
}

/// Result of applying a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub success: bool,
    pub detail: Option<String>,
}

impl CommitOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }

    /// Treats any outcome other than explicit success as a commit failure.
    pub fn ensure_success(self) -> Result<(), ProxyError> {
        if self.success {
            Ok(())
        } else {
            Err(ProxyError::CommitFailed(
                self.detail.unwrap_or_else(|| "no detail".to_string()),
            ))
        }
    }
}

/// Transactional access to the proxy's configuration store.
///
/// All operations are network calls against the management endpoint. Safe
/// retry happens only at the `begin_transaction` boundary; a commit whose
/// response was lost must never be re-sent, the caller reconciles from a
/// fresh version read instead.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Names of the committed members of a backend.
    async fn list_members(&self, backend: &str) -> Result<Vec<String>, ProxyError>;

    /// Currently active configuration version.
    async fn current_version(&self) -> Result<u64, ProxyError>;

    /// Opens a transaction against a previously read version.
    ///
    /// Fails with `ProxyError::StaleVersion` if another actor committed in
    /// between; the caller restarts the whole begin→build→commit sequence.
    async fn begin_transaction(&self, version: u64) -> Result<TransactionId, ProxyError>;

    /// Stages one member addition inside an open transaction.
    async fn add_member(
        &self,
        tx: &TransactionId,
        backend: &str,
        member: &MemberSpec,
    ) -> Result<(), ProxyError>;

    /// Stages one member removal inside an open transaction.
    async fn remove_member(
        &self,
        tx: &TransactionId,
        backend: &str,
        name: &str,
    ) -> Result<(), ProxyError>;

    /// Stages creation of a backend definition (bootstrap only).
    async fn create_backend(
        &self,
        tx: &TransactionId,
        backend: &BackendSpec,
    ) -> Result<(), ProxyError>;

    /// Stages creation of a frontend definition (bootstrap only).
    async fn create_frontend(
        &self,
        tx: &TransactionId,
        frontend: &FrontendSpec,
    ) -> Result<(), ProxyError>;

    /// Stages a frontend bind (bootstrap only).
    async fn create_bind(
        &self,
        tx: &TransactionId,
        frontend: &str,
        bind: &BindSpec,
    ) -> Result<(), ProxyError>;

    /// Atomically applies all staged mutations, or none of them.
    async fn commit(&self, tx: &TransactionId) -> Result<CommitOutcome, ProxyError>;

    /// Discards an open transaction. Best-effort; callers log and move on.
    async fn abandon(&self, tx: &TransactionId) -> Result<(), ProxyError>;
}

/// Extracts the ordinal from a `server{i}` member name.
pub fn member_ordinal(name: &str) -> Option<usize> {
    name.strip_prefix("server")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_spec_for_worker() {
        let member = MemberSpec::for_worker("server3", 5003, 30);
        assert_eq!(member.name, "server3");
        assert_eq!(member.address, "localhost");
        assert_eq!(member.port, 5003);
        assert!(member.check);
        assert_eq!(member.maxconn, 30);
    }

    #[test]
    fn test_member_ordinal_parsing() {
        assert_eq!(member_ordinal("server0"), Some(0));
        assert_eq!(member_ordinal("server17"), Some(17));
        assert_eq!(member_ordinal("web1"), None);
        assert_eq!(member_ordinal("server"), None);
        assert_eq!(member_ordinal("serverx"), None);
    }

    #[test]
    fn test_commit_outcome_ensure_success() {
        assert!(CommitOutcome::success().ensure_success().is_ok());

        let err = CommitOutcome::failure("reload failed")
            .ensure_success()
            .unwrap_err();
        assert!(err.to_string().contains("reload failed"));
    }
}
