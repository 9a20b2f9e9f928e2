//! HAProxy Data Plane API v2 client.
//!
//! Implements `ProxyClient` over HTTP against the proxy's management
//! endpoint: basic auth, JSON payloads, a bounded timeout on every request.
//! Transaction semantics (versioned open, atomic apply) are enforced by the
//! Data Plane API itself; this client maps its status codes onto the
//! `ProxyError` taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ScalerConfig;
use crate::error::ProxyError;

use super::{
    BackendSpec, BindSpec, CommitOutcome, FrontendSpec, MemberSpec, ProxyClient, TransactionId,
};

/// `GET /services/haproxy/configuration/raw` response (version field only).
#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(rename = "_version")]
    version: u64,
}

/// `POST /services/haproxy/transactions` response.
#[derive(Debug, Deserialize)]
struct TransactionCreated {
    id: String,
}

/// `PUT /services/haproxy/transactions/{id}` response.
#[derive(Debug, Deserialize)]
struct TransactionApplied {
    #[serde(default)]
    status: Option<String>,
}

/// Paged collection wrapper the v2 configuration endpoints return.
#[derive(Debug, Deserialize)]
struct ServerCollection {
    #[serde(default)]
    data: Vec<ServerRecord>,
}

#[derive(Debug, Deserialize)]
struct ServerRecord {
    name: String,
}

/// Server (backend member) payload.
#[derive(Debug, Serialize)]
struct ServerPayload<'a> {
    name: &'a str,
    address: &'a str,
    port: u16,
    check: &'static str,
    maxconn: u32,
}

#[derive(Debug, Serialize)]
struct BalancePayload<'a> {
    algorithm: &'a str,
}

#[derive(Debug, Serialize)]
struct HttpChkPayload<'a> {
    method: &'a str,
    uri: &'a str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct BackendPayload<'a> {
    name: &'a str,
    mode: &'static str,
    balance: BalancePayload<'a>,
    httpchk: HttpChkPayload<'a>,
}

#[derive(Debug, Serialize)]
struct StatsOptionsPayload<'a> {
    stats_uri_prefix: &'a str,
}

#[derive(Debug, Serialize)]
struct FrontendPayload<'a> {
    name: &'a str,
    mode: &'static str,
    default_backend: &'a str,
    maxconn: u32,
    stats_options: StatsOptionsPayload<'a>,
}

#[derive(Debug, Serialize)]
struct BindPayload<'a> {
    name: &'a str,
    address: &'a str,
    port: u16,
}

/// HTTP client for the HAProxy Data Plane API.
pub struct DataPlaneClient {
    /// Base URL including the version prefix, e.g. `http://localhost:5555/v2`.
    base_url: String,
    user: String,
    password: String,
    http_client: Client,
}

impl DataPlaneClient {
    /// Creates a client from the scaler configuration.
    pub fn new(config: &ScalerConfig) -> Self {
        Self::with_timeout(
            &config.dataplane_url,
            &config.dataplane_user,
            &config.dataplane_password,
            config.request_timeout,
        )
    }

    /// Creates a client with an explicit endpoint and timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            user: user.into(),
            password: password.into(),
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .get(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .post(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
    }

    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .put(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .delete(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
    }
}

/// Maps a transport-level failure onto the error taxonomy.
fn transport_error(err: reqwest::Error) -> ProxyError {
    if err.is_decode() {
        ProxyError::InvalidResponse(err.to_string())
    } else {
        ProxyError::Unreachable(err.to_string())
    }
}

/// Reads the response body for error detail, swallowing read failures.
async fn body_detail(response: Response) -> String {
    response.text().await.unwrap_or_default()
}

#[async_trait]
impl ProxyClient for DataPlaneClient {
    async fn list_members(&self, backend: &str) -> Result<Vec<String>, ProxyError> {
        let response = self
            .get("/services/haproxy/configuration/servers")
            .query(&[("backend", backend)])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(ProxyError::InvalidResponse(format!(
                "listing members of '{backend}' returned {}",
                response.status()
            )));
        }

        let collection: ServerCollection = response.json().await.map_err(transport_error)?;
        Ok(collection.data.into_iter().map(|s| s.name).collect())
    }

    async fn current_version(&self) -> Result<u64, ProxyError> {
        let response = self
            .get("/services/haproxy/configuration/raw")
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(ProxyError::InvalidResponse(format!(
                "version read returned {}",
                response.status()
            )));
        }

        let raw: RawConfiguration = response
            .json()
            .await
            .map_err(|e| ProxyError::InvalidResponse(format!("missing _version field: {e}")))?;
        Ok(raw.version)
    }

    async fn begin_transaction(&self, version: u64) -> Result<TransactionId, ProxyError> {
        let response = self
            .post("/services/haproxy/transactions")
            .query(&[("version", version)])
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            // 409: another actor committed between our read and this open.
            StatusCode::CONFLICT => Err(ProxyError::StaleVersion { requested: version }),
            status if status.is_success() => {
                let created: TransactionCreated =
                    response.json().await.map_err(transport_error)?;
                Ok(TransactionId::new(created.id))
            }
            status => Err(ProxyError::InvalidResponse(format!(
                "transaction open returned {status}: {}",
                body_detail(response).await
            ))),
        }
    }

    async fn add_member(
        &self,
        tx: &TransactionId,
        backend: &str,
        member: &MemberSpec,
    ) -> Result<(), ProxyError> {
        let payload = ServerPayload {
            name: &member.name,
            address: &member.address,
            port: member.port,
            check: if member.check { "enabled" } else { "disabled" },
            maxconn: member.maxconn,
        };

        let response = self
            .post("/services/haproxy/configuration/servers")
            .query(&[("backend", backend), ("transaction_id", tx.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(ProxyError::DuplicateMember(member.name.clone())),
            StatusCode::NOT_FOUND => Err(ProxyError::UnknownTransaction(tx.to_string())),
            status => Err(ProxyError::InvalidResponse(format!(
                "member add returned {status}: {}",
                body_detail(response).await
            ))),
        }
    }

    async fn remove_member(
        &self,
        tx: &TransactionId,
        backend: &str,
        name: &str,
    ) -> Result<(), ProxyError> {
        let response = self
            .delete(&format!("/services/haproxy/configuration/servers/{name}"))
            .query(&[("backend", backend), ("transaction_id", tx.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProxyError::MissingMember(name.to_string())),
            status => Err(ProxyError::InvalidResponse(format!(
                "member removal returned {status}: {}",
                body_detail(response).await
            ))),
        }
    }

    async fn create_backend(
        &self,
        tx: &TransactionId,
        backend: &BackendSpec,
    ) -> Result<(), ProxyError> {
        let payload = BackendPayload {
            name: &backend.name,
            mode: "http",
            balance: BalancePayload {
                algorithm: &backend.balance_algorithm,
            },
            httpchk: HttpChkPayload {
                method: &backend.httpchk_method,
                uri: &backend.httpchk_uri,
                version: "HTTP/1.0",
            },
        };

        let response = self
            .post("/services/haproxy/configuration/backends")
            .query(&[("transaction_id", tx.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProxyError::UnknownTransaction(tx.to_string())),
            status => Err(ProxyError::InvalidResponse(format!(
                "backend creation returned {status}: {}",
                body_detail(response).await
            ))),
        }
    }

    async fn create_frontend(
        &self,
        tx: &TransactionId,
        frontend: &FrontendSpec,
    ) -> Result<(), ProxyError> {
        let payload = FrontendPayload {
            name: &frontend.name,
            mode: "http",
            default_backend: &frontend.default_backend,
            maxconn: frontend.maxconn,
            stats_options: StatsOptionsPayload {
                stats_uri_prefix: &frontend.stats_uri_prefix,
            },
        };

        let response = self
            .post("/services/haproxy/configuration/frontends")
            .query(&[("transaction_id", tx.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProxyError::UnknownTransaction(tx.to_string())),
            status => Err(ProxyError::InvalidResponse(format!(
                "frontend creation returned {status}: {}",
                body_detail(response).await
            ))),
        }
    }

    async fn create_bind(
        &self,
        tx: &TransactionId,
        frontend: &str,
        bind: &BindSpec,
    ) -> Result<(), ProxyError> {
        let payload = BindPayload {
            name: &bind.name,
            address: &bind.address,
            port: bind.port,
        };

        let response = self
            .post("/services/haproxy/configuration/binds")
            .query(&[("frontend", frontend), ("transaction_id", tx.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProxyError::UnknownTransaction(tx.to_string())),
            status => Err(ProxyError::InvalidResponse(format!(
                "bind creation returned {status}: {}",
                body_detail(response).await
            ))),
        }
    }

    async fn commit(&self, tx: &TransactionId) -> Result<CommitOutcome, ProxyError> {
        let response = self
            .put(&format!("/services/haproxy/transactions/{}", tx.as_str()))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ProxyError::UnknownTransaction(tx.to_string())),
            status if status.is_success() => {
                let applied: TransactionApplied = response.json().await.map_err(transport_error)?;
                match applied.status.as_deref() {
                    Some("success") | Some("in_progress") => Ok(CommitOutcome::success()),
                    Some(other) => Ok(CommitOutcome::failure(format!(
                        "transaction status '{other}'"
                    ))),
                    None => Ok(CommitOutcome::failure("response carried no status")),
                }
            }
            status => Ok(CommitOutcome::failure(format!(
                "commit returned {status}: {}",
                body_detail(response).await
            ))),
        }
    }

    async fn abandon(&self, tx: &TransactionId) -> Result<(), ProxyError> {
        let response = self
            .delete(&format!("/services/haproxy/transactions/{}", tx.as_str()))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProxyError::UnknownTransaction(tx.to_string())),
            status => Err(ProxyError::InvalidResponse(format!(
                "transaction abandon returned {status}",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_path_onto_base() {
        let client = DataPlaneClient::with_timeout(
            "http://localhost:5555/v2",
            "dataplaneapi",
            "admin",
            Duration::from_secs(5),
        );
        assert_eq!(
            client.url("/services/haproxy/configuration/raw"),
            "http://localhost:5555/v2/services/haproxy/configuration/raw"
        );
    }

    #[test]
    fn test_server_payload_wire_format() {
        let member = MemberSpec::for_worker("server2", 5002, 30);
        let payload = ServerPayload {
            name: &member.name,
            address: &member.address,
            port: member.port,
            check: "enabled",
            maxconn: member.maxconn,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["name"], "server2");
        assert_eq!(json["address"], "localhost");
        assert_eq!(json["port"], 5002);
        assert_eq!(json["check"], "enabled");
        assert_eq!(json["maxconn"], 30);
    }

    #[test]
    fn test_version_field_deserialization() {
        let raw: RawConfiguration = serde_json::from_str(r#"{"_version": 12, "data": ""}"#).unwrap();
        assert_eq!(raw.version, 12);

        let missing = serde_json::from_str::<RawConfiguration>(r#"{"data": ""}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_server_collection_deserialization() {
        let collection: ServerCollection = serde_json::from_str(
            r#"{"_version": 3, "data": [{"name": "server0", "address": "localhost", "port": 5000}]}"#,
        )
        .unwrap();
        assert_eq!(collection.data.len(), 1);
        assert_eq!(collection.data[0].name, "server0");
    }
}
