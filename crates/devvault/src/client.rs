//! Store client - administrative calls against the store's HTTP API
//!
//! Transport failures never escape this module as raw HTTP errors: every
//! call returns a [`StoreError`] that says what kind of trouble it was
//! (unreachable, sealed, missing, refused, malformed).

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// One KV secret: field name -> value
pub type SecretDocument = BTreeMap<String, Value>;

/// Mount the KV v2 engine lives at
pub const KV_MOUNT: &str = "secret";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("store is sealed - unseal it before reading or writing secrets")]
    Sealed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied (check the token): {0}")]
    PermissionDenied(String),

    #[error("store returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response from {endpoint}: {reason}")]
    Decode {
        endpoint: &'static str,
        reason: String,
    },
}

impl StoreError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Seal state as reported by `sys/seal-status` and `sys/unseal`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    /// Shares accepted towards the current unseal attempt
    pub progress: u32,
    /// Shares required (`t`)
    pub threshold: u32,
    /// Shares issued (`n`)
    pub shares: u32,
}

/// `sys/health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub initialized: bool,
    pub sealed: bool,
    pub version: Option<String>,
}

/// Key material returned exactly once by `sys/init`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitResponse {
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

#[derive(Debug, Deserialize)]
struct SealStatusResponse {
    initialized: bool,
    sealed: bool,
    #[serde(default)]
    progress: u32,
    t: u32,
    n: u32,
}

impl From<SealStatusResponse> for SealStatus {
    fn from(r: SealStatusResponse) -> Self {
        Self {
            initialized: r.initialized,
            sealed: r.sealed,
            progress: r.progress,
            threshold: r.t,
            shares: r.n,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    initialized: bool,
    sealed: bool,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Debug, Deserialize)]
struct KvReadData {
    data: Option<SecretDocument>,
}

#[derive(Debug, Deserialize)]
struct KvListResponse {
    data: KvListData,
}

#[derive(Debug, Deserialize)]
struct KvListData {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// Administrative operations the lifecycle tooling needs from a store.
///
/// Implemented over HTTP by [`VaultClient`]; tests use an in-memory fake.
pub trait StoreApi {
    fn health(&self) -> Result<HealthStatus, StoreError>;
    fn seal_status(&self) -> Result<SealStatus, StoreError>;
    fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse, StoreError>;
    fn unseal(&self, key: &str) -> Result<SealStatus, StoreError>;
    /// Immediate children of `prefix`; folders end with `/`
    fn list_secrets(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn read_secret(&self, path: &str) -> Result<SecretDocument, StoreError>;
    fn write_secret(&self, path: &str, doc: &SecretDocument) -> Result<(), StoreError>;
    /// Mount KV v2 at `secret/`; `Ok(false)` when it is already mounted
    fn enable_kv(&self) -> Result<bool, StoreError>;
    fn set_token(&mut self, token: &str);

    /// Reachable means the API answered at all, whatever its seal state
    fn is_reachable(&self) -> bool {
        self.health().is_ok()
    }
}

/// Blocking HTTP client for a Vault-compatible store
pub struct VaultClient {
    http: Client,
    addr: String,
    token: Option<String>,
}

impl VaultClient {
    pub fn new(addr: &str, timeout: Duration) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            addr: addr.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1/{}", self.addr, path.trim_start_matches('/'));
        let mut request = self.http.request(method, url);
        if let Some(ref token) = self.token {
            request = request.header("X-Vault-Token", token);
        }
        request
    }

    fn send(&self, request: RequestBuilder, endpoint: &'static str) -> Result<Response, StoreError> {
        debug!("store request: {}", endpoint);
        request
            .send()
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }

    /// Map non-success statuses onto typed errors
    fn check(response: Response, subject: &str) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: ErrorResponse = response.json().unwrap_or_default();
        let message = body.errors.join("; ");

        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(subject.to_string()),
            StatusCode::FORBIDDEN => StoreError::PermissionDenied(subject.to_string()),
            StatusCode::SERVICE_UNAVAILABLE => StoreError::Sealed,
            _ => StoreError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    fn decode<T: DeserializeOwned>(response: Response, endpoint: &'static str) -> Result<T, StoreError> {
        let text = response
            .text()
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        decode_body(&text, endpoint)
    }
}

fn decode_body<T: DeserializeOwned>(text: &str, endpoint: &'static str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Decode {
        endpoint,
        reason: e.to_string(),
    })
}

impl StoreApi for VaultClient {
    fn health(&self) -> Result<HealthStatus, StoreError> {
        // Every health status code (200, 429, 472, 473, 501, 503) carries the same body
        let response = self.send(self.request(Method::GET, "sys/health"), "sys/health")?;
        let body: HealthResponse = Self::decode(response, "sys/health")?;
        Ok(HealthStatus {
            initialized: body.initialized,
            sealed: body.sealed,
            version: body.version,
        })
    }

    fn seal_status(&self) -> Result<SealStatus, StoreError> {
        let response = self.send(self.request(Method::GET, "sys/seal-status"), "sys/seal-status")?;
        let response = Self::check(response, "sys/seal-status")?;
        let body: SealStatusResponse = Self::decode(response, "sys/seal-status")?;
        Ok(body.into())
    }

    fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse, StoreError> {
        let request = self
            .request(Method::PUT, "sys/init")
            .json(&json!({ "secret_shares": shares, "secret_threshold": threshold }));
        let response = Self::check(self.send(request, "sys/init")?, "sys/init")?;
        Self::decode(response, "sys/init")
    }

    fn unseal(&self, key: &str) -> Result<SealStatus, StoreError> {
        let request = self
            .request(Method::PUT, "sys/unseal")
            .json(&json!({ "key": key }));
        let response = Self::check(self.send(request, "sys/unseal")?, "sys/unseal")?;
        let body: SealStatusResponse = Self::decode(response, "sys/unseal")?;
        Ok(body.into())
    }

    fn list_secrets(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let path = format!("{}/metadata/{}", KV_MOUNT, prefix.trim_matches('/'));
        let request = self
            .request(Method::GET, &path)
            .query(&[("list", "true")]);

        match Self::check(self.send(request, "secret/metadata")?, prefix) {
            Ok(response) => {
                let body: KvListResponse = Self::decode(response, "secret/metadata")?;
                Ok(body.data.keys)
            }
            // An empty folder lists as 404
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn read_secret(&self, path: &str) -> Result<SecretDocument, StoreError> {
        let url = format!("{}/data/{}", KV_MOUNT, path);
        let response = Self::check(self.send(self.request(Method::GET, &url), "secret/data")?, path)?;
        let body: KvReadResponse = Self::decode(response, "secret/data")?;
        // Deleted versions come back with `data: null`
        body.data
            .data
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn write_secret(&self, path: &str, doc: &SecretDocument) -> Result<(), StoreError> {
        let url = format!("{}/data/{}", KV_MOUNT, path);
        let request = self
            .request(Method::POST, &url)
            .json(&json!({ "data": doc }));
        Self::check(self.send(request, "secret/data")?, path)?;
        Ok(())
    }

    fn enable_kv(&self) -> Result<bool, StoreError> {
        let path = format!("sys/mounts/{}", KV_MOUNT);
        let request = self
            .request(Method::POST, &path)
            .json(&json!({ "type": "kv", "options": { "version": "2" } }));

        match Self::check(self.send(request, "sys/mounts")?, &path) {
            Ok(_) => Ok(true),
            Err(StoreError::Api { status: 400, message }) if message.contains("already in use") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn set_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }
}
