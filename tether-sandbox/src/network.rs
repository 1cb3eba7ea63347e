//! Outbound network access for plugins.

use crate::{Result, SandboxError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Width of the rolling request-rate window.
pub const NETWORK_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl NetworkRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            body: Some(body),
            ..Self::get(url)
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl NetworkResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Host transport the network facade delegates to once a request has
/// passed capability, host and rate checks.
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse>;
}

/// Refuses every request. Used when the host wires no transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTransport;

#[async_trait]
impl NetworkTransport for DisabledTransport {
    async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse> {
        Err(SandboxError::Network(format!(
            "network transport disabled, refusing {} {}",
            request.method, request.url
        )))
    }
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Tether/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SandboxError::Network(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkTransport for ReqwestTransport {
    async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| SandboxError::Network(format!("invalid method: {e}")))?;
        debug!(method = %method, url = %request.url, "Outbound plugin request");

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| SandboxError::Network(format!("fetch failed: {e}")))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| SandboxError::Network(format!("read body: {e}")))?
            .to_vec();

        Ok(NetworkResponse {
            status,
            headers,
            body,
        })
    }
}
