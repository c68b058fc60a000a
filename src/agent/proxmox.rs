//! Proxmox VE HTTP client for the QEMU guest agent
//!
//! Calls, relative to `https://{host}:{port}/api2/json`:
//!
//! - `GET  /nodes/{node}/qemu/{vmid}/status/current`
//! - `POST /nodes/{node}/qemu/{vmid}/agent/exec`
//! - `GET  /nodes/{node}/qemu/{vmid}/agent/exec-status?pid={pid}`
//!
//! Authentication uses an API token (`PVEAPIToken=user!name=secret`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use std::time::Duration;

use super::{AgentError, GuestAgentClient};
use crate::config::Config;

/// Default shell the sanitized command is handed to
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Proxmox guest agent client
#[derive(Debug, Clone)]
pub struct ProxmoxAgentClient {
    client: reqwest::Client,
    base_url: String,
    shell: String,
    timeout: Duration,
}

impl ProxmoxAgentClient {
    /// Create a client for an API base URL and token credentials
    ///
    /// `base_url` is the API root, e.g. `https://pve1:8006/api2/json`.
    pub fn new(
        base_url: impl Into<String>,
        user: &str,
        token_name: &str,
        token_value: &str,
        verify_ssl: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let token = format!("PVEAPIToken={}!{}={}", user, token_name, token_value);
        let mut auth = HeaderValue::from_str(&token).context("API token contains invalid header characters")?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .context("Failed to build Proxmox HTTP client")?;

        if !verify_ssl {
            tracing::warn!("TLS certificate verification is disabled for the Proxmox API");
        }

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            shell: DEFAULT_SHELL.to_string(),
            timeout,
        })
    }

    /// Create a client from the loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.require_connection()?;

        let client = Self::new(
            config.proxmox.base_url(),
            &config.auth.user,
            &config.auth.token_name,
            &config.auth.token_value,
            config.proxmox.verify_ssl,
            Duration::from_secs(config.proxmox.timeout_secs),
        )?;

        Ok(client.with_shell(config.execution.shell.clone()))
    }

    /// Set the shell used to run submitted commands
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn vm_url(&self, node: &str, vmid: &str, path: &str) -> String {
        format!("{}/nodes/{}/qemu/{}/{}", self.base_url, node, vmid, path)
    }

    /// Request body for `agent/exec`
    ///
    /// The agent spawns the argv directly, so the shell receives the sanitized
    /// command as a single `-c` argument.
    fn exec_body(&self, command: &str) -> Value {
        json!({ "command": [self.shell, "-c", command] })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, AgentError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        tracing::debug!("Proxmox API responded with {}: {}", status, body);

        if !status.is_success() {
            let message = match body.trim() {
                "" => status.canonical_reason().unwrap_or("request failed").to_string(),
                text => text.chars().take(200).collect(),
            };
            return Err(AgentError::Http {
                status: status.as_u16(),
                message,
            });
        }

        unwrap_envelope(&body)
    }
}

/// Strip the `{"data": ...}` envelope from a Proxmox response body
fn unwrap_envelope(body: &str) -> Result<Value, AgentError> {
    let envelope: Value = serde_json::from_str(body)
        .map_err(|e| AgentError::Malformed(format!("invalid JSON from Proxmox API: {}", e)))?;

    match envelope {
        Value::Object(mut map) => map
            .remove("data")
            .ok_or_else(|| AgentError::Malformed("response has no data field".to_string())),
        other => Err(AgentError::Malformed(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

fn map_reqwest_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(e.to_string())
    } else if e.is_connect() {
        AgentError::Unreachable(e.to_string())
    } else if let Some(status) = e.status() {
        AgentError::Http {
            status: status.as_u16(),
            message: e.to_string(),
        }
    } else {
        AgentError::Other(e.to_string())
    }
}

#[async_trait]
impl GuestAgentClient for ProxmoxAgentClient {
    async fn vm_status(&self, node: &str, vmid: &str) -> Result<Value, AgentError> {
        let url = self.vm_url(node, vmid, "status/current");
        tracing::debug!("GET {}", url);
        self.send(self.client.get(url)).await
    }

    async fn submit_command(&self, node: &str, vmid: &str, command: &str) -> Result<Value, AgentError> {
        let url = self.vm_url(node, vmid, "agent/exec");
        tracing::debug!("POST {}", url);
        self.send(self.client.post(url).json(&self.exec_body(command))).await
    }

    async fn exec_status(&self, node: &str, vmid: &str, pid: u64) -> Result<Value, AgentError> {
        let url = format!("{}?pid={}", self.vm_url(node, vmid, "agent/exec-status"), pid);
        tracing::debug!("GET {}", url);
        self.send(self.client.get(url)).await
    }
}
