//! Guest Agent Collaborator
//!
//! The execution coordinator talks to a VM's QEMU guest agent only through the
//! [`GuestAgentClient`] trait, so tests can substitute a scripted agent and other
//! hypervisor APIs can be plugged in.
//!
//! Implementations return the raw JSON payload of each call. Shape checks (status
//! string, PID, exec-status object) belong to the coordinator, which turns a bad shape
//! into a transport error.

use async_trait::async_trait;
use serde_json::Value;

mod models;
mod proxmox;

#[cfg(test)]
pub(crate) mod mock;

pub use models::{parse_pid, ExecStatus, VmStatus};
pub use proxmox::{ProxmoxAgentClient, DEFAULT_SHELL};

/// Typed failure from a guest agent call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("Guest agent endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Guest agent request timed out: {0}")]
    Timeout(String),

    #[error("Proxmox API returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

/// Client for the hypervisor's guest agent endpoints
#[async_trait]
pub trait GuestAgentClient: Send + Sync {
    /// Current VM status payload (`{"status": "running", ...}`)
    async fn vm_status(&self, node: &str, vmid: &str) -> Result<Value, AgentError>;

    /// Start a command inside the guest; payload carries the `pid`
    async fn submit_command(&self, node: &str, vmid: &str, command: &str) -> Result<Value, AgentError>;

    /// Status of a started command (`exited`, `exitcode`, `out-data`, `err-data`)
    async fn exec_status(&self, node: &str, vmid: &str, pid: u64) -> Result<Value, AgentError>;
}
