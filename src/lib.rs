//! vmshell Gateway Library
//!
//! This library provides policy-checked shell command execution inside Proxmox VMs
//! through the QEMU guest agent: command validation, the execution coordinator, the
//! typed error taxonomy and the HTTP API around them.

pub mod agent;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod metrics;
pub mod security;
pub mod server;

pub use error::{GatewayError, GatewayResult};
pub use exec::{ExecutionCoordinator, ExecutionResult};
pub use security::{CommandValidator, PolicyCatalog, SecurityPolicy};
