//! Command Execution Coordinator
//!
//! Drives one command through its lifecycle:
//!
//! ```text
//! Validating -> VmCheck -> Submitted -> Polling -> Completed
//!      \           \           \           \
//!       +-----------+-----------+-----------+--> Failed
//! ```
//!
//! - **Validating**: the command validator must accept the command; violations are
//!   never retried
//! - **VmCheck**: the VM must report `running` before anything is submitted
//! - **Submitted**: the guest agent must return a numeric PID
//! - **Polling**: `exec-status` is queried until the process exits, the poll bounds are
//!   hit, or the caller cancels
//!
//! Every failure leaves as a [`GatewayError`] carrying the operation, the VM, the node
//! and the stage that failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::{parse_pid, AgentError, ExecStatus, GuestAgentClient, VmStatus};
use crate::error::{ErrorKind, ErrorMapper, GatewayError, GatewayResult, REDACTED};
use crate::metrics::GatewayMetrics;
use crate::security::CommandValidator;

mod poll;
mod retry;

pub use poll::{poll_until_exited, PollConfig, PollFailure, PollOutcome};
pub use retry::{retry_with_backoff, should_retry_status, RetryConfig};

/// Operation name reported for failed executions
pub const EXECUTE_OPERATION: &str = "execute_vm_command";

/// Commands longer than this are shortened in error context
const COMMAND_PREVIEW_LEN: usize = 50;

/// Exit code reported for a process killed by signal N is this plus N
const SIGNAL_EXIT_BASE: i64 = 128;

/// Exit code reported when an exited process carries neither code nor signal
const MISSING_EXIT_CODE: i64 = -1;

/// Lifecycle stage of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Validating,
    VmCheck,
    Submitted,
    Polling,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::VmCheck => "vm_check",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One caller request to run a command in a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub node: String,
    pub vmid: String,
    pub command: String,
}

impl ExecutionRequest {
    /// Create a request after checking the node and VM identifiers
    ///
    /// Identifiers end up in API paths, so only plain node names and numeric VM ids
    /// are accepted.
    pub fn new(node: impl Into<String>, vmid: impl Into<String>, command: impl Into<String>) -> GatewayResult<Self> {
        let node = node.into();
        let vmid = vmid.into();
        validate_node(&node)?;
        validate_vmid(&vmid)?;

        Ok(Self {
            id: Uuid::new_v4(),
            node,
            vmid,
            command: command.into(),
        })
    }
}

/// Check a Proxmox node name (`[A-Za-z0-9][A-Za-z0-9.-]*`, at most 63 characters)
pub fn validate_node(node: &str) -> GatewayResult<()> {
    let mut chars = node.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && node.len() <= 63
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(GatewayError::invalid_input("node", format!("Invalid node name '{}'", node)))
    }
}

/// Check a VM id (decimal digits only)
pub fn validate_vmid(vmid: &str) -> GatewayResult<()> {
    if !vmid.is_empty() && vmid.len() <= 10 && vmid.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(GatewayError::invalid_input(
            "vmid",
            format!("Invalid VM id '{}': must be numeric", vmid),
        ))
    }
}

/// A command accepted by the guest agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionHandle {
    pub pid: u64,
    pub node: String,
    pub vmid: String,
    pub submitted_at: DateTime<Utc>,
}

/// Final result of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: i64,
    /// Whether the agent reported the process as exited
    pub exited: bool,
    /// Signal that terminated the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i64>,
}

/// Coordinator behaviour knobs
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub poll: PollConfig,

    /// Retries for VM status and exec-status queries
    pub transport_retry: RetryConfig,

    /// Retries for command submission
    ///
    /// A retried submission can start the command twice, so this defaults to a
    /// single attempt.
    pub submit_retry: RetryConfig,

    /// Report `success = false` when the exit code is nonzero
    pub nonzero_exit_is_failure: bool,

    /// Keep the command text out of errors and logs
    pub redact_commands: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            transport_retry: RetryConfig::default(),
            submit_retry: RetryConfig::no_retry(),
            nonzero_exit_is_failure: true,
            redact_commands: false,
        }
    }
}

/// Runs validated commands inside VMs through the guest agent
#[derive(Clone)]
pub struct ExecutionCoordinator {
    agent: Arc<dyn GuestAgentClient>,
    validator: CommandValidator,
    settings: ExecutionSettings,
    metrics: Option<GatewayMetrics>,
}

impl ExecutionCoordinator {
    pub fn new(agent: Arc<dyn GuestAgentClient>, validator: CommandValidator) -> Self {
        Self {
            agent,
            validator,
            settings: ExecutionSettings::default(),
            metrics: None,
        }
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Execute a command, waiting without a cancellation source
    pub async fn execute(&self, node: &str, vmid: &str, command: &str) -> GatewayResult<ExecutionResult> {
        let request = ExecutionRequest::new(node, vmid, command)?;
        self.execute_request(&request, &CancellationToken::new()).await
    }

    /// Execute a request; cancelling `cancel` ends the local wait only
    pub async fn execute_request(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<ExecutionResult> {
        let span = tracing::info_span!(
            "execution",
            request_id = %request.id,
            node = %request.node,
            vmid = %request.vmid,
            policy = %self.validator.policy(),
        );

        let started = Instant::now();
        let outcome = self.run(request, cancel).instrument(span).await;

        if let Some(metrics) = &self.metrics {
            let status = match &outcome {
                Ok(result) if result.success => "success",
                Ok(_) => "command_failed",
                Err(e) => e.error_type(),
            };
            metrics.record_execution(status, started.elapsed());
        }

        outcome
    }

    async fn run(&self, request: &ExecutionRequest, cancel: &CancellationToken) -> GatewayResult<ExecutionResult> {
        tracing::info!(
            "Executing command on VM {} (node: {}): {}",
            request.vmid,
            request.node,
            self.display_command(&request.command)
        );

        let mut state = ExecutionState::Validating;
        let result = self.advance(request, cancel, &mut state).await;

        match result {
            Ok(result) => {
                transition(&mut state, ExecutionState::Completed);
                tracing::info!(
                    "Command finished on VM {} with exit code {} (success: {})",
                    request.vmid,
                    result.exit_code,
                    result.success
                );
                Ok(result)
            }
            Err(err) => {
                let failed_in = state;
                transition(&mut state, ExecutionState::Failed);
                let err = self.decorate(err, request, failed_in);
                tracing::error!("Command execution failed on VM {} during {}: {}", request.vmid, failed_in, err);
                Err(err)
            }
        }
    }

    async fn advance(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        state: &mut ExecutionState,
    ) -> GatewayResult<ExecutionResult> {
        let sanitized = self.validate(request)?;

        transition(state, ExecutionState::VmCheck);
        ensure_not_cancelled(cancel, "validate_vm_status")?;
        self.check_vm(request).await?;

        transition(state, ExecutionState::Submitted);
        ensure_not_cancelled(cancel, "submit_command")?;
        let handle = self.submit(request, &sanitized).await?;

        transition(state, ExecutionState::Polling);
        let outcome = self.wait_for_exit(&handle, cancel).await?;

        Ok(self.build_result(outcome.status))
    }

    fn validate(&self, request: &ExecutionRequest) -> GatewayResult<String> {
        let validated = self.validator.validate(&request.command);

        if let Some(metrics) = &self.metrics {
            metrics.record_validation(
                self.validator.policy(),
                validated.as_ref().err().map(|v| v.kind),
            );
        }

        match validated {
            Ok(sanitized) => {
                if sanitized != request.command {
                    tracing::info!(
                        "Command sanitized for VM {}: '{}' -> '{}'",
                        request.vmid,
                        self.display_command(&request.command),
                        self.display_command(&sanitized)
                    );
                }
                Ok(sanitized)
            }
            Err(violation) => {
                tracing::error!("Security violation for VM {}: {}", request.vmid, violation);
                Err(GatewayError::security(
                    violation,
                    EXECUTE_OPERATION,
                    self.settings.redact_commands,
                ))
            }
        }
    }

    async fn check_vm(&self, request: &ExecutionRequest) -> GatewayResult<()> {
        let agent = &self.agent;
        let (node, vmid) = (request.node.as_str(), request.vmid.as_str());

        let value = retry_with_backoff(&self.settings.transport_retry, "vm_status", move || async move {
            agent
                .vm_status(node, vmid)
                .await
                .map_err(|e| map_agent_error(e, "validate_vm_status", vmid))
        })
        .await?;

        let status = VmStatus::from_value(&value).map_err(|e| {
            GatewayError::transport(format!("Unexpected VM status response: {}", e), "validate_vm_status")
        })?;

        if !status.is_running() {
            tracing::error!("Failed to execute command on VM {}: VM is not running", vmid);
            return Err(GatewayError::resource_unavailable(
                "vm_not_running",
                format!("VM {} is not available for command execution (status: {})", vmid, status.status),
                "validate_vm_status",
            )
            .with_context("vm_status", &status.status));
        }

        Ok(())
    }

    async fn submit(&self, request: &ExecutionRequest, sanitized: &str) -> GatewayResult<ExecutionHandle> {
        let agent = &self.agent;
        let (node, vmid) = (request.node.as_str(), request.vmid.as_str());

        let value = retry_with_backoff(&self.settings.submit_retry, "submit_command", move || async move {
            agent
                .submit_command(node, vmid, sanitized)
                .await
                .map_err(|e| map_agent_error(e, "submit_command", vmid))
        })
        .await?;

        tracing::debug!("Raw exec response: {}", value);

        let pid = parse_pid(&value).map_err(|message| GatewayError::transport(message, "submit_command"))?;
        tracing::info!("Command started on VM {} with PID {}", vmid, pid);

        Ok(ExecutionHandle {
            pid,
            node: request.node.clone(),
            vmid: request.vmid.clone(),
            submitted_at: Utc::now(),
        })
    }

    async fn wait_for_exit(&self, handle: &ExecutionHandle, cancel: &CancellationToken) -> GatewayResult<PollOutcome> {
        let agent = &self.agent;
        let retry = &self.settings.transport_retry;
        let (node, vmid, pid) = (handle.node.as_str(), handle.vmid.as_str(), handle.pid);

        tracing::info!("Waiting for command completion (PID: {})...", pid);

        let polled = poll_until_exited(&self.settings.poll, cancel, move |attempt| async move {
            tracing::debug!("Getting status for PID {} (poll {})", pid, attempt);
            let value = retry_with_backoff(retry, "exec_status", move || async move {
                agent
                    .exec_status(node, vmid, pid)
                    .await
                    .map_err(|e| map_agent_error(e, "poll_status", vmid))
            })
            .await?;

            tracing::debug!("Raw exec-status response: {}", value);
            ExecStatus::from_value(&value).map_err(|message| {
                GatewayError::transport(format!("Unexpected exec-status response: {}", message), "poll_status")
            })
        })
        .await;

        let attempts = match &polled {
            Ok(outcome) => outcome.attempts,
            Err(PollFailure::Cancelled { attempts }) | Err(PollFailure::Exhausted { attempts, .. }) => *attempts,
            Err(PollFailure::Agent(_)) => 0,
        };
        if let Some(metrics) = &self.metrics {
            if attempts > 0 {
                metrics.record_poll_attempts(attempts);
            }
        }

        polled.map_err(|failure| {
            if let PollFailure::Cancelled { .. } = failure {
                tracing::warn!(
                    "Stopped waiting for PID {} on VM {}; the command keeps running in the guest",
                    pid,
                    vmid
                );
            }
            failure.into_error("poll_status").with_context("pid", pid)
        })
    }

    fn build_result(&self, status: ExecStatus) -> ExecutionResult {
        if status.out_truncated || status.err_truncated {
            tracing::warn!("Guest agent truncated the command output");
        }

        // A process killed by a signal reports no exit code; use the shell convention
        let (exit_code, abnormal) = match (status.exited, status.signal, status.exit_code) {
            (true, Some(signal), _) => {
                tracing::warn!("Command was terminated by signal {}", signal);
                (SIGNAL_EXIT_BASE + signal, true)
            }
            (true, None, None) => {
                tracing::warn!("Guest agent reported an exited process without an exit code");
                (MISSING_EXIT_CODE, true)
            }
            (_, _, code) => (code.unwrap_or(0), false),
        };
        // Abnormal termination fails even when nonzero exit codes are tolerated
        let success = !abnormal && (!self.settings.nonzero_exit_is_failure || exit_code == 0);

        ExecutionResult {
            success,
            output: status.out_data.unwrap_or_default(),
            error: status.err_data.unwrap_or_default(),
            exit_code,
            exited: status.exited,
            signal: status.signal,
        }
    }

    /// Attach VM, node, stage and command context to an outgoing error
    fn decorate(&self, mut err: GatewayError, request: &ExecutionRequest, stage: ExecutionState) -> GatewayError {
        if err.resource_type.is_none() {
            err = err.with_resource("vm", &request.vmid);
        }
        err = err
            .with_context("node", &request.node)
            .with_context("stage", stage)
            .with_context("request_id", request.id);

        if err.context.get("command").is_none() {
            err = err.with_context("command", self.display_command(&request.command));
        }
        err
    }

    fn display_command(&self, command: &str) -> String {
        if self.settings.redact_commands {
            REDACTED.to_string()
        } else {
            preview(command)
        }
    }
}

fn transition(state: &mut ExecutionState, next: ExecutionState) {
    tracing::debug!("Execution state {} -> {}", state, next);
    *state = next;
}

fn ensure_not_cancelled(cancel: &CancellationToken, operation: &str) -> GatewayResult<()> {
    if cancel.is_cancelled() {
        Err(GatewayError::cancelled(operation))
    } else {
        Ok(())
    }
}

fn preview(command: &str) -> String {
    if command.chars().count() > COMMAND_PREVIEW_LEN {
        let head: String = command.chars().take(COMMAND_PREVIEW_LEN).collect();
        format!("{}...", head)
    } else {
        command.to_string()
    }
}

/// Map a typed agent failure onto the gateway taxonomy
///
/// Status codes with a fixed meaning are mapped directly; anything else falls back
/// to message classification.
pub fn map_agent_error(error: AgentError, operation: &str, vmid: &str) -> GatewayError {
    let mapped = match &error {
        AgentError::Unreachable(message) | AgentError::Timeout(message) => GatewayError::new(
            ErrorKind::Connection,
            format!("Connection failed during {}: {}", operation, message),
            operation,
        )
        .with_resource("vm", vmid),
        AgentError::Malformed(message) => {
            GatewayError::transport(format!("Malformed response during {}: {}", operation, message), operation)
                .with_resource("vm", vmid)
        }
        AgentError::Http { status: 401, .. } => {
            GatewayError::new(ErrorKind::Authentication, format!("Authentication failed during {}", operation), operation)
                .with_resource("vm", vmid)
        }
        AgentError::Http { status: 403, .. } => {
            GatewayError::new(ErrorKind::Permission, format!("Permission denied for {}", operation), operation)
                .with_resource("vm", vmid)
        }
        AgentError::Http { status, message } => {
            let classified = ErrorMapper::classify(message.clone(), operation, "vm", vmid);
            if classified.kind == ErrorKind::Tool && should_retry_status(*status) {
                GatewayError::transport(
                    format!("Proxmox API returned HTTP {} during {}", status, operation),
                    operation,
                )
                .with_resource("vm", vmid)
            } else if classified.kind == ErrorKind::Tool && *status == 404 {
                GatewayError::new(ErrorKind::NotFound, format!("Resource not found during {}", operation), operation)
                    .with_resource("vm", vmid)
            } else {
                classified
            }
        }
        AgentError::Other(message) => ErrorMapper::classify(message.clone(), operation, "vm", vmid),
    };

    mapped.with_source(error)
}
