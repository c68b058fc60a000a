// Gateway Error Types
//
// Every failure leaving the gateway is a `GatewayError`: a closed classification
// (`ErrorKind`) plus the operation and resource it happened on, a redacted context
// map and the underlying cause.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::security::{SecurityPolicy, SecurityViolation, ViolationKind};

mod mapper;

pub use mapper::ErrorMapper;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed underlying cause
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Context values longer than this are truncated
pub const MAX_CONTEXT_VALUE_LEN: usize = 100;

/// Placeholder stored instead of sensitive values
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYWORDS: &[&str] = &["password", "token", "secret", "key", "credential", "auth"];

/// Classification of a gateway failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Command refused by the validator
    Security {
        violation: ViolationKind,
        policy: SecurityPolicy,
    },

    /// VM not running or guest agent not reachable inside it
    ResourceUnavailable { reason: String },

    /// Malformed or missing response from the guest agent
    Transport,

    /// Remote command did not report completion in time
    Timeout { elapsed: Duration, attempts: u32 },

    /// Local wait cancelled by the caller
    Cancelled,

    /// Caller-supplied identifier or parameter rejected
    InvalidInput { field: String },

    Authentication,
    Permission,
    Connection,
    NotFound,

    /// Anything that matched no other category
    Tool,
}

impl ErrorKind {
    /// Stable name used in reports and metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Security { .. } => "security_violation",
            Self::ResourceUnavailable { .. } => "resource_unavailable",
            Self::Transport => "transport_error",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Authentication => "authentication_error",
            Self::Permission => "permission_error",
            Self::Connection => "connection_error",
            Self::NotFound => "not_found",
            Self::Tool => "tool_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.error_type())
    }
}

/// Check if a context key names sensitive data
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|keyword| key.contains(keyword))
}

/// Key/value context attached to an error
///
/// Values under sensitive keys are replaced by `[REDACTED]` on insertion, and every
/// other value is truncated to `MAX_CONTEXT_VALUE_LEN` characters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ErrorContext(BTreeMap<String, String>);

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        let key = key.into();
        let value = if is_sensitive_key(&key) {
            REDACTED.to_string()
        } else {
            truncate(&value.to_string())
        };
        self.0.insert(key, value);
    }

    /// Insert a value that must never be reported, whatever its key
    pub fn insert_redacted(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), REDACTED.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn truncate(value: &str) -> String {
    if value.chars().count() > MAX_CONTEXT_VALUE_LEN {
        value.chars().take(MAX_CONTEXT_VALUE_LEN).collect()
    } else {
        value.to_string()
    }
}

/// Typed gateway error
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    pub operation: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub context: ErrorContext,
    #[source]
    source: Option<BoxError>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let mut context = ErrorContext::new();
        if !operation.is_empty() {
            context.insert("operation", &operation);
        }

        Self {
            kind,
            message: message.into(),
            operation,
            resource_type: None,
            resource_id: None,
            context,
            source: None,
        }
    }

    /// Attach the resource the operation targeted
    pub fn with_resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        self.context.insert("resource_type", &resource_type);
        self.context.insert("resource_id", &resource_id);
        self.resource_type = Some(resource_type);
        self.resource_id = Some(resource_id);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.insert(key, value);
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Create a security error from a validator rejection
    ///
    /// The offending command is recorded in context unless `redact_command` is set.
    pub fn security(violation: SecurityViolation, operation: impl Into<String>, redact_command: bool) -> Self {
        let mut err = Self::new(
            ErrorKind::Security {
                violation: violation.kind,
                policy: violation.policy,
            },
            format!("Security violation: {}", violation.message),
            operation,
        )
        .with_context("violation_type", violation.kind)
        .with_context("policy", violation.policy);

        if redact_command {
            err.context.insert_redacted("command");
        } else {
            err.context.insert("command", &violation.command);
        }

        err.with_source(violation)
    }

    /// Create a resource-unavailable error
    pub fn resource_unavailable(
        reason: impl Into<String>,
        message: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorKind::ResourceUnavailable {
                reason: reason.clone(),
            },
            message,
            operation,
        )
        .with_context("reason", reason)
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message, operation)
    }

    /// Create a timeout error
    pub fn timeout(elapsed: Duration, attempts: u32, operation: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Timeout { elapsed, attempts },
            format!(
                "Command did not complete within {:.1}s ({} status polls)",
                elapsed.as_secs_f64(),
                attempts
            ),
            operation,
        )
        .with_context("elapsed_ms", elapsed.as_millis())
        .with_context("attempts", attempts)
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, "Operation cancelled by caller", operation)
    }

    /// Create an invalid-input error
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(
            ErrorKind::InvalidInput {
                field: field.clone(),
            },
            message,
            "validate_input",
        )
        .with_context("field", field)
    }

    /// Check if this error is worth retrying locally
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport | ErrorKind::Connection)
    }

    pub fn error_type(&self) -> &'static str {
        self.kind.error_type()
    }

    /// Serializable view for logs and API responses
    pub fn report(&self) -> ErrorReport {
        let resource = match (&self.resource_type, &self.resource_id) {
            (Some(kind), Some(id)) => Some(format!("{}/{}", kind, id)),
            (Some(kind), None) => Some(kind.clone()),
            _ => None,
        };

        ErrorReport {
            error_type: self.error_type().to_string(),
            message: self.message.clone(),
            operation: self.operation.clone(),
            resource,
            context: self.context.clone(),
            cause: self.source.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Serializable error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub error_type: String,
    pub message: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub context: ErrorContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn violation() -> SecurityViolation {
        SecurityViolation {
            kind: ViolationKind::Blacklisted,
            message: "Command 'rm' is globally blacklisted".to_string(),
            command: "rm -rf /".to_string(),
            policy: SecurityPolicy::Standard,
        }
    }

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("api_token"));
        assert!(is_sensitive_key("X-Secret-Value"));
        assert!(is_sensitive_key("ssh_key"));
        assert!(is_sensitive_key("Authorization"));
        assert!(!is_sensitive_key("command"));
        assert!(!is_sensitive_key("resource_id"));
    }

    #[test]
    fn test_context_redacts_and_truncates() {
        let mut context = ErrorContext::new();
        context.insert("token_value", "abc-123");
        context.insert("output", "x".repeat(250));
        context.insert("node", "pve1");

        assert_eq!(context.get("token_value"), Some(REDACTED));
        assert_eq!(context.get("output").unwrap().len(), MAX_CONTEXT_VALUE_LEN);
        assert_eq!(context.get("node"), Some("pve1"));
        assert_eq!(context.len(), 3);
    }

    #[test]
    fn test_security_error_carries_violation() {
        let err = GatewayError::security(violation(), "execute_command", false);

        assert_eq!(
            err.kind,
            ErrorKind::Security {
                violation: ViolationKind::Blacklisted,
                policy: SecurityPolicy::Standard,
            }
        );
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("globally blacklisted"));
        assert_eq!(err.context.get("violation_type"), Some("blacklisted_command"));
        assert_eq!(err.context.get("policy"), Some("standard"));
        assert_eq!(err.context.get("command"), Some("rm -rf /"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_security_error_redacts_command() {
        let err = GatewayError::security(violation(), "execute_command", true);
        assert_eq!(err.context.get("command"), Some(REDACTED));
    }

    #[test]
    fn test_is_retryable() {
        assert!(GatewayError::transport("bad response", "exec").is_retryable());
        assert!(GatewayError::new(ErrorKind::Connection, "refused", "exec").is_retryable());

        assert!(!GatewayError::resource_unavailable("not_running", "VM is stopped", "exec").is_retryable());
        assert!(!GatewayError::new(ErrorKind::Authentication, "denied", "exec").is_retryable());
        assert!(!GatewayError::timeout(Duration::from_secs(5), 3, "exec").is_retryable());
        assert!(!GatewayError::cancelled("exec").is_retryable());
    }

    #[test]
    fn test_report() {
        let err = GatewayError::resource_unavailable("not_running", "VM 101 is stopped", "execute_command")
            .with_resource("vm", "101")
            .with_context("node", "pve1")
            .with_source(std::io::Error::other("status: stopped"));

        let report = err.report();
        assert_eq!(report.error_type, "resource_unavailable");
        assert_eq!(report.resource.as_deref(), Some("vm/101"));
        assert_eq!(report.cause.as_deref(), Some("status: stopped"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["context"]["reason"], "not_running");
        assert_eq!(json["context"]["resource_id"], "101");
        assert_eq!(json["operation"], "execute_command");
    }

    #[test]
    fn test_display_and_source_chain() {
        let err = GatewayError::transport("Invalid response from exec-status", "poll_command_status")
            .with_source(std::io::Error::other("unexpected EOF"));
        assert_eq!(err.to_string(), "Invalid response from exec-status");
        assert_eq!(err.source().map(|e| e.to_string()).as_deref(), Some("unexpected EOF"));

        let without = GatewayError::cancelled("exec");
        assert!(without.source().is_none());
    }

    #[test]
    fn test_report_omits_missing_fields() {
        let json = serde_json::to_value(GatewayError::cancelled("exec").report()).unwrap();
        assert!(json.get("resource").is_none());
        assert!(json.get("cause").is_none());
    }

    #[test]
    fn test_timeout_message() {
        let err = GatewayError::timeout(Duration::from_millis(2500), 4, "poll_status");
        assert_eq!(err.error_type(), "timeout");
        assert!(err.to_string().contains("2.5s"));
        assert_eq!(err.context.get("attempts"), Some("4"));
    }

    #[test]
    fn test_invalid_input() {
        let err = GatewayError::invalid_input("vmid", "VM id must be numeric");
        assert_eq!(
            err.kind,
            ErrorKind::InvalidInput {
                field: "vmid".to_string()
            }
        );
        assert_eq!(err.context.get("field"), Some("vmid"));
    }
}
