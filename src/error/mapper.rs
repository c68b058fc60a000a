//! Fallback classification for opaque failures
//!
//! Used only when a lower layer hands back nothing better than a message. Typed
//! agent errors are mapped directly by the execution coordinator.

use super::{BoxError, ErrorKind, GatewayError};

const AUTH_KEYWORDS: &[&str] = &["auth", "login", "credential", "token"];
const PERMISSION_KEYWORDS: &[&str] = &["permission", "access denied", "forbidden", "403"];
const CONNECTION_KEYWORDS: &[&str] = &["connection", "network", "timeout", "unreachable"];
const NOT_FOUND_KEYWORDS: &[&str] = &["not found", "404", "does not exist"];
const UNAVAILABLE_KEYWORDS: &[&str] = &["offline", "stopped", "unavailable", "not running"];

/// Maps opaque errors onto the closed `ErrorKind` taxonomy
pub struct ErrorMapper;

impl ErrorMapper {
    /// Classify an error by case-insensitive keyword matching on its message
    ///
    /// Keyword groups are tried in order (authentication, permission, connection,
    /// not found, unavailable); the first group with a hit wins, otherwise the error
    /// becomes a generic tool error. The original message is kept in context under
    /// `original_error` and the error itself is kept as the source.
    pub fn classify(
        error: impl Into<BoxError>,
        operation: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> GatewayError {
        let error = error.into();
        let original = error.to_string();
        let (kind, message) = Self::categorize(&original, operation);

        let mut mapped = GatewayError::new(kind, message, operation)
            .with_context("original_error", &original);
        if !resource_type.is_empty() {
            mapped = mapped.with_resource(resource_type, resource_id);
        }
        mapped.with_source(error)
    }

    fn categorize(original: &str, operation: &str) -> (ErrorKind, String) {
        let lowered = original.to_lowercase();
        let matches = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

        if matches(AUTH_KEYWORDS) {
            return (
                ErrorKind::Authentication,
                format!("Authentication failed during {}", operation),
            );
        }
        if matches(PERMISSION_KEYWORDS) {
            return (
                ErrorKind::Permission,
                format!("Permission denied for {}", operation),
            );
        }
        if matches(CONNECTION_KEYWORDS) {
            return (
                ErrorKind::Connection,
                format!("Connection failed during {}", operation),
            );
        }
        if matches(NOT_FOUND_KEYWORDS) {
            return (
                ErrorKind::NotFound,
                format!("Resource not found during {}", operation),
            );
        }
        if let Some(keyword) = UNAVAILABLE_KEYWORDS.iter().find(|k| lowered.contains(*k)) {
            return (
                ErrorKind::ResourceUnavailable {
                    reason: keyword.replace(' ', "_"),
                },
                format!("Resource unavailable during {}", operation),
            );
        }

        (ErrorKind::Tool, format!("Operation failed: {}", operation))
    }
}
