//! Command Validation Module
//!
//! This module turns an untrusted command string into one that is safe to hand to a
//! remote shell verbatim, or rejects it with a typed violation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::policy::{PolicyCatalog, SecurityInfo, SecurityPolicy};

/// Default maximum command length in characters
pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 1000;

/// Kinds of security violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Empty,
    ExcessiveLength,
    InjectionPattern,
    DangerousCharacters,
    InvalidSyntax,
    Blacklisted,
    Unauthorized,
    NoCommand,
}

impl ViolationKind {
    /// Stable code used in logs, metrics and error context
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "empty_command",
            Self::ExcessiveLength => "excessive_length",
            Self::InjectionPattern => "injection_pattern",
            Self::DangerousCharacters => "dangerous_characters",
            Self::InvalidSyntax => "invalid_syntax",
            Self::Blacklisted => "blacklisted_command",
            Self::Unauthorized => "unauthorized_command",
            Self::NoCommand => "no_command",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A command rejected by the validator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SecurityViolation {
    /// What kind of rule blocked the command
    pub kind: ViolationKind,
    /// Human-readable description naming the rule
    pub message: String,
    /// The offending command
    pub command: String,
    /// Policy in force when the command was rejected
    pub policy: SecurityPolicy,
}

/// Command validator bound to one security policy
///
/// Cloning is cheap: the rule catalog is shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    catalog: Arc<PolicyCatalog>,
    policy: SecurityPolicy,
    max_command_length: usize,
}

impl CommandValidator {
    pub fn new(catalog: Arc<PolicyCatalog>, policy: SecurityPolicy) -> Self {
        tracing::info!("VM command security validator initialized with {} policy", policy);
        Self {
            catalog,
            policy,
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
        }
    }

    /// Set the maximum accepted command length (in characters)
    pub fn with_max_command_length(mut self, max_command_length: usize) -> Self {
        self.max_command_length = max_command_length;
        self
    }

    /// Validator sharing this catalog under a different policy
    pub fn with_policy(&self, policy: SecurityPolicy) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
            policy,
            max_command_length: self.max_command_length,
        }
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    pub fn max_command_length(&self) -> usize {
        self.max_command_length
    }

    pub fn catalog(&self) -> &Arc<PolicyCatalog> {
        &self.catalog
    }

    /// Summary of the rules this validator enforces
    pub fn security_info(&self) -> SecurityInfo {
        self.catalog
            .security_info(self.policy, self.max_command_length)
    }

    /// Validate and sanitize a command
    ///
    /// Stages run in order and stop at the first failure:
    ///
    /// 1. Empty or whitespace-only input
    /// 2. Length limit (content-independent)
    /// 3. Injection patterns over the raw text
    /// 4. Dangerous characters (strict policy only)
    /// 5. Shell-aware tokenization
    /// 6. Global blacklist, then the policy whitelist
    /// 7. Re-quoting of every token
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use vmshell_gateway::security::{CommandValidator, PolicyCatalog, SecurityPolicy, ViolationKind};
    ///
    /// let validator = CommandValidator::new(Arc::new(PolicyCatalog::new()), SecurityPolicy::Strict);
    /// let err = validator.validate("mysql -e 'select 1'").unwrap_err();
    /// assert_eq!(err.kind, ViolationKind::Unauthorized);
    /// ```
    pub fn validate(&self, command: &str) -> Result<String, SecurityViolation> {
        if command.trim().is_empty() {
            return Err(self.violation(
                ViolationKind::Empty,
                "Empty or whitespace-only commands are not allowed".to_string(),
                command,
            ));
        }

        self.check_length(command)?;

        let command = command.trim();
        self.check_injection_patterns(command)?;
        self.check_dangerous_characters(command)?;

        let tokens = self.tokenize(command)?;
        self.check_authorization(&tokens)?;

        let sanitized = shell_words::join(&tokens);

        let preview: String = sanitized.chars().take(50).collect();
        tracing::info!("Command validated successfully: {}...", preview);

        Ok(sanitized)
    }

    fn check_length(&self, command: &str) -> Result<(), SecurityViolation> {
        if command.chars().count() > self.max_command_length {
            return Err(self.violation(
                ViolationKind::ExcessiveLength,
                format!(
                    "Command exceeds maximum length of {} characters",
                    self.max_command_length
                ),
                command,
            ));
        }
        Ok(())
    }

    fn check_injection_patterns(&self, command: &str) -> Result<(), SecurityViolation> {
        if let Some(pattern) = self.catalog.first_injection_match(command) {
            tracing::warn!(
                "Blocked command matching injection pattern '{}' ({})",
                pattern.name,
                pattern.pattern()
            );
            return Err(self.violation(
                ViolationKind::InjectionPattern,
                format!(
                    "Command contains potential injection pattern '{}': {}",
                    pattern.name,
                    pattern.pattern()
                ),
                command,
            ));
        }
        Ok(())
    }

    fn check_dangerous_characters(&self, command: &str) -> Result<(), SecurityViolation> {
        if self.policy != SecurityPolicy::Strict {
            return Ok(());
        }

        let found = self.catalog.dangerous_chars_in(command);
        if !found.is_empty() {
            let listed: Vec<String> = found.iter().map(char::to_string).collect();
            return Err(self.violation(
                ViolationKind::DangerousCharacters,
                format!("Command contains dangerous characters: {}", listed.join(", ")),
                command,
            ));
        }
        Ok(())
    }

    fn tokenize(&self, command: &str) -> Result<Vec<String>, SecurityViolation> {
        shell_words::split(command).map_err(|e| {
            self.violation(
                ViolationKind::InvalidSyntax,
                format!("Command contains invalid shell syntax: {}", e),
                command,
            )
        })
    }

    fn check_authorization(&self, tokens: &[String]) -> Result<(), SecurityViolation> {
        let joined = tokens.join(" ");

        let base = match tokens.first() {
            Some(first) if !first.trim().is_empty() => first.to_lowercase(),
            _ => {
                return Err(self.violation(
                    ViolationKind::NoCommand,
                    "No command specified".to_string(),
                    &joined,
                ))
            }
        };
        let phrase = tokens
            .iter()
            .take(2)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        if let Some(blocked) = self.catalog.blacklist_match(&base, &phrase) {
            tracing::warn!("Blocked globally blacklisted command '{}'", blocked);
            return Err(self.violation(
                ViolationKind::Blacklisted,
                format!("Command '{}' is globally blacklisted", blocked),
                &joined,
            ));
        }

        if !self.catalog.is_whitelisted(self.policy, &base, &phrase) {
            return Err(self.violation(
                ViolationKind::Unauthorized,
                format!("Command '{}' is not in the allowed command list", base),
                &joined,
            ));
        }

        Ok(())
    }

    fn violation(&self, kind: ViolationKind, message: String, command: &str) -> SecurityViolation {
        SecurityViolation {
            kind,
            message,
            command: command.to_string(),
            policy: self.policy,
        }
    }
}
