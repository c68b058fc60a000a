//! Command Security Subsystem
//!
//! This module decides whether a command string may be handed to a shell inside a
//! guest VM, and produces the re-quoted form that is actually sent.
//!
//! # Security Layers
//!
//! - **Length Limit**: Oversized input is rejected before any parsing
//! - **Injection Patterns**: The raw, unparsed text is scanned for shell metacharacters,
//!   substitution syntax, traversal and encoded escapes
//! - **Dangerous Characters**: Under the strict policy, punctuation commonly abused for
//!   injection is refused outright
//! - **Shell Lexing**: The command is tokenized with quote-aware lexing
//! - **Authorization**: The command name (and its first argument) is checked against the
//!   global blacklist and then the policy whitelist
//! - **Re-quoting**: Every token is quoted again so the remote shell cannot read any of
//!   them as an operator
//!
//! # Architecture
//!
//! - `policy.rs`: Security policies and the immutable rule catalog
//! - `validator.rs`: The validation pipeline and typed violations
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vmshell_gateway::security::{CommandValidator, PolicyCatalog, SecurityPolicy};
//!
//! let catalog = Arc::new(PolicyCatalog::new());
//! let validator = CommandValidator::new(catalog, SecurityPolicy::Standard);
//!
//! assert_eq!(validator.validate("ls -la").unwrap(), "ls -la");
//! assert!(validator.validate("rm -rf /").is_err());
//! ```

mod policy;
mod validator;

#[cfg(test)]
mod proptests;

pub use policy::{
    InjectionPattern, PolicyCatalog, SecurityInfo, SecurityPolicy, UnknownPolicyError,
    DANGEROUS_CHARS, GLOBAL_BLACKLIST, STANDARD_ADDITIONAL, STRICT_WHITELIST,
};
pub use validator::{CommandValidator, SecurityViolation, ViolationKind, DEFAULT_MAX_COMMAND_LENGTH};
