//! Property-Based Tests for Command Validation
//!
//! # Properties
//!
//! - **Stability**: A sanitized command validates again to itself
//! - **Soundness**: Accepted input never carries shell operators or line breaks
//! - **Blacklist**: Blacklisted commands are refused whatever their arguments
//! - **Strict Characters**: Dangerous characters are refused under the strict policy
//! - **Length**: Oversized input is refused before any other rule runs
//!
//! ```bash
//! cargo test --lib security::proptests
//! ```

use proptest::prelude::*;
use std::sync::Arc;

use super::policy::{PolicyCatalog, SecurityPolicy, DANGEROUS_CHARS, GLOBAL_BLACKLIST, STRICT_WHITELIST};
use super::validator::{CommandValidator, ViolationKind};

fn arb_policy() -> impl Strategy<Value = SecurityPolicy> {
    prop::sample::select(SecurityPolicy::ALL.to_vec())
}

fn validator(policy: SecurityPolicy) -> CommandValidator {
    CommandValidator::new(Arc::new(PolicyCatalog::new()), policy)
}

// Single-word whitelist entries only, so the generated command name is always allowed
fn arb_allowed_command() -> impl Strategy<Value = &'static str> {
    let single: Vec<&'static str> = STRICT_WHITELIST
        .iter()
        .copied()
        .filter(|c| !c.contains(' '))
        .collect();
    prop::sample::select(single)
}

proptest! {
    #[test]
    fn prop_sanitized_command_is_stable(
        policy in arb_policy(),
        command in arb_allowed_command(),
        args in "[a-zA-Z0-9 ._'\"*?~-]{0,40}",
    ) {
        let v = validator(policy);
        let input = format!("{} {}", command, args);

        if let Ok(once) = v.validate(&input) {
            prop_assert_eq!(v.validate(&once), Ok(once));
        }
    }

    #[test]
    fn prop_accepted_input_has_no_shell_operators(
        policy in arb_policy(),
        input in ".{0,120}",
    ) {
        if validator(policy).validate(&input).is_ok() {
            for c in [';', '&', '|', '`', '$', '(', ')', '\n', '\r', '\0'] {
                prop_assert!(!input.contains(c), "accepted {:?} containing {:?}", input, c);
            }
            prop_assert!(!input.contains("../"));
        }
    }

    #[test]
    fn prop_blacklisted_commands_always_rejected(
        policy in arb_policy(),
        blocked in prop::sample::select(GLOBAL_BLACKLIST),
        args in "[a-z0-9 ./-]{0,30}",
    ) {
        let input = format!("{} {}", blocked, args);
        prop_assert!(validator(policy).validate(&input).is_err());
    }

    #[test]
    fn prop_strict_refuses_dangerous_characters(
        dangerous in prop::sample::select(DANGEROUS_CHARS),
        prefix in "[a-z]{0,8}",
        suffix in "[a-z]{0,8}",
    ) {
        let input = format!("ls {}{}{}", prefix, dangerous, suffix);
        prop_assert!(validator(SecurityPolicy::Strict).validate(&input).is_err());
    }

    #[test]
    fn prop_oversized_input_rejected_first(
        policy in arb_policy(),
        input in "[a-z;|]{1001,1100}",
    ) {
        let err = validator(policy).validate(&input).unwrap_err();
        prop_assert_eq!(err.kind, ViolationKind::ExcessiveLength);
    }
}
