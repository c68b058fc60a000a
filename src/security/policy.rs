//! Security Policies and Rule Catalog
//!
//! The catalog holds every authorization rule the validator consults. It is built
//! once, never mutated, and shared read-only between validators (and threads).

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Commands allowed under the strict policy (read-only diagnostics)
pub const STRICT_WHITELIST: &[&str] = &[
    // System information
    "uname",
    "hostname",
    "whoami",
    "id",
    "uptime",
    "date",
    // File inspection (read-only)
    "ls",
    "cat",
    "head",
    "tail",
    "find",
    "grep",
    "wc",
    // Process information
    "ps",
    "top",
    "htop",
    "pgrep",
    // Network information (read-only)
    "ping",
    "traceroute",
    "netstat",
    "ss",
    // Disk information
    "df",
    "du",
    "lsblk",
    "mount",
    // Service status
    "systemctl status",
    "service status",
];

/// Commands the standard policy allows on top of the strict whitelist
pub const STANDARD_ADDITIONAL: &[&str] = &[
    // Package queries
    "dpkg",
    "rpm",
    "yum list",
    "apt list",
    "dnf list",
    // Logs
    "journalctl",
    "dmesg",
    // Configuration tests
    "nginx -t",
    "apache2 -t",
    "httpd -t",
    // Database clients
    "mysql",
    "psql",
    "redis-cli",
];

/// Commands refused under every policy, permissive included
pub const GLOBAL_BLACKLIST: &[&str] = &[
    // Filesystem modification
    "rm",
    "rmdir",
    "mv",
    "cp",
    "dd",
    "shred",
    // Permission changes
    "chmod",
    "chown",
    "chgrp",
    "setfacl",
    // User management and privilege escalation
    "useradd",
    "userdel",
    "usermod",
    "passwd",
    "su",
    "sudo",
    // Network reconfiguration
    "iptables",
    "ufw",
    "firewall-cmd",
    "ipset",
    // Service control
    "systemctl start",
    "systemctl stop",
    "systemctl restart",
    "systemctl enable",
    "systemctl disable",
    "service start",
    "service stop",
    "service restart",
    // Package installation
    "apt install",
    "apt remove",
    "yum install",
    "yum remove",
    "dnf install",
    "dnf remove",
    "pip install",
    "npm install",
    // Remote fetch and remote shells
    "wget",
    "curl",
    "nc",
    "netcat",
    "telnet",
    "ssh",
    "scp",
    "rsync",
    // Interactive shells and evaluation
    "bash",
    "sh",
    "zsh",
    "fish",
    "exec",
    "eval",
    // Inline editors
    "vi",
    "vim",
    "nano",
    "emacs",
    "sed",
    "awk",
];

/// Punctuation refused under the strict policy
pub const DANGEROUS_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '*', '?', '~',
];

/// Built-in injection patterns, scanned in order against the raw command text
const INJECTION_PATTERNS: &[(&str, &str)] = &[
    ("shell-operator", r"[;&|`$()]"),
    ("redirection", r"<<|>>"),
    ("variable-expansion", r"\$\{.*\}"),
    ("backtick-substitution", r"`.*`"),
    ("command-substitution", r"\$\(.*\)"),
    ("directory-traversal", r"\.\./"),
    ("device-access", r"/dev/"),
    ("procfs-access", r"/proc/"),
    ("hex-escape", r"\\x[0-9a-f]{2}"),
    ("url-encoding", r"%[0-9a-f]{2}"),
    ("null-byte", r"\x00"),
    ("line-break", r"[\r\n]"),
];

/// Security policy levels for command validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    /// Read-only diagnostics only; dangerous characters are refused
    Strict,
    /// Strict set plus package queries, logs, config tests and database clients
    #[default]
    Standard,
    /// Blacklist, injection and length checks only
    Permissive,
}

/// Error returned when parsing an unknown policy name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid security policy '{0}'. Valid options: strict, standard, permissive")]
pub struct UnknownPolicyError(pub String);

impl SecurityPolicy {
    /// All policies, most restrictive first
    pub const ALL: [SecurityPolicy; 3] = [Self::Strict, Self::Standard, Self::Permissive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Standard => "standard",
            Self::Permissive => "permissive",
        }
    }

    /// Resolve a configured policy name
    ///
    /// Unknown names never widen the command surface: they fall back to
    /// `Standard` and a warning is logged.
    pub fn resolve(name: &str) -> Self {
        match name.parse() {
            Ok(policy) => policy,
            Err(_) => {
                tracing::warn!("Invalid security policy '{}', using 'standard'", name);
                Self::Standard
            }
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityPolicy {
    type Err = UnknownPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "standard" => Ok(Self::Standard),
            "permissive" => Ok(Self::Permissive),
            _ => Err(UnknownPolicyError(s.to_string())),
        }
    }
}

/// A compiled injection-detection pattern
#[derive(Debug, Clone)]
pub struct InjectionPattern {
    /// Short rule name reported in violations
    pub name: &'static str,
    regex: Regex,
}

impl InjectionPattern {
    /// Source text of the regex
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Summary of the rules in effect for one policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub policy: SecurityPolicy,
    pub allowed_commands_count: usize,
    pub blacklisted_commands_count: usize,
    pub injection_patterns_count: usize,
    pub dangerous_chars: String,
    pub max_command_length: usize,
}

/// Immutable rule catalog shared by every validator
///
/// Whitelist entries match a command by exact name or by its first two words, never
/// as a prefix: `ps` does not authorize `psql`, so an accepted command is always
/// listed in its policy's whitelist.
/// Blacklist entries additionally match as a plain prefix of the first two words,
/// so `sudo` is caught by `su` and `rm -rf` by `rm`.
#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    whitelists: BTreeMap<SecurityPolicy, BTreeSet<String>>,
    blacklist: BTreeSet<String>,
    injection_patterns: Vec<InjectionPattern>,
    dangerous_chars: BTreeSet<char>,
}

impl Default for PolicyCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyCatalog {
    /// Build the catalog from the built-in rule data
    pub fn new() -> Self {
        let strict: BTreeSet<String> = STRICT_WHITELIST.iter().map(|s| s.to_string()).collect();
        let mut standard = strict.clone();
        standard.extend(STANDARD_ADDITIONAL.iter().map(|s| s.to_string()));

        let mut whitelists = BTreeMap::new();
        whitelists.insert(SecurityPolicy::Strict, strict);
        whitelists.insert(SecurityPolicy::Standard, standard);

        let injection_patterns = INJECTION_PATTERNS
            .iter()
            .map(|&(name, pattern)| InjectionPattern {
                name,
                // Built-in patterns are constants covered by unit tests
                regex: RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("built-in injection pattern must compile"),
            })
            .collect();

        Self {
            whitelists,
            blacklist: GLOBAL_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            injection_patterns,
            dangerous_chars: DANGEROUS_CHARS.iter().copied().collect(),
        }
    }

    /// Add operator-supplied blacklist entries
    ///
    /// Entries are normalized to lower case; blank entries are ignored.
    pub fn with_additional_blacklist<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            let entry = entry.as_ref().trim().to_lowercase();
            if !entry.is_empty() {
                self.blacklist.insert(entry);
            }
        }
        self
    }

    /// Effective whitelist for a policy, `None` when no whitelist applies
    pub fn whitelist(&self, policy: SecurityPolicy) -> Option<&BTreeSet<String>> {
        self.whitelists.get(&policy)
    }

    pub fn blacklist(&self) -> &BTreeSet<String> {
        &self.blacklist
    }

    pub fn injection_patterns(&self) -> &[InjectionPattern] {
        &self.injection_patterns
    }

    pub fn dangerous_chars(&self) -> &BTreeSet<char> {
        &self.dangerous_chars
    }

    /// Return the blacklist entry matching the command, if any
    ///
    /// `base` is the lower-cased first token, `phrase` the lower-cased first two tokens.
    pub fn blacklist_match(&self, base: &str, phrase: &str) -> Option<&str> {
        self.blacklist
            .iter()
            .find(|blocked| base == blocked.as_str() || phrase.starts_with(blocked.as_str()))
            .map(String::as_str)
    }

    pub fn is_blacklisted(&self, base: &str, phrase: &str) -> bool {
        self.blacklist_match(base, phrase).is_some()
    }

    /// Check the command against the policy whitelist
    ///
    /// Always true for the permissive policy.
    pub fn is_whitelisted(&self, policy: SecurityPolicy, base: &str, phrase: &str) -> bool {
        match self.whitelist(policy) {
            None => true,
            Some(allowed) => allowed.contains(base) || allowed.contains(phrase),
        }
    }

    /// First injection pattern matching the raw text
    pub fn first_injection_match(&self, text: &str) -> Option<&InjectionPattern> {
        self.injection_patterns.iter().find(|p| p.is_match(text))
    }

    /// Dangerous characters present in the text, sorted and de-duplicated
    pub fn dangerous_chars_in(&self, text: &str) -> BTreeSet<char> {
        text.chars()
            .filter(|c| self.dangerous_chars.contains(c))
            .collect()
    }

    /// Describe the rules in effect for a policy
    pub fn security_info(&self, policy: SecurityPolicy, max_command_length: usize) -> SecurityInfo {
        // Permissive reports the broadest whitelist for reference even though it is not enforced
        let allowed_commands_count = self
            .whitelist(policy)
            .or_else(|| self.whitelist(SecurityPolicy::Standard))
            .map(BTreeSet::len)
            .unwrap_or(0);

        SecurityInfo {
            policy,
            allowed_commands_count,
            blacklisted_commands_count: self.blacklist.len(),
            injection_patterns_count: self.injection_patterns.len(),
            dangerous_chars: self.dangerous_chars.iter().collect(),
            max_command_length,
        }
    }
}
