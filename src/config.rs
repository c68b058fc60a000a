// Configuration File Support
//
// TOML configuration for the gateway with environment variable overrides.
// Files are looked up in this order: the --config flag, $VMSHELL_CONFIG, then the XDG
// config directory (~/.config/vmshell/config.toml). A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::exec::{ExecutionSettings, PollConfig, RetryConfig};
use crate::security::{CommandValidator, PolicyCatalog, SecurityPolicy, DEFAULT_MAX_COMMAND_LENGTH};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "VMSHELL_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub proxmox: ProxmoxConfig,
    pub auth: AuthConfig,
    pub security: SecurityConfig,
    pub execution: ExecutionConfig,
    pub server: ServerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,

    /// Append logs to this file instead of stderr
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            log_file: None,
        }
    }
}

/// Proxmox API endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Host name or address; may carry an explicit `http://` or `https://` scheme
    pub host: String,
    pub port: u16,
    pub verify_ssl: bool,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8006,
            verify_ssl: true,
            timeout_secs: 30,
        }
    }
}

impl ProxmoxConfig {
    /// API root URL, e.g. `https://pve1:8006/api2/json`
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains("://") {
            format!("{}:{}/api2/json", host, self.port)
        } else {
            format!("https://{}:{}/api2/json", host, self.port)
        }
    }
}

/// API token credentials
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// User the token belongs to, e.g. `root@pam`
    pub user: String,
    pub token_name: String,
    pub token_value: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user: "root@pam".to_string(),
            token_name: String::new(),
            token_value: String::new(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("token_name", &self.token_name)
            .field("token_value", &"[REDACTED]")
            .finish()
    }
}

/// Command security configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// strict, standard or permissive; unknown names fall back to standard
    pub policy: String,
    pub max_command_length: usize,

    /// Commands blocked in addition to the built-in blacklist
    pub extra_blacklist: Vec<String>,

    /// Keep command text out of errors and logs
    pub redact_commands: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            policy: SecurityPolicy::Standard.to_string(),
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            extra_blacklist: Vec::new(),
            redact_commands: false,
        }
    }
}

impl SecurityConfig {
    pub fn policy(&self) -> SecurityPolicy {
        SecurityPolicy::resolve(&self.policy)
    }
}

/// Command execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Shell that runs the sanitized command inside the guest
    pub shell: String,

    /// Overall wait for a command to exit, in seconds
    pub timeout_secs: u64,
    pub initial_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub poll_backoff: f64,
    pub max_poll_attempts: u32,

    /// Poll until the agent reports the process as exited
    pub require_exit: bool,

    /// Report failure for nonzero exit codes
    pub nonzero_exit_is_failure: bool,

    /// Attempts for VM status and exec-status queries
    pub transport_attempts: u32,

    /// Attempts for command submission
    pub submit_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let poll = PollConfig::default();
        let retry = RetryConfig::default();
        Self {
            shell: crate::agent::DEFAULT_SHELL.to_string(),
            timeout_secs: poll.timeout.as_secs(),
            initial_delay_ms: poll.initial_delay.as_millis() as u64,
            poll_interval_ms: poll.interval.as_millis() as u64,
            max_poll_interval_ms: poll.max_interval.as_millis() as u64,
            poll_backoff: poll.backoff_multiplier,
            max_poll_attempts: poll.max_attempts,
            require_exit: poll.require_exit,
            nonzero_exit_is_failure: true,
            transport_attempts: retry.max_attempts,
            submit_attempts: 1,
            retry_base_delay_ms: retry.base_delay.as_millis() as u64,
        }
    }
}

/// HTTP server configuration
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,

    /// Bearer token required on `/v1` routes; unset leaves them open
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            api_token: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    /// Load configuration from `$VMSHELL_CONFIG` or the XDG config directory
    ///
    /// Returns defaults (with environment overrides) when no file exists.
    pub fn load() -> Result<Self> {
        let config_path = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::config_path(),
        };
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a file that must exist
    pub fn load_required<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file {:?} does not exist", path);
        }
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or if the
    /// result fails validation. A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path (`~/.config/vmshell/config.toml` on Linux)
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "vmshell") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("vmshell").join("config.toml")
        }
    }

    /// Apply environment variable overrides
    ///
    /// - VMSHELL_LOG_LEVEL, VMSHELL_LOG_FORMAT
    /// - VMSHELL_SECURITY_POLICY, VMSHELL_MAX_COMMAND_LENGTH
    /// - VMSHELL_PROXMOX_HOST, VMSHELL_PROXMOX_PORT
    /// - VMSHELL_TOKEN_VALUE
    /// - VMSHELL_EXEC_TIMEOUT_SECS
    ///
    /// Numeric values that do not parse (or are zero) are ignored.
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("VMSHELL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("VMSHELL_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(policy) = std::env::var("VMSHELL_SECURITY_POLICY") {
            self.security.policy = policy;
        }
        if let Ok(length) = std::env::var("VMSHELL_MAX_COMMAND_LENGTH") {
            if let Ok(length) = length.parse::<usize>() {
                if length > 0 {
                    self.security.max_command_length = length;
                }
            }
        }

        if let Ok(host) = std::env::var("VMSHELL_PROXMOX_HOST") {
            self.proxmox.host = host;
        }
        if let Ok(port) = std::env::var("VMSHELL_PROXMOX_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                if port > 0 {
                    self.proxmox.port = port;
                }
            }
        }
        if let Ok(token) = std::env::var("VMSHELL_TOKEN_VALUE") {
            self.auth.token_value = token;
        }

        if let Ok(token) = std::env::var("VMSHELL_API_TOKEN") {
            if !token.is_empty() {
                self.server.api_token = Some(token);
            }
        }

        if let Ok(timeout) = std::env::var("VMSHELL_EXEC_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 {
                    self.execution.timeout_secs = timeout;
                }
            }
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        if self.security.max_command_length == 0 {
            anyhow::bail!("Maximum command length must be > 0");
        }

        if self.proxmox.port == 0 {
            anyhow::bail!("Proxmox port must be > 0");
        }
        if self.proxmox.timeout_secs == 0 {
            anyhow::bail!("Proxmox request timeout must be > 0");
        }

        if self.execution.shell.trim().is_empty() {
            anyhow::bail!("Execution shell must not be empty");
        }
        if self.execution.timeout_secs == 0 {
            anyhow::bail!("Execution timeout must be > 0");
        }
        if self.execution.max_poll_attempts == 0 {
            anyhow::bail!("Maximum poll attempts must be > 0");
        }
        if self.execution.poll_backoff < 1.0 {
            anyhow::bail!("Poll backoff must be >= 1.0");
        }
        if self.execution.transport_attempts == 0 || self.execution.submit_attempts == 0 {
            anyhow::bail!("Retry attempts must be > 0");
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port must be > 0");
        }

        Ok(())
    }

    /// Check that enough is configured to reach the Proxmox API
    pub fn require_connection(&self) -> Result<()> {
        if self.proxmox.host.trim().is_empty() {
            anyhow::bail!("Proxmox host is not configured (set [proxmox].host or VMSHELL_PROXMOX_HOST)");
        }
        if self.auth.user.trim().is_empty() || self.auth.token_name.trim().is_empty() {
            anyhow::bail!("API token user and name are not configured ([auth].user, [auth].token_name)");
        }
        if self.auth.token_value.is_empty() {
            anyhow::bail!("API token value is not configured (set [auth].token_value or VMSHELL_TOKEN_VALUE)");
        }
        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Rule catalog including the configured extra blacklist entries
    pub fn policy_catalog(&self) -> PolicyCatalog {
        PolicyCatalog::new().with_additional_blacklist(&self.security.extra_blacklist)
    }

    /// Validator for the configured policy, or for `policy` when given
    pub fn validator(&self, policy: Option<SecurityPolicy>) -> CommandValidator {
        let policy = policy.unwrap_or_else(|| self.security.policy());
        CommandValidator::new(Arc::new(self.policy_catalog()), policy)
            .with_max_command_length(self.security.max_command_length)
    }

    /// Coordinator settings derived from the execution section
    pub fn execution_settings(&self) -> ExecutionSettings {
        let exec = &self.execution;
        let retry = RetryConfig::new().base_delay(Duration::from_millis(exec.retry_base_delay_ms));

        ExecutionSettings {
            poll: PollConfig {
                initial_delay: Duration::from_millis(exec.initial_delay_ms),
                interval: Duration::from_millis(exec.poll_interval_ms),
                backoff_multiplier: exec.poll_backoff,
                max_interval: Duration::from_millis(exec.max_poll_interval_ms),
                max_attempts: exec.max_poll_attempts,
                timeout: Duration::from_secs(exec.timeout_secs),
                require_exit: exec.require_exit,
            },
            transport_retry: retry.clone().max_attempts(exec.transport_attempts),
            submit_retry: retry.max_attempts(exec.submit_attempts),
            nonzero_exit_is_failure: exec.nonzero_exit_is_failure,
            redact_commands: self.security.redact_commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Tests touching process environment run one at a time
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "VMSHELL_LOG_LEVEL",
        "VMSHELL_LOG_FORMAT",
        "VMSHELL_SECURITY_POLICY",
        "VMSHELL_MAX_COMMAND_LENGTH",
        "VMSHELL_PROXMOX_HOST",
        "VMSHELL_PROXMOX_PORT",
        "VMSHELL_TOKEN_VALUE",
        "VMSHELL_EXEC_TIMEOUT_SECS",
        "VMSHELL_API_TOKEN",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.proxmox.port, 8006);
        assert!(config.proxmox.verify_ssl);
        assert_eq!(config.security.policy(), SecurityPolicy::Standard);
        assert_eq!(config.security.max_command_length, 1000);
        assert_eq!(config.execution.timeout_secs, 300);
        assert_eq!(config.execution.submit_attempts, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_execution_settings_match_defaults() {
        assert_eq!(Config::default().execution_settings(), ExecutionSettings::default());
    }

    #[test]
    fn test_config_validation_invalid_values() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.security.max_command_length = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.execution.poll_backoff = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.execution.submit_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_policy_is_not_a_validation_error() {
        let mut config = Config::default();
        config.security.policy = "paranoid".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.security.policy(), SecurityPolicy::Standard);
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("nonexistent");
        assert_eq!(Config::load_from_path(&path).unwrap(), Config::default());
        assert!(Config::load_required(&path).is_err());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[proxmox]
host = "pve1.lan"
verify_ssl = false

[auth]
user = "automation@pve"
token_name = "gateway"
token_value = "s3cr3t"

[security]
policy = "strict"
extra_blacklist = ["tcpdump"]

[execution]
timeout_secs = 60
require_exit = false
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.proxmox.base_url(), "https://pve1.lan:8006/api2/json");
        assert!(!config.proxmox.verify_ssl);
        assert_eq!(config.security.policy(), SecurityPolicy::Strict);
        assert_eq!(config.execution.timeout_secs, 60);
        assert!(config.require_connection().is_ok());

        let settings = config.execution_settings();
        assert_eq!(settings.poll.timeout, Duration::from_secs(60));
        assert!(!settings.poll.require_exit);

        let validator = config.validator(None);
        assert_eq!(validator.policy(), SecurityPolicy::Strict);
        assert!(validator.validate("tcpdump -i eth0").is_err());
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[logging\nlevel = \"debug\"\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("VMSHELL_LOG_LEVEL", "debug");
        std::env::set_var("VMSHELL_SECURITY_POLICY", "permissive");
        std::env::set_var("VMSHELL_MAX_COMMAND_LENGTH", "200");
        std::env::set_var("VMSHELL_PROXMOX_HOST", "10.0.0.5");
        std::env::set_var("VMSHELL_PROXMOX_PORT", "8443");
        std::env::set_var("VMSHELL_TOKEN_VALUE", "from-env");
        std::env::set_var("VMSHELL_EXEC_TIMEOUT_SECS", "45");
        std::env::set_var("VMSHELL_API_TOKEN", "api-secret");

        let config = Config::default().apply_env_overrides();
        clear_env();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.security.policy(), SecurityPolicy::Permissive);
        assert_eq!(config.security.max_command_length, 200);
        assert_eq!(config.proxmox.base_url(), "https://10.0.0.5:8443/api2/json");
        assert_eq!(config.auth.token_value, "from-env");
        assert_eq!(config.execution.timeout_secs, 45);
        assert_eq!(config.server.api_token.as_deref(), Some("api-secret"));
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("VMSHELL_MAX_COMMAND_LENGTH", "0");
        std::env::set_var("VMSHELL_PROXMOX_PORT", "not-a-port");
        std::env::set_var("VMSHELL_EXEC_TIMEOUT_SECS", "-5");

        let config = Config::default().apply_env_overrides();
        clear_env();

        assert_eq!(config.security.max_command_length, 1000);
        assert_eq!(config.proxmox.port, 8006);
        assert_eq!(config.execution.timeout_secs, 300);
    }

    #[test]
    fn test_require_connection() {
        let mut config = Config::default();
        assert!(config.require_connection().is_err());

        config.proxmox.host = "pve1".to_string();
        config.auth.token_name = "gateway".to_string();
        assert!(config.require_connection().is_err());

        config.auth.token_value = "secret".to_string();
        assert!(config.require_connection().is_ok());
    }

    #[test]
    fn test_base_url_with_scheme() {
        let config = ProxmoxConfig {
            host: "http://127.0.0.1/".to_string(),
            port: 18006,
            ..ProxmoxConfig::default()
        };
        assert_eq!(config.base_url(), "http://127.0.0.1:18006/api2/json");
    }

    #[test]
    fn test_auth_debug_redacts_token() {
        let auth = AuthConfig {
            token_value: "super-secret".to_string(),
            ..AuthConfig::default()
        };
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn test_server_debug_redacts_api_token() {
        let server = ServerConfig {
            api_token: Some("bearer-secret".to_string()),
            ..ServerConfig::default()
        };
        let printed = format!("{:?}", server);
        assert!(!printed.contains("bearer-secret"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn test_config_path() {
        assert!(Config::config_path().ends_with("config.toml"));
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        config.logging.level = "invalid".to_string();
        assert!(config.log_level().is_err());
    }
}
