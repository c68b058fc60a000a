use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// `vmshell` isolated from the caller's config file and environment
fn vmshell(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("vmshell").unwrap();
    cmd.env("VMSHELL_CONFIG", dir.path().join("absent.toml"));
    for var in [
        "VMSHELL_LOG_LEVEL",
        "VMSHELL_LOG_FORMAT",
        "VMSHELL_SECURITY_POLICY",
        "VMSHELL_MAX_COMMAND_LENGTH",
        "VMSHELL_PROXMOX_HOST",
        "VMSHELL_PROXMOX_PORT",
        "VMSHELL_TOKEN_VALUE",
        "VMSHELL_EXEC_TIMEOUT_SECS",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vmshell 0.1.0"));
}

#[test]
fn test_cli_help() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run validated shell commands inside Proxmox VMs"));
}

#[test]
fn test_validate_accepts_and_requotes() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .args(["validate", "ls", "-la", "/var/log"])
        .assert()
        .success()
        .stdout("ls -la /var/log\n");

    vmshell(&dir)
        .args(["validate", "grep 'disk full' /var/log/syslog"])
        .assert()
        .success()
        .stdout("grep 'disk full' /var/log/syslog\n");
}

#[test]
fn test_validate_rejects_blacklisted_command() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .args(["validate", "rm", "-rf", "/"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("blacklisted_command"));
}

#[test]
fn test_validate_rejects_injection() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .args(["validate", "ls; cat /etc/shadow"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("injection_pattern"));
}

#[test]
fn test_validate_policy_flag() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .args(["validate", "--policy", "strict", "mysql", "-u", "root"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unauthorized_command"));

    vmshell(&dir)
        .args(["validate", "--policy", "paranoid", "ls"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("paranoid"));
}

#[test]
fn test_policy_from_environment() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .env("VMSHELL_SECURITY_POLICY", "strict")
        .arg("policy")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"policy\": \"strict\""));
}

#[test]
fn test_config_extra_blacklist() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, "[security]\nextra_blacklist = [\"tcpdump\"]\n").unwrap();

    vmshell(&dir)
        .arg("--config")
        .arg(&config)
        .args(["validate", "tcpdump", "-i", "eth0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("blacklisted_command"));
}

#[test]
fn test_missing_explicit_config() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .arg("--config")
        .arg(dir.path().join("nope.toml"))
        .arg("policy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_exec_requires_connection_settings() {
    let dir = TempDir::new().unwrap();
    vmshell(&dir)
        .args(["exec", "--node", "pve1", "--vmid", "101", "uptime"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Proxmox host is not configured"));
}

#[test]
fn test_exec_unreachable_api_reports_connection_error() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        r#"
[proxmox]
host = "http://127.0.0.1"
port = 9
timeout_secs = 2

[auth]
user = "root@pam"
token_name = "ci"
token_value = "not-a-real-token"

[execution]
retry_base_delay_ms = 1
"#,
    )
    .unwrap();

    vmshell(&dir)
        .arg("--config")
        .arg(&config)
        .args(["exec", "--node", "pve1", "--vmid", "101", "uptime"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("\"error_type\": \"connection_error\""))
        .stderr(predicate::str::contains("not-a-real-token").not())
        // The JSON report is the only error output
        .stderr(predicate::str::is_match("(?m)^Error:").unwrap().not());
}
