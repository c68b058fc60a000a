//! Guest agent response models
//!
//! Proxmox wraps every payload in `{"data": ...}`; the client strips the envelope and
//! these types parse what is left.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Current VM state from `status/current`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStatus {
    /// `running`, `stopped`, ...
    pub status: String,
    /// Finer-grained QEMU state (`running`, `paused`, `prelaunch`, ...)
    #[serde(default)]
    pub qmpstatus: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl VmStatus {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err(format!("expected a JSON object, got {}", value));
        }
        Self::deserialize(value).map_err(|e| e.to_string())
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// State of a command started through `agent/exec`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatus {
    /// Whether the process has terminated (reported by Proxmox as 0/1)
    #[serde(default, deserialize_with = "flag")]
    pub exited: bool,
    #[serde(rename = "exitcode", default)]
    pub exit_code: Option<i64>,
    #[serde(rename = "out-data", default)]
    pub out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    pub err_data: Option<String>,
    #[serde(rename = "out-truncated", default, deserialize_with = "flag")]
    pub out_truncated: bool,
    #[serde(rename = "err-truncated", default, deserialize_with = "flag")]
    pub err_truncated: bool,
    /// Signal that terminated the process, if any
    #[serde(default)]
    pub signal: Option<i64>,
}

/// Keys of which at least one appears in every real `exec-status` payload
const EXEC_STATUS_KEYS: &[&str] = &["exited", "exitcode", "out-data", "err-data", "signal"];

impl ExecStatus {
    /// Parse an `exec-status` payload
    ///
    /// Anything but a JSON object is malformed, and so is an object carrying none of
    /// the status keys.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Object(map) if !EXEC_STATUS_KEYS.iter().any(|key| map.contains_key(*key)) => {
                Err("No response from exec-status".to_string())
            }
            Value::Object(_) => Self::deserialize(value).map_err(|e| e.to_string()),
            Value::Null => Err("No response from exec-status".to_string()),
            other => Err(format!("expected a JSON object, got {}", other)),
        }
    }
}

/// Extract the PID from an `agent/exec` payload
///
/// Accepts a JSON integer or a string holding one.
pub fn parse_pid(value: &Value) -> Result<u64, String> {
    let pid = value
        .get("pid")
        .ok_or_else(|| "No PID returned from command execution".to_string())?;

    let parsed = match pid {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| format!("Unexpected PID value: {}", value))
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(i != 0),
            None => Err(de::Error::custom(format!("invalid flag value {}", n))),
        },
        Value::String(s) => match s.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid flag value '{}'", other))),
        },
        other => Err(de::Error::custom(format!("invalid flag value {}", other))),
    }
}
