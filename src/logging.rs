// Logging setup for the vmshell binary
//
// One `tracing-subscriber` formatter, installed once at startup. The filter comes
// from RUST_LOG when set, otherwise from the configured level (`--verbose` forces
// debug). Per-request fields are carried by spans opened in the coordinator, so
// nothing here holds request state.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Output format of the formatter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse a configured format name; unknown names use compact
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

/// Level used when RUST_LOG is not set
pub fn default_level(config: &LoggingConfig, verbose: bool) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    config.level.to_lowercase().parse().unwrap_or(Level::INFO)
}

/// Build the filter, preferring RUST_LOG directives over the default level
pub fn build_filter(default: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

/// Writer for the configured sink: stderr, or a log file opened for append
fn make_writer(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}

/// Install the global subscriber
///
/// # Errors
///
/// Fails if the log file cannot be opened or a subscriber is already installed.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = build_filter(default_level(config, verbose));
    let writer = make_writer(config)?;
    let ansi = config.log_file.is_none();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);

    let installed = match LogFormat::from_name(&config.format) {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    installed.map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tracing::info;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_format_names() {
        assert_eq!(LogFormat::from_name("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_name("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_name("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::from_name("xml"), LogFormat::Compact);
    }

    #[test]
    fn test_default_level() {
        let mut config = LoggingConfig::default();
        assert_eq!(default_level(&config, false), Level::INFO);
        assert_eq!(default_level(&config, true), Level::DEBUG);

        config.level = "warn".to_string();
        assert_eq!(default_level(&config, false), Level::WARN);

        config.level = "nonsense".to_string();
        assert_eq!(default_level(&config, false), Level::INFO);
    }

    #[test]
    fn test_json_output_carries_span_fields() {
        let captured = Captured::default();
        let sink = captured.clone();

        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_max_level(Level::INFO)
            .with_writer(move || sink.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("execute", node = "pve1", vmid = "101");
            let _guard = span.enter();
            info!(policy = "standard", "Command validated");
        });

        let line = captured.text();
        let event: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(event["fields"]["message"], "Command validated");
        assert_eq!(event["fields"]["policy"], "standard");
        assert_eq!(event["span"]["vmid"], "101");
    }

    #[test]
    fn test_log_file_writer() {
        let file = NamedTempFile::new().unwrap();
        let config = LoggingConfig {
            log_file: Some(file.path().to_string_lossy().to_string()),
            ..LoggingConfig::default()
        };
        assert!(make_writer(&config).is_ok());

        let missing = LoggingConfig {
            log_file: Some("/nonexistent-dir/vmshell.log".to_string()),
            ..LoggingConfig::default()
        };
        assert!(make_writer(&missing).is_err());
    }
}
