// vmshell - Main Entry Point
//
// Command-line front end for the gateway:
// - exec: run one command inside a VM and print its output
// - validate: check a command against a policy without running it
// - policy: show the rules in effect for a policy
// - serve: run the HTTP API

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vmshell_gateway::agent::ProxmoxAgentClient;
use vmshell_gateway::config::Config;
use vmshell_gateway::exec::{ExecutionCoordinator, ExecutionRequest, ExecutionResult};
use vmshell_gateway::logging;
use vmshell_gateway::metrics::GatewayMetrics;
use vmshell_gateway::security::SecurityPolicy;
use vmshell_gateway::GatewayError;
use vmshell_gateway::server::{self, AppState};

/// vmshell: policy-checked shell commands inside Proxmox VMs
#[derive(Parser, Debug)]
#[command(name = "vmshell")]
#[command(author = "vmshell Contributors")]
#[command(version)]
#[command(about = "Run validated shell commands inside Proxmox VMs through the guest agent", long_about = None)]
struct Args {
    /// Configuration file (default: $VMSHELL_CONFIG or ~/.config/vmshell/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command inside a VM
    Exec {
        /// Proxmox node hosting the VM
        #[arg(long)]
        node: String,

        /// Numeric VM id
        #[arg(long)]
        vmid: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Command to run; several words are quoted and joined
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Validate a command without running it
    Validate {
        /// Policy to validate against (default: configured policy)
        #[arg(long)]
        policy: Option<SecurityPolicy>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show the rules in effect for a policy
    Policy {
        #[arg(long)]
        policy: Option<SecurityPolicy>,
    },
    /// Serve the HTTP API
    Serve {
        /// Bind address (default: [server].bind)
        #[arg(long)]
        bind: Option<String>,

        /// Port (default: [server].port)
        #[arg(long)]
        port: Option<u16>,
    },
}

/// A single argument is taken verbatim; several are re-joined with shell quoting
fn command_text(words: &[String]) -> String {
    match words {
        [single] => single.clone(),
        _ => shell_words::join(words),
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping local wait (the guest process keeps running)");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_required(path)?,
        None => Config::load()?,
    };
    logging::init(&config.logging, args.verbose)?;

    match args.command {
        Commands::Exec {
            node,
            vmid,
            json,
            command,
        } => exec(&config, node, vmid, json, command_text(&command)).await,
        Commands::Validate { policy, command } => Ok(validate(&config, policy, &command_text(&command))),
        Commands::Policy { policy } => {
            let info = config.validator(policy).security_info();
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { bind, port } => {
            serve(&config, bind, port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_coordinator(config: &Config) -> Result<ExecutionCoordinator> {
    let agent = ProxmoxAgentClient::from_config(config)?;
    info!("Using Proxmox API at {}", agent.base_url());

    Ok(ExecutionCoordinator::new(Arc::new(agent), config.validator(None))
        .with_settings(config.execution_settings()))
}

async fn exec(config: &Config, node: String, vmid: String, json: bool, command: String) -> Result<ExitCode> {
    let coordinator = build_coordinator(config)?;
    let request = match ExecutionRequest::new(node, vmid, command) {
        Ok(request) => request,
        Err(err) => return Ok(report_error(&err)),
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = match coordinator.execute_request(&request, &cancel).await {
        Ok(result) => result,
        Err(err) => return Ok(report_error(&err)),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    Ok(exit_code_for(&result))
}

fn print_result(result: &ExecutionResult) {
    if !result.output.is_empty() {
        print!("{}", result.output);
        if !result.output.ends_with('\n') {
            println!();
        }
    }
    if !result.error.is_empty() {
        eprint!("{}", result.error);
        if !result.error.ends_with('\n') {
            eprintln!();
        }
    }
    if let Some(signal) = result.signal {
        eprintln!("terminated by signal {}", signal);
    }
    if !result.exited {
        eprintln!("warning: command may not have completed");
    }
}

/// Guest exit codes 1-255 are passed through; anything else failing is 1
fn exit_code_for(result: &ExecutionResult) -> ExitCode {
    if result.success {
        return ExitCode::SUCCESS;
    }
    match u8::try_from(result.exit_code) {
        Ok(code) if code != 0 => ExitCode::from(code),
        _ => ExitCode::FAILURE,
    }
}

/// Print the error report on stderr; the report is the only error output
fn report_error(err: &GatewayError) -> ExitCode {
    match serde_json::to_string_pretty(&err.report()) {
        Ok(report) => eprintln!("{}", report),
        Err(_) => eprintln!("{}", err),
    }
    ExitCode::FAILURE
}

fn validate(config: &Config, policy: Option<SecurityPolicy>, command: &str) -> ExitCode {
    let validator = config.validator(policy);
    match validator.validate(command) {
        Ok(sanitized) => {
            println!("{}", sanitized);
            ExitCode::SUCCESS
        }
        Err(violation) => {
            eprintln!("rejected ({}): {}", violation.kind, violation.message);
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: &Config, bind: Option<String>, port: Option<u16>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind, port))?;

    let metrics = GatewayMetrics::new().context("Failed to register metrics")?;
    let coordinator = build_coordinator(config)?.with_metrics(metrics.clone());

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    info!("vmshell gateway v{} starting (policy: {})", env!("CARGO_PKG_VERSION"), coordinator.validator().policy());

    server::serve(
        AppState {
            coordinator,
            metrics,
            shutdown,
            api_token: config.server.api_token.clone().filter(|t| !t.is_empty()),
        },
        addr,
    )
    .await
}
