//! agentgate main binary.

mod commands;
mod config;
mod console;

use ag_policy::RiskLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agentgate", version, about = "Approval gate for agent-proposed actions")]
struct Cli {
    /// Config file. Default: ~/.agentgate/config.toml
    #[arg(long, global = true, env = "AGENTGATE_CONFIG")]
    config: Option<PathBuf>,
    /// Workspace root; overrides the config file.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show or change the autonomy mode: show, collaborative, autonomous or toggle.
    Mode { action: Option<String> },
    /// Report whether an operation would need approval.
    Check {
        operation: String,
        #[arg(long, default_value = "low")]
        risk: RiskLevel,
    },
    /// Set the auto-execute flag for an operation.
    Allow {
        operation: String,
        #[arg(action = clap::ArgAction::Set)]
        allowed: bool,
    },
    /// Execute capabilities from a JSON file (one object or an array).
    Run {
        file: PathBuf,
        /// Run terminal commands and capture output instead of printing them.
        #[arg(long)]
        capture: bool,
        /// Skip backups before files are overwritten, edited or deleted.
        #[arg(long)]
        no_backup: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let mut cfg = config::AgentGateConfig::load(cli.config).await?;
    if let Some(workspace) = cli.workspace {
        cfg.general.workspace = Some(workspace);
    }

    match cli.command {
        Command::Mode { action } => {
            let action = commands::ModeAction::parse(action.as_deref())?;
            commands::mode(&cfg, action).await
        }
        Command::Check { operation, risk } => commands::check(&cfg, &operation, risk).await,
        Command::Allow { operation, allowed } => commands::allow(&cfg, &operation, allowed).await,
        Command::Run {
            file,
            capture,
            no_backup,
        } => commands::run(&cfg, &file, commands::RunOptions { capture, no_backup }).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,agentgate=debug,ag_app=debug,ag_executor=debug,ag_store=debug,ag_policy=debug",
        ),
    };
    let log_format = std::env::var("AGENTGATE_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    // stdout carries prompts and results.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    match log_format.as_str() {
        "json" => builder.json().flatten_event(true).with_current_span(true).init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported AGENTGATE_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
