//! BurstGate binary: per-user message coalescing in front of an LLM responder.

mod auth;
mod commands;
mod config;
mod gateway;
mod responder;
mod routes;
mod server;
mod session;
mod sink;
mod store;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "burstgate", version, about = "Debounce and gate chat bursts before an LLM replies")]
struct Cli {
    /// Config file (defaults to ~/.burstgate/config.toml).
    #[arg(long, global = true, env = "BURSTGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the BurstGate server (default).
    Serve,
    /// Validate config, credentials and the database.
    Doctor,
    /// Inspect or change a user's human-handover flag.
    Handover {
        #[command(subcommand)]
        action: HandoverCommand,
    },
}

#[derive(Debug, Subcommand)]
enum HandoverCommand {
    /// Silence automated replies for a user.
    Set {
        user_id: String,
        /// Minutes until the flag expires (defaults to handover.ttl_minutes).
        #[arg(long)]
        minutes: Option<u64>,
    },
    /// Hand the conversation back to the bot.
    Clear { user_id: String },
    Status { user_id: String },
}

impl From<HandoverCommand> for server::HandoverAction {
    fn from(cmd: HandoverCommand) -> Self {
        match cmd {
            HandoverCommand::Set { user_id, minutes } => Self::Set { user_id, minutes },
            HandoverCommand::Clear { user_id } => Self::Clear { user_id },
            HandoverCommand::Status { user_id } => Self::Status { user_id },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // API keys may live in a local .env during development.
    let _ = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Handover { action } => server::handover(cli.config, action.into()).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,burstgate=debug,bg_app=debug,bg_engine=debug,bg_channels=debug,bg_llm=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("BURSTGATE_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported BURSTGATE_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
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
