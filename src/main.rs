//! DTalks realtime client - command line entry point

use clap::{Parser, Subcommand};
use dtalks_realtime::config::ClientConfig;
use dtalks_realtime::observability::{init_default_logging, init_logging, LogFormat};
use dtalks_realtime::protocol::UserIdentity;
use dtalks_realtime::realtime::{LinkState, SessionEvent};
use dtalks_realtime::ChatClient;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};

/// Realtime chat client for DTalks
#[derive(Parser)]
#[command(name = "dtalks")]
#[command(about = "Resilient realtime client for DTalks chats")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and follow one or more chats
    Run {
        /// Chat to open (repeatable)
        #[arg(long = "chat", value_name = "ID", required = true)]
        chats: Vec<String>,

        /// Id of the logged-in user
        #[arg(long, env = "DTALKS_USER_ID")]
        user_id: String,

        /// Display name of the logged-in user
        #[arg(long, env = "DTALKS_USERNAME")]
        username: String,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["dtalks.toml", "config/dtalks.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            chats,
            user_id,
            username,
        } => {
            let user = UserIdentity {
                id: user_id,
                username,
            };
            run_client(config, user, chats).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass -c/--config or create one of {DEFAULT_CONFIG_PATHS:?}"
    )
    .into())
}

async fn run_client(
    config: ClientConfig,
    user: UserIdentity,
    chats: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = ChatClient::connect(&config, user).await?;
    let mut events = client.session().events();

    for chat_id in &chats {
        let channel = client.open_chat(chat_id).await?;
        info!(%channel, "Following chat");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, logging out...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, logging out...");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::LinkStateChanged(LinkState::Failed)) => {
                    error!("Broker link failed permanently, logging out...");
                    break;
                }
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.logout().await?;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::MessageReceived { channel, message } => info!(
            %channel,
            sender = %message.sender_username,
            content = message.content.as_deref().unwrap_or(""),
            "Message"
        ),
        SessionEvent::TypingChanged {
            channel,
            username,
            is_typing,
            ..
        } => info!(%channel, %username, is_typing, "Typing"),
        SessionEvent::PresenceChanged {
            username,
            is_online,
            ..
        } => info!(%username, is_online, "Presence"),
        other => info!(event = ?other, "Session event"),
    }
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    Ok(())
}
