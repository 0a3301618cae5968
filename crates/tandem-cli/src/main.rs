//! tandem: command-line client for the messenger and media services.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::messenger::Credentials;
use commands::Endpoint;
use std::path::PathBuf;
use tracing::error;

/// tandem: RPC client
#[derive(Parser)]
#[command(name = "tandem", version, about = "Client for the tandem messenger and media services")]
struct Cli {
    /// Server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port (defaults to the service's configured port)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Reach the server through the relay proxy listening on this port
    #[arg(long, global = true)]
    proxy_port: Option<u16>,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Media streaming service
    #[command(subcommand)]
    Media(MediaCommand),

    /// Messenger service
    #[command(subcommand)]
    Messenger(MessengerCommand),
}

#[derive(Subcommand)]
enum MediaCommand {
    /// List available media files
    List,

    /// Stream a file to completion and save its frames
    Fetch {
        /// Media file name as listed by `media list`
        file: String,
        /// Output path (defaults to the file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MessengerCommand {
    /// Check whether a username is free
    Available { name: String },

    /// Create an account
    Signup { user: String, password: String },

    /// Show a user's inbox
    Inbox {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        password: String,
    },

    /// Send a message
    Send {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        password: String,
        to: String,
        text: String,
    },

    /// Read the latest messages with a contact
    Read {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        password: String,
        contact: String,
        /// Number of messages (0 = all)
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("tandem=debug,tandem_cli=debug,tandem_client=debug,tandem_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("tandem=warn,tandem_cli=warn")
            .with_target(false)
            .init();
    }

    let config_path = cli.config.clone().unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".tandem").join("config.toml")
    });
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("tandem: {e:#}");
            std::process::exit(1);
        }
    };
    let client_config = cfg.client_config();

    let host = cli.host.clone().unwrap_or_else(|| cfg.client.host.clone());
    let endpoint = |default_port: u16| Endpoint {
        host: host.clone(),
        port: cli.port.unwrap_or(default_port),
        proxy_port: cli.proxy_port,
    };

    let result = match cli.command {
        Command::Media(command) => {
            let endpoint = endpoint(cfg.client.media_port);
            match command {
                MediaCommand::List => commands::media::run_list(&endpoint, client_config).await,
                MediaCommand::Fetch { file, output } => {
                    commands::media::run_fetch(&endpoint, client_config, &file, output.as_deref()).await
                }
            }
        }
        Command::Messenger(command) => {
            let endpoint = endpoint(cfg.client.messenger_port);
            match command {
                MessengerCommand::Available { name } => {
                    commands::messenger::run_available(&endpoint, client_config, &name).await
                }
                MessengerCommand::Signup { user, password } => {
                    commands::messenger::run_signup(&endpoint, client_config, &user, &password).await
                }
                MessengerCommand::Inbox { user, password } => {
                    let creds = Credentials { user, password };
                    commands::messenger::run_inbox(&endpoint, client_config, &creds).await
                }
                MessengerCommand::Send {
                    user,
                    password,
                    to,
                    text,
                } => {
                    let creds = Credentials { user, password };
                    commands::messenger::run_send(&endpoint, client_config, &creds, &to, &text).await
                }
                MessengerCommand::Read {
                    user,
                    password,
                    contact,
                    count,
                } => {
                    let creds = Credentials { user, password };
                    commands::messenger::run_read(&endpoint, client_config, &creds, &contact, count).await
                }
            }
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("tandem: {e:#}");
        std::process::exit(1);
    }
}
