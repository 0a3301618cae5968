//! tandem-server: serves the messenger or the media service over TCP.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tandem_server::config::{Overrides, ServerConfig, DEFAULT_CONFIG_PATH};
use tandem_server::services::{MediaService, MessengerService};
use tandem_server::{Dispatcher, Handler};
use tracing::{error, info};

const MESSENGER_PORT: u16 = 8080;
const MEDIA_PORT: u16 = 8081;

/// tandem-server: RPC service host
#[derive(Parser, Debug)]
#[command(name = "tandem-server", version, about = "tandem RPC service host")]
struct Cli {
    #[command(subcommand)]
    service: Service,

    /// Config file path
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Service {
    /// Run the messenger service (default port 8080)
    Messenger(CommonArgs),
    /// Run the media streaming service (default port 8081)
    Media {
        #[command(flatten)]
        common: CommonArgs,

        /// Directory holding the media files
        #[arg(short = 'd', long)]
        root_dir: Option<String>,

        /// Frame rate reported to clients
        #[arg(long)]
        frame_rate: Option<f64>,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum concurrent requests per connection
    #[arg(long)]
    max_in_flight: Option<usize>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let (name, default_port, cli_overrides) = match &cli.service {
        Service::Messenger(common) => ("messenger", MESSENGER_PORT, overrides(common, None, None)),
        Service::Media {
            common,
            root_dir,
            frame_rate,
        } => (
            "media",
            MEDIA_PORT,
            overrides(common, root_dir.clone(), *frame_rate),
        ),
    };

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), default_port, &cli_overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = name,
        port = config.port,
        "starting tandem-server"
    );

    match cli.service {
        Service::Messenger(_) => run(MessengerService::with_config(config.messenger.clone()), config).await,
        Service::Media { .. } => match MediaService::new(config.media.clone()) {
            Ok(service) => run(service, config).await,
            Err(e) => {
                error!(error = %e, root = %config.media.root_dir.display(), "failed to open media library");
                std::process::exit(1);
            }
        },
    }

    info!("tandem-server stopped");
}

fn overrides(common: &CommonArgs, root_dir: Option<String>, frame_rate: Option<f64>) -> Overrides {
    Overrides {
        port: common.port,
        max_in_flight: common.max_in_flight,
        root_dir,
        frame_rate,
    }
}

/// Serve `handler` until the listener fails or a shutdown signal arrives.
async fn run<H: Handler>(handler: H, config: ServerConfig) {
    let dispatcher = Dispatcher::new(handler, config.dispatcher);

    tokio::select! {
        result = dispatcher.listen(config.port) => {
            if let Err(e) = result {
                error!(error = %e, port = config.port, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
