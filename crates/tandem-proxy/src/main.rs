//! tandem-proxy: relays clients to the upstream port named on their first line.

use clap::Parser;
use std::time::Duration;
use tandem_proxy::{ProxyConfig, RelayProxy};
use tracing::{error, info};

/// tandem-proxy: byte-transparent TCP relay
#[derive(Parser, Debug)]
#[command(name = "tandem-proxy", version, about = "Byte-transparent TCP relay")]
struct Cli {
    /// Listen port
    #[arg(short, long, default_value_t = 8090)]
    port: u16,

    /// Host the target ports are opened on
    #[arg(long, default_value = "127.0.0.1")]
    upstream_host: String,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 64)]
    max_connections: usize,

    /// Seconds a new client has to send its port line
    #[arg(long, default_value_t = 10)]
    port_line_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
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

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cli.port,
        "starting tandem-proxy"
    );

    let proxy = RelayProxy::new(ProxyConfig {
        upstream_host: cli.upstream_host,
        max_connections: cli.max_connections.max(1),
        port_line_timeout: Duration::from_secs(cli.port_line_timeout.max(1)),
        ..ProxyConfig::default()
    });

    tokio::select! {
        result = proxy.listen(cli.port) => {
            if let Err(e) = result {
                error!(error = %e, "proxy error");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    info!("tandem-proxy stopped");
}
