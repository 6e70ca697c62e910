//! GraphQL exporter binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

use graphql_exporter::{Config, GraphqlCollector, HttpServer, HttpTransport, Pusher};

/// Export GraphQL query results as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "graphql-exporter")]
#[command(about = "Export GraphQL query results as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to the configuration file.
    #[arg(long = "config_path", default_value = "/etc/graphql-exporter/config.json")]
    config_path: String,

    /// Address to bind the scrape endpoint to.
    #[arg(long = "http_listen_address", default_value = "0.0.0.0:9353")]
    http_listen_address: String,

    /// Operating mode: `pull` serves /metrics, `push` posts to a gateway.
    #[arg(long = "mode", default_value = "pull")]
    mode: String,

    /// Push-gateway endpoint for push mode.
    #[arg(long = "push_endpoint", default_value = "localhost:1234")]
    push_endpoint: String,
}

/// `LOG_LEVEL` selects the verbosity; anything unrecognized keeps the
/// logger silent.
fn init_logging() {
    let level = match std::env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    };

    tracing_subscriber::fmt()
        .json()
        .with_max_level(level)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let config = Config::load(&args.config_path)?;
    info!(path = %args.config_path, "finished reading config");

    let transport = Arc::new(HttpTransport::new(
        config.graphql_url.clone(),
        config.custom_api_header.clone(),
        config.graphql_api_token.clone(),
        Duration::from_secs(config.query_timeout),
    )?);

    let collector = GraphqlCollector::new(&config, transport);
    let registry = prometheus::Registry::new();
    registry.register(Box::new(collector.clone()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let surface = if args.mode == "push" {
        let pusher = Pusher::new(registry, &args.push_endpoint, "graphql-exporter");
        tokio::spawn(async move {
            if let Err(err) = pusher.run(shutdown_rx).await {
                error!(error = %err, "pusher error");
            }
        })
    } else {
        let listen_addr: SocketAddr = args
            .http_listen_address
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
        let server = HttpServer::new(registry, listen_addr);
        tokio::spawn(async move {
            if let Err(err) = server.run(shutdown_rx).await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM, shutting down");
        }
    }

    shutdown_tx.send(true)?;
    let _ = tokio::time::timeout(Duration::from_secs(5), surface).await;

    info!("exporter stopped");
    Ok(())
}
