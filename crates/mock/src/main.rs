//! Mock control-plane server binary
//!
//! Usage: `mock-core <port> [config_file]`

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use harness_mock::{MockServerConfig, MockState};

#[derive(Parser, Debug)]
#[command(name = "mock-core")]
#[command(about = "Mock control-plane server for agent server tests")]
#[command(version)]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Start config loaded before serving
    config_file: Option<PathBuf>,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Latency of the /tests/simple endpoint in milliseconds
    #[arg(long, default_value = "1000")]
    liveness_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let state = match &cli.config_file {
        Some(path) => MockState::from_start_config(path)?,
        None => MockState::new(),
    };

    let cfg = MockServerConfig {
        liveness_delay: Duration::from_millis(cli.liveness_delay_ms),
    };

    let addr = SocketAddr::new(cli.host, cli.port);
    info!("Starting mock control plane on http://{}", addr);

    harness_mock::server::serve(addr, state, cfg).await
}
