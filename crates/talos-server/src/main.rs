//! Talos control plane server binary.

use anyhow::Result;
use clap::Parser;
use talos_server::{Orchestrator, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cloud control plane for containerized IoT edge fleets.
#[derive(Debug, Parser)]
#[command(name = "talos-server", version)]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "TALOS_LISTEN", default_value = "0.0.0.0:3000")]
    listen: std::net::SocketAddr,

    /// Rollout monitor tick period, in seconds.
    #[arg(long, env = "TALOS_TICK_SECONDS", default_value_t = 30)]
    tick_seconds: u64,

    /// Mark devices offline after this many seconds without a poll.
    #[arg(long, env = "TALOS_OFFLINE_THRESHOLD_SECONDS", default_value_t = 600)]
    offline_threshold_seconds: u64,

    /// Image namespace prefixes exempt from registry admission.
    #[arg(long = "internal-prefix", env = "TALOS_INTERNAL_PREFIXES", value_delimiter = ',')]
    internal_prefixes: Vec<String>,

    /// Maximum concurrent health checks.
    #[arg(long, env = "TALOS_HEALTH_CONCURRENCY", default_value_t = 5)]
    health_concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talos=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut builder = ServerConfig::builder()
        .listen_addr(args.listen)
        .monitor_tick(std::time::Duration::from_secs(args.tick_seconds))
        .offline_threshold(std::time::Duration::from_secs(
            args.offline_threshold_seconds,
        ))
        .health_concurrency(args.health_concurrency);
    for prefix in args.internal_prefixes {
        builder = builder.internal_image_prefix(prefix);
    }

    Orchestrator::new(builder.build()).run().await
}
