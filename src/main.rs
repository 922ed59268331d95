//! Server executable: one cluster member, selected by its index into the
//! shared server list.

use clap::Parser;
use dismem::config::{
    ClusterConfig, DEFAULT_CACHE_SIZE, DEFAULT_MEMORY_SIZE, DEFAULT_SERVERS,
};
use dismem::server::Server;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "dismem", version, about = "Distributed shared memory server")]
struct Args {
    /// Index of this server in the server list
    #[arg(short, long)]
    index: usize,

    /// Comma-separated host:port list, identical on every cluster member
    #[arg(short, long, default_value_t = DEFAULT_SERVERS.join(","))]
    servers: String,

    /// Total addressable cells across the cluster
    #[arg(short, long, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory_size: i64,

    /// Slots in the direct-mapped cache of remote addresses
    #[arg(short, long, default_value_t = DEFAULT_CACHE_SIZE)]
    cache_size: usize,

    /// Outbound peer connect timeout in seconds
    #[arg(long, default_value_t = 5)]
    connection_timeout: u64,

    /// Default lease on remote lock acquisitions, in seconds
    #[arg(long, default_value_t = 3)]
    lease_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dismem=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let servers = match ClusterConfig::parse_servers(&args.servers) {
        Ok(servers) => servers,
        Err(e) => {
            error!("invalid server list: {e}");
            return;
        }
    };

    let config = match ClusterConfig::new(
        servers,
        args.memory_size,
        args.cache_size,
        Duration::from_secs(args.connection_timeout),
        Duration::from_secs(args.lease_timeout),
    ) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid configuration: {e}");
            return;
        }
    };

    let server = match Server::new(Arc::clone(&config), args.index) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to build server: {e}");
            return;
        }
    };

    info!("dismem v{VERSION}");
    info!(
        server = %server.address(),
        members = config.server_count(),
        memory_size = config.memory_size(),
        cache_size = config.cache_size(),
        "starting cluster member {}",
        args.index
    );

    if let Err(e) = server.run().await {
        error!("server terminated: {e}");
    }
}
