// Meridian controller node binary.
//
// Parses the replica settings from flags/env, initializes logging, and runs
// the controller until ctrl-c. Startup configuration errors (this node
// missing from the connection string, a rejected join) exit nonzero.

use std::io::IsTerminal;
use std::time::Duration;

use clap::Parser;

use meridian_controller::config::ControllerSettings;

#[derive(Debug, Parser)]
#[command(name = "meridian-controller", about = "Meridian controller-plane node")]
struct Args {
    /// Comma-separated `host:port` list naming every controller replica.
    /// Doubles as the cluster identity: peers with a different list are
    /// refused.
    #[arg(long, env = "MERIDIAN_CONNECTION_STRING")]
    connection_string: String,

    /// Hostname this replica advertises; `node_name:port` must appear in the
    /// connection string.
    #[arg(long, env = "MERIDIAN_NODE_NAME")]
    node_name: String,

    #[arg(long, env = "MERIDIAN_PORT")]
    port: u16,

    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, env = "MERIDIAN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Chunk split threshold the primary advertises to storage nodes.
    #[arg(long, env = "MERIDIAN_MAX_CHUNK_ITEM_COUNT", default_value_t = 100_000)]
    max_chunk_item_count: u32,

    #[arg(long, env = "MERIDIAN_REDUNDANT_NODES_PER_LOCATION", default_value_t = 1)]
    redundant_nodes_per_location: u32,

    /// Reserved for the web console; carried in settings but unused here.
    #[arg(long, env = "MERIDIAN_WEB_INTERFACE_PORT", default_value_t = 0)]
    web_interface_port: u16,

    /// Lower bound for the randomized reconciler interval (ms).
    #[arg(long, env = "MERIDIAN_RECONCILE_MIN_MS", default_value_t = 30_000)]
    reconcile_min_ms: u64,

    /// Upper bound for the randomized reconciler interval (ms).
    #[arg(long, env = "MERIDIAN_RECONCILE_MAX_MS", default_value_t = 120_000)]
    reconcile_max_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let settings = ControllerSettings {
        connection_string: args.connection_string,
        node_name: args.node_name,
        port: args.port,
        log_level: args.log_level,
        max_chunk_item_count: args.max_chunk_item_count,
        redundant_nodes_per_location: args.redundant_nodes_per_location,
        web_interface_port: args.web_interface_port,
        reconcile_min: Duration::from_millis(args.reconcile_min_ms),
        reconcile_max: Duration::from_millis(args.reconcile_max_ms),
    };

    meridian_controller::run_controller_with_shutdown(settings, tokio::signal::ctrl_c()).await
}
