use anyhow::Result;
use clap::{Parser, Subcommand};
use meshd::config::{MeshConfig, Overrides};
use meshd::Broker;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "meshd",
    about = "Research mesh broker — routes tasks across worker agents over WebSocket JSON-RPC",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Broker bind host
    #[arg(long, env = "MESHD_HOST")]
    host: Option<String>,

    /// Broker bind port
    #[arg(long, env = "MESHD_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MESHD_LOG")]
    log: Option<String>,

    /// Directory for the JSON event and log file sinks. Optional.
    #[arg(long, env = "MESHD_LOG_PATH")]
    log_path: Option<PathBuf>,

    /// Path to a meshd.toml config file
    #[arg(long, env = "MESHD_CONFIG")]
    config: Option<PathBuf>,

    /// Load balance strategy (round_robin, least_loaded, fastest,
    /// healthiest, adaptive)
    #[arg(long, env = "MESHD_STRATEGY")]
    strategy: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker server (default when no subcommand given).
    ///
    /// Runs meshd in the foreground until SIGINT or SIGTERM.
    ///
    /// Examples:
    ///   meshd serve
    ///   meshd
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = MeshConfig::new(
        Overrides {
            host: args.host.clone(),
            port: args.port,
            log: args.log.clone(),
            log_path: args.log_path.clone(),
            strategy: args.strategy.clone(),
        },
        args.config.as_deref(),
    );

    // Keep the appender guard alive for the lifetime of the process.
    let _guard = init_tracing(&config);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: MeshConfig) -> Result<()> {
    let broker = Broker::new(config);
    // Bind failure is the one fatal startup error: propagate for a
    // non-zero exit.
    let addr = broker.start().await?;
    info!(addr = %addr, "meshd running — press Ctrl-C to stop");

    wait_for_shutdown().await;
    broker.shutdown().await;
    // Bounded drain so per-connection writers can flush before exit.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C; elsewhere Ctrl-C only.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

fn init_tracing(config: &MeshConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_path {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "meshd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
