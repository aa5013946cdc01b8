//! Phantom Portal - SSH Tunnel Manager
//!
//! This is the main entry point for the Phantom Portal application.

use anyhow::Result;
use clap::Parser;
use phantom_portal::config::{load_config, resolve_config_path, TunnelConfig, DEFAULT_ENV_PREFIX};
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Phantom Portal - SSH tunnels with local forwarding and SOCKS5 gateways
#[derive(Parser, Debug)]
#[command(name = "phantom-portal")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (falls back to $PHANTOM_CONFIG_FILE, then config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also load one tunnel from <PREFIX>_* environment variables
    #[arg(short, long, num_args = 0..=1, default_missing_value = DEFAULT_ENV_PREFIX)]
    env_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    info!("Phantom Portal v{}", phantom_portal::VERSION);

    let tunnels = load_tunnels(&args)?;
    if tunnels.is_empty() {
        anyhow::bail!("No tunnels configured");
    }

    run(tunnels).await
}

fn load_tunnels(args: &Args) -> Result<Vec<TunnelConfig>> {
    let path = resolve_config_path(args.config.clone());
    let mut tunnels = Vec::new();

    match load_config(&path) {
        Ok(config) => {
            info!("Configuration loaded from: {:?}", path);
            tunnels.extend(config.into_tunnels());
        }
        // A missing default file is fine when the environment supplies a tunnel
        Err(e) if args.config.is_none() && args.env_prefix.is_some() => {
            warn!("{:#}", e);
        }
        Err(e) => return Err(e),
    }

    if let Some(prefix) = &args.env_prefix {
        match TunnelConfig::from_env(prefix)? {
            Some(tunnel) => tunnels.push(tunnel),
            None => warn!("{}_USE_SSH is not \"true\", no tunnel loaded from environment", prefix),
        }
    }

    Ok(tunnels)
}

#[cfg(feature = "ssh")]
async fn run(tunnels: Vec<TunnelConfig>) -> Result<()> {
    use phantom_portal::helper::endpoint;
    use phantom_portal::registry::TunnelRegistry;
    use phantom_portal::transport::SshTransport;
    use std::sync::Arc;

    let registry = TunnelRegistry::new(Arc::new(SshTransport::new()));
    let total = tunnels.len();

    for tunnel in tunnels {
        let name = tunnel.tunnel_name();
        if let Err(e) = tunnel.validate() {
            error!(tunnel = %name, "Skipping invalid tunnel: {}", e);
            continue;
        }
        if let Err(e) = registry.create_tunnel(tunnel).await {
            error!(tunnel = %name, "Failed to start tunnel: {}", e);
        }
    }

    let all = registry.get_all_tunnels().await;
    for summary in &all {
        let config = registry
            .get_tunnel(Some(summary.name.as_str()))
            .await
            .map(|session| session.config().clone());
        let socks5 = config
            .as_ref()
            .and_then(|c| c.socks5_endpoint().ok().flatten())
            .map(|(host, port)| endpoint(&host, port));
        let dynamic = config
            .as_ref()
            .and_then(|c| c.dynamic_socks5_endpoint().ok().flatten())
            .map(|(host, port)| endpoint(&host, port));

        info!(
            tunnel = %summary.name,
            local = %endpoint(&summary.info.local_host, summary.info.local_port),
            remote = %endpoint(&summary.info.remote_host, summary.info.remote_port),
            socks5 = ?socks5,
            dynamic_socks5 = ?dynamic,
            "{}",
            if summary.info.is_active { "ONLINE" } else { "OFFLINE" }
        );
    }
    let active = registry.get_active_tunnels().await.len();
    info!("{}/{} tunnels active", active, total);

    wait_for_shutdown().await;

    registry.close_all_tunnels().await;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(not(feature = "ssh"))]
async fn run(_tunnels: Vec<TunnelConfig>) -> Result<()> {
    anyhow::bail!("built without the \"ssh\" feature; no secure transport available")
}

/// Wait for Ctrl+C, or SIGTERM on unix
#[cfg_attr(not(feature = "ssh"), allow(dead_code))]
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Setup logging based on configuration
///
/// `RUST_LOG`, when set, takes precedence over `--log-level`.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
