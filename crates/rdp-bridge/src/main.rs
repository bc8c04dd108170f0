use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use rdp_bridge::Bridge;
use rdp_config::BridgeConfig;

/// Bridge to a remote debuggee speaking the remote debugging protocol.
///
/// Connects, attaches to the first tab's thread and keeps the coordinators
/// running until interrupted or disconnected.
#[derive(Debug, Parser)]
#[command(name = "rdp-bridge", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `RDP_BRIDGE_CONFIG` is used as a fallback. When neither are
    /// provided the bridge uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debuggee host, overriding the config file.
    #[arg(long)]
    host: Option<String>,

    /// Debuggee port, overriding the config file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config);
    if let Some(host) = cli.host {
        config.connection.host = host;
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    rdp_config::init_tracing_with_config(&config);

    let bridge = Bridge::attach(&config).await.with_context(|| {
        format!(
            "failed to attach to {}:{}",
            config.connection.host, config.connection.port
        )
    })?;

    let mut changes = bridge.subscribe_breakpoint_changes();
    let interrupted = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break true,
            _ = bridge.closed() => break false,
            change = changes.recv() => {
                if let Ok(change) = change {
                    tracing::info!(
                        target: "rdp.bridge",
                        id = change.id,
                        verified = change.verified,
                        line = ?change.line,
                        "breakpoint changed"
                    );
                }
            }
        }
    };

    if interrupted {
        tracing::info!(target: "rdp.bridge", "interrupted, detaching");
        bridge.detach().await.context("failed to detach")?;
    } else {
        tracing::info!(target: "rdp.bridge", "debuggee disconnected");
    }
    Ok(())
}

fn load_config(cli_path: Option<PathBuf>) -> BridgeConfig {
    let path = cli_path.or_else(|| std::env::var_os("RDP_BRIDGE_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return BridgeConfig::default();
    };

    match BridgeConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "rdp-bridge: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            BridgeConfig::default()
        }
    }
}
