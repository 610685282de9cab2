use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pagelink_core::args::optional_arg;
use pagelink_core::{sync_fn, PageKey};
use pagelink_server::{Bridge, Connection, ServerConfig};
use pagelink_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use serde_json::Value;
use tokio::sync::Notify;

/// Serve host functions to browser pages over a websocket.
#[derive(Debug, Parser)]
#[command(name = "pagelink", version)]
struct Args {
    /// JSON config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Default log level (RUST_LOG wins when set).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON.
    #[arg(long, default_value_t = false)]
    pretty: bool,

    /// Peer function to call once the first page connects.
    #[arg(long)]
    call_on_connect: Option<String>,

    /// Keep running after the last page closes.
    #[arg(long, default_value_t = false)]
    stay_alive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = TelemetryConfig {
        log_level: args.log_level.parse().context("invalid --log-level")?,
        format: if args.pretty {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        },
        ..Default::default()
    };
    init_telemetry(&telemetry).context("failed to initialize logging")?;

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let all_closed = Arc::new(Notify::new());
    let notify = Arc::clone(&all_closed);
    let stay_alive = args.stay_alive;

    let bridge = Bridge::builder()
        .config(config)
        .remote_functions(args.call_on_connect.iter().cloned())
        .close_handler(move |page: &PageKey, remaining: &[Arc<Connection>]| {
            tracing::info!(page_key = %page, remaining = remaining.len(), "Page closed");
            if remaining.is_empty() && !stay_alive {
                notify.notify_one();
            }
        })
        .build()?;

    expose_demo_functions(&bridge)?;

    let handle = pagelink_server::start(bridge.clone())
        .await
        .context("failed to start server")?;
    tracing::info!(
        addr = %handle.addr,
        functions = ?bridge.exposed_names(),
        "Pagelink ready"
    );

    if let Some(name) = args.call_on_connect {
        tokio::spawn(call_when_connected(bridge.clone(), name));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl+c")?;
            tracing::info!("Interrupted");
        }
        _ = all_closed.notified() => {
            tracing::info!("Last page closed");
        }
    }

    tracing::info!("Shutting down");
    handle.shutdown();
    Ok(())
}

fn expose_demo_functions(bridge: &Bridge) -> anyhow::Result<()> {
    bridge.expose("host_random", sync_fn(|_| Ok(rand::random::<f64>())))?;
    bridge.expose(
        "host_fail",
        sync_fn(|args: Vec<Value>| {
            let fail: bool = optional_arg(&args, 0)?.unwrap_or(true);
            if fail {
                anyhow::bail!("host_fail was asked to fail");
            }
            Ok("did not fail")
        }),
    )?;
    bridge.expose("echo", sync_fn(|args: Vec<Value>| Ok(args)))?;
    Ok(())
}

async fn call_when_connected(bridge: Bridge, name: String) {
    if !bridge.wait_for_connection(Duration::from_secs(300)).await {
        tracing::warn!(function = %name, "No page connected, skipping call");
        return;
    }
    let Some(remote) = bridge.remote(&name) else {
        return;
    };
    match remote.call(Vec::new()).await.wait().await {
        Some(Ok(value)) => tracing::info!(function = %name, %value, "Peer call returned"),
        Some(Err(err)) => tracing::warn!(function = %name, error = %err, "Peer call failed"),
        None => tracing::warn!(function = %name, "Peer call timed out"),
    }
}
