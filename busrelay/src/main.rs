//! BusRelay daemon
//!
//! Loads configuration, wires a relay service to a loopback broker and a
//! line-delimited socket endpoint, and runs until interrupted. A real
//! deployment substitutes a broker driver for the loopback transports.

use anyhow::Context;
use busrelay_connector::transport::inproc::{InProcBroker, InProcTransport};
use busrelay_connector::{LineSocketServer, RelayService, SocketConsumer};
use busrelay_core::logging::init_logging;
use busrelay_core::{load_config, Config};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Resource id when none is configured: hostname plus a random suffix,
/// so restarts look like a new sibling rather than a stale one.
fn generate_resource() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{host}-{}", nanoid::nanoid!(6))
}

fn resource_id(config: &Config) -> String {
    if config.node.resource.is_empty() {
        generate_resource()
    } else {
        config.node.resource.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("config error: {error}");
        }
        anyhow::bail!("Invalid configuration ({} problems)", errors.len());
    }

    init_logging(&config.logging)?;
    let resource = resource_id(&config);
    info!(node = %config.node.name, resource = %resource, "BusRelay starting");

    // Loopback broker: everything published comes back on our own queue.
    let broker = InProcBroker::new();
    broker.bind(&config.bus.queue, "#");

    let (egress_tx, _) = broadcast::channel(1024);
    let service = RelayService::start(
        &config,
        &resource,
        InProcTransport::publisher(broker.clone()),
        InProcTransport::consumer(broker.clone(), &config.bus.queue),
        SocketConsumer::new(egress_tx.clone()),
    )
    .await?;

    let socket_cancel = CancellationToken::new();
    let server = LineSocketServer::bind(
        &config.node.listen,
        service.ingress(),
        egress_tx,
        socket_cancel.clone(),
    )
    .await
    .with_context(|| format!("Failed to bind socket endpoint at {}", config.node.listen))?;
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    socket_cancel.cancel();
    let _ = server_task.await;
    service.shutdown().await?;
    Ok(())
}
