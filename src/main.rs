mod command;
mod config;
mod connection;

use anyhow::Context;
use command::CommandExecutor;
use crate::config::AgentConfig;
use connection::{ConnectionEvent, ConnectionManager};
use devmgmt_shared::{DeviceEnvelope, MessageClass};
use std::sync::Arc;
use tokio::sync::mpsc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::from_env()
        .context("Failed to load configuration")?
        .connection_config();
    info!(tenant = %config.tenant_id, device = %config.device_id, server = %config.server_addr, "Device agent starting");

    let mut conn = ConnectionManager::new(config);
    let executor = Arc::new(CommandExecutor::new(conn.device_id()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = conn.recv() => match event {
                Some(ConnectionEvent::Connected { server }) => {
                    info!(server = %server, "Connected and announced");
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!(reason = %reason, "Disconnected");
                }
                Some(ConnectionEvent::ConnectionFailed { reason, retry_in }) => {
                    warn!(reason = %reason, retry_in_ms = retry_in.as_millis() as u64, "Connection failed");
                }
                Some(ConnectionEvent::Received(envelope)) => {
                    handle_server_message(envelope, executor.clone(), conn.sender());
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Each request runs on its own task and replies through the outbound queue
fn handle_server_message(
    envelope: DeviceEnvelope,
    executor: Arc<CommandExecutor>,
    sender: mpsc::Sender<DeviceEnvelope>,
) {
    if envelope.class() != MessageClass::Request {
        debug!(class = ?envelope.class(), "Unhandled message class");
        return;
    }

    tokio::spawn(async move {
        let Some(reply) = executor.execute(&envelope).await else {
            return;
        };
        if sender.send(reply).await.is_err() {
            error!("Failed to queue reply, connection closed");
        }
    });
}
