//! Connection manager with automatic reconnection

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use devmgmt_shared::codec::{encode_frame, FrameReader};
use devmgmt_shared::timeouts::{AGENT_MAX_RECONNECT_DELAY_MS, AGENT_RECONNECT_DELAY_MS};
use devmgmt_shared::DeviceEnvelope;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connected and announced to the server
    Connected { server: String },
    Disconnected { reason: String },
    /// Envelope received from the server
    Received(DeviceEnvelope),
    /// A connection attempt failed; another follows after the backoff
    ConnectionFailed { reason: String, retry_in: Duration },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub tenant_id: String,
    /// Client id this device announces itself with
    pub device_id: String,
    pub server_addr: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tenant_id: "1".into(),
            device_id: "gw-001".into(),
            server_addr: "127.0.0.1:7400".into(),
            reconnect_delay: Duration::from_millis(AGENT_RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(AGENT_MAX_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Keeps a connection to the server alive and exposes it as channels
pub struct ConnectionManager {
    config: ConnectionConfig,
    outbound_tx: mpsc::Sender<DeviceEnvelope>,
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<DeviceEnvelope>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);

        let loop_config = config.clone();
        tokio::spawn(async move {
            connection_loop(loop_config, outbound_rx, event_tx).await;
        });

        Self {
            config,
            outbound_tx,
            event_rx,
        }
    }

    pub async fn send(&self, envelope: DeviceEnvelope) -> Result<()> {
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| anyhow!("Connection closed"))
    }

    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Sender for replies produced off the main loop
    pub fn sender(&self) -> mpsc::Sender<DeviceEnvelope> {
        self.outbound_tx.clone()
    }
}

async fn connection_loop(
    config: ConnectionConfig,
    mut outbound_rx: mpsc::Receiver<DeviceEnvelope>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, TcpStream::connect(&config.server_addr)).await {
            Ok(Ok(stream)) => {
                reconnect_delay = config.reconnect_delay;
                let reason = match handle_connection(stream, &config, &mut outbound_rx, &event_tx).await {
                    Ok(()) => return,
                    Err(e) => e.to_string(),
                };
                if event_tx.send(ConnectionEvent::Disconnected { reason }).await.is_err() {
                    return;
                }
            }
            Ok(Err(e)) => {
                let event = ConnectionEvent::ConnectionFailed {
                    reason: e.to_string(),
                    retry_in: reconnect_delay,
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(_) => {
                let event = ConnectionEvent::ConnectionFailed {
                    reason: format!("connect timed out after {:?}", config.connect_timeout),
                    retry_in: reconnect_delay,
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// Drive one connection; Ok means the agent is shutting down
async fn handle_connection(
    stream: TcpStream,
    config: &ConnectionConfig,
    outbound_rx: &mut mpsc::Receiver<DeviceEnvelope>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let birth = DeviceEnvelope::birth(&config.tenant_id, &config.device_id);
    writer.write_all(&encode_frame(&birth)?).await?;
    if event_tx
        .send(ConnectionEvent::Connected {
            server: config.server_addr.clone(),
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    let mut frames = FrameReader::new();
    let mut read_buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else {
                    return Ok(());
                };
                writer.write_all(&encode_frame(&envelope)?).await?;
            }

            read = reader.read_buf(&mut read_buf) => {
                if read? == 0 {
                    return Err(anyhow!("Server closed connection"));
                }
                frames.extend(&read_buf);
                read_buf.clear();

                loop {
                    match frames.next_envelope() {
                        Ok(Some(envelope)) => {
                            if event_tx.send(ConnectionEvent::Received(envelope)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Undecodable frame from server");
                            return Err(e.into());
                        }
                    }
                }
                debug!(buffered = frames.buffered_len(), "Frames drained");
            }
        }
    }
}
