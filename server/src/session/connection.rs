//! One device agent connection

use devmgmt_shared::codec::{self, FrameReader};
use devmgmt_shared::{DeviceEnvelope, MessageClass};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transport::TransportError;

/// Cloneable write side of a session
#[derive(Clone)]
pub struct SessionHandle {
    pub tenant_id: String,
    pub client_id: String,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
}

impl SessionHandle {
    pub async fn send(&self, envelope: &DeviceEnvelope) -> Result<(), TransportError> {
        let frame = codec::encode_frame(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(())
    }
}

/// Reading side of a connection; the device is anonymous until its BIRTH
pub struct DeviceSession {
    addr: SocketAddr,
    reader: ReadHalf<TcpStream>,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    frames: FrameReader,
    read_buf: Vec<u8>,
    connected_at: Instant,
    handle: Option<SessionHandle>,
}

impl DeviceSession {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            addr,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            frames: FrameReader::new(),
            read_buf: vec![0u8; 4096],
            connected_at: Instant::now(),
            handle: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handle for sending, available once the device announced itself
    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    /// Next envelope from the device, None once the connection is done
    pub async fn recv(&mut self) -> Option<DeviceEnvelope> {
        loop {
            match self.frames.next_envelope() {
                Ok(Some(envelope)) => {
                    self.identify(&envelope);
                    return Some(envelope);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "Dropping connection on bad frame");
                    return None;
                }
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.frames.extend(&self.read_buf[..n]),
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "Read error");
                    return None;
                }
            }
        }
    }

    fn identify(&mut self, envelope: &DeviceEnvelope) {
        if self.handle.is_some() || envelope.class() != MessageClass::Birth {
            return;
        }
        let Some(channel) = &envelope.channel else {
            return;
        };
        if channel.tenant_id.is_empty() || channel.client_id.is_empty() {
            warn!(addr = %self.addr, "BIRTH without tenant or client id ignored");
            return;
        }
        debug!(addr = %self.addr, tenant_id = %channel.tenant_id, client_id = %channel.client_id, "Device identified");
        self.handle = Some(SessionHandle {
            tenant_id: channel.tenant_id.clone(),
            client_id: channel.client_id.clone(),
            addr: self.addr,
            connected_at: self.connected_at,
            writer: self.writer.clone(),
        });
    }
}
