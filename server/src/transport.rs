//! Outbound transport seam

use async_trait::async_trait;
use devmgmt_shared::codec::CodecError;
use devmgmt_shared::{DeviceEnvelope, DeviceTopic};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Failed to frame envelope: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Publishes envelopes to devices; delivery is at-least-once at best
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn publish(&self, topic: &DeviceTopic, envelope: &DeviceEnvelope) -> Result<(), TransportError>;
}
