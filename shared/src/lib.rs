//! Shared device-management protocol types
//!
//! This crate provides the canonical request/response model, the binary
//! device dialect with its stream codec, and the job target state machine used
//! by both the management server and device agents.

pub mod codec;
pub mod dialect;
pub mod model;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

pub use dialect::*;
pub use model::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters shared by both ends of the protocol
pub mod timeouts {
    /// Reply deadline for a device request when nothing more specific applies
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

    /// How often the server sweeps expired pending calls
    pub const PENDING_SWEEP_INTERVAL_MS: u64 = 1_000;

    /// Delay before a device agent reconnects after losing the server
    pub const AGENT_RECONNECT_DELAY_MS: u64 = 1_000;

    /// Upper bound of the agent's reconnect backoff
    pub const AGENT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;
}

/// Builder helpers for dialect messages
impl DeviceEnvelope {
    /// Announcement a device sends right after connecting
    pub fn birth(tenant_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            channel: Some(DeviceChannel {
                message_class: MessageClass::Birth.into(),
                tenant_id: tenant_id.into(),
                client_id: client_id.into(),
                ..Default::default()
            }),
            payload: Some(DevicePayload {
                timestamp_ms: now_ms() as i64,
                ..Default::default()
            }),
        }
    }

    /// Message class, Unspecified when the channel is missing or unknown
    pub fn class(&self) -> MessageClass {
        self.channel
            .as_ref()
            .and_then(|c| MessageClass::try_from(c.message_class).ok())
            .unwrap_or(MessageClass::Unspecified)
    }
}

impl DeviceChannel {
    /// Channel of a reply to `request`, echoing its correlation headers
    pub fn reply_to(request: &DeviceChannel, result_code: u32) -> Self {
        Self {
            message_class: MessageClass::Response.into(),
            tenant_id: request.tenant_id.clone(),
            client_id: request.client_id.clone(),
            app_name: request.app_name.clone(),
            app_version: request.app_version.clone(),
            method: request.method.clone(),
            resource: request.resource.clone(),
            requester: request.requester.clone(),
            request_id: request.request_id.clone(),
            username: request.username.clone(),
            client_ip: request.client_ip.clone(),
            connection_id: request.connection_id.clone(),
            result_code,
            error_code: String::new(),
        }
    }
}

impl DeviceMetric {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Text.into(),
            text_value: value.into(),
            ..Default::default()
        }
    }

    pub fn int64(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Int64.into(),
            int_value: value,
            ..Default::default()
        }
    }

    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Boolean.into(),
            bool_value: value,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_birth_envelope() {
        let birth = DeviceEnvelope::birth("1", "gw-01");
        assert_eq!(birth.class(), MessageClass::Birth);
        let channel = birth.channel.unwrap();
        assert_eq!(channel.tenant_id, "1");
        assert_eq!(channel.client_id, "gw-01");
    }

    #[test]
    fn test_reply_echoes_request_headers() {
        let request = DeviceChannel {
            message_class: MessageClass::Request.into(),
            tenant_id: "1".into(),
            client_id: "gw-01".into(),
            app_name: "KEYS-V1".into(),
            method: "DEL".into(),
            request_id: "r-1".into(),
            requester: "job-engine".into(),
            ..Default::default()
        };
        let reply = DeviceChannel::reply_to(&request, 200);
        assert_eq!(reply.message_class, MessageClass::Response as i32);
        assert_eq!(reply.request_id, "r-1");
        assert_eq!(reply.requester, "job-engine");
        assert_eq!(reply.result_code, 200);
    }

    #[test]
    fn test_missing_channel_is_unspecified() {
        let envelope = DeviceEnvelope {
            channel: None,
            payload: None,
        };
        assert_eq!(envelope.class(), MessageClass::Unspecified);
    }
}
