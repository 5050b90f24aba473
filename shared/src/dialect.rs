//! Binary device dialect
//!
//! Protobuf messages exchanged with device agents. A message is an envelope
//! with a channel (routing and correlation headers) and a payload (timestamp,
//! typed metrics, raw body).

use prost::Message;
use std::fmt;

/// Metric a device uses to explain a rejected request
pub const EXCEPTION_MESSAGE_METRIC: &str = "response.exception.message";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageClass {
    Unspecified = 0,
    Birth = 1,
    Request = 2,
    Response = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetricKind {
    Unspecified = 0,
    Text = 1,
    Int32 = 2,
    Int64 = 3,
    Double = 4,
    Boolean = 5,
    Blob = 6,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceChannel {
    #[prost(enumeration = "MessageClass", tag = "1")]
    pub message_class: i32,

    #[prost(string, tag = "2")]
    pub tenant_id: String,

    #[prost(string, tag = "3")]
    pub client_id: String,

    #[prost(string, tag = "4")]
    pub app_name: String,

    #[prost(string, tag = "5")]
    pub app_version: String,

    /// Device-side method naming (GET, POST, PUT, DEL, EXEC, OPTIONS)
    #[prost(string, tag = "6")]
    pub method: String,

    #[prost(string, repeated, tag = "7")]
    pub resource: Vec<String>,

    #[prost(string, tag = "8")]
    pub requester: String,

    #[prost(string, tag = "9")]
    pub request_id: String,

    #[prost(string, tag = "10")]
    pub username: String,

    #[prost(string, tag = "11")]
    pub client_ip: String,

    #[prost(string, tag = "12")]
    pub connection_id: String,

    #[prost(uint32, tag = "13")]
    pub result_code: u32,

    #[prost(string, tag = "14")]
    pub error_code: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetric {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(enumeration = "MetricKind", tag = "2")]
    pub kind: i32,

    #[prost(string, tag = "3")]
    pub text_value: String,

    #[prost(int64, tag = "4")]
    pub int_value: i64,

    #[prost(double, tag = "5")]
    pub double_value: f64,

    #[prost(bool, tag = "6")]
    pub bool_value: bool,

    #[prost(bytes = "vec", tag = "7")]
    pub blob_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DevicePayload {
    /// Milliseconds since the Unix epoch, 0 when the device did not stamp it
    #[prost(int64, tag = "1")]
    pub timestamp_ms: i64,

    #[prost(message, repeated, tag = "2")]
    pub metrics: Vec<DeviceMetric>,

    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub channel: Option<DeviceChannel>,

    #[prost(message, optional, tag = "2")]
    pub payload: Option<DevicePayload>,
}

/// Direction segment of a device topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicDirection {
    Birth,
    Request,
    Reply,
}

impl TopicDirection {
    fn as_str(&self) -> &'static str {
        match self {
            TopicDirection::Birth => "BIRTH",
            TopicDirection::Request => "REQ",
            TopicDirection::Reply => "REPLY",
        }
    }
}

/// Publish/subscribe address: `{tenant}/{client}/{app}/{direction}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceTopic {
    pub tenant_id: String,
    pub client_id: String,
    pub app_name: String,
    pub direction: TopicDirection,
}

impl DeviceTopic {
    pub fn request(channel: &DeviceChannel) -> Self {
        Self {
            tenant_id: channel.tenant_id.clone(),
            client_id: channel.client_id.clone(),
            app_name: channel.app_name.clone(),
            direction: TopicDirection::Request,
        }
    }

    pub fn reply(channel: &DeviceChannel) -> Self {
        Self {
            direction: TopicDirection::Reply,
            ..Self::request(channel)
        }
    }

    /// Parse a topic string, returning None when it is not a device topic
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() != 4 || parts[..3].iter().any(|p| p.is_empty()) {
            return None;
        }
        let direction = match parts[3] {
            "BIRTH" => TopicDirection::Birth,
            "REQ" => TopicDirection::Request,
            "REPLY" => TopicDirection::Reply,
            _ => return None,
        };
        Some(Self {
            tenant_id: parts[0].to_string(),
            client_id: parts[1].to_string(),
            app_name: parts[2].to_string(),
            direction,
        })
    }
}

impl fmt::Display for DeviceTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id,
            self.client_id,
            self.app_name,
            self.direction.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_display_and_parse() {
        let topic = DeviceTopic {
            tenant_id: "1".into(),
            client_id: "gw-01".into(),
            app_name: "DEPLOY-V2".into(),
            direction: TopicDirection::Request,
        };
        assert_eq!(topic.to_string(), "1/gw-01/DEPLOY-V2/REQ");
        assert_eq!(DeviceTopic::parse("1/gw-01/DEPLOY-V2/REQ"), Some(topic));
    }

    #[test]
    fn test_topic_parse_rejects_garbage() {
        assert!(DeviceTopic::parse("1/gw-01/REQ").is_none());
        assert!(DeviceTopic::parse("1//APP/REQ").is_none());
        assert!(DeviceTopic::parse("1/gw/APP/SOMETHING").is_none());
    }

    #[test]
    fn test_message_class_conversion() {
        assert_eq!(MessageClass::try_from(3).ok(), Some(MessageClass::Response));
        assert!(MessageClass::try_from(42).is_err());
    }
}
