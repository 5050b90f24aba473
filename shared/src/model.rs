//! Canonical device-management model
//!
//! Every device dialect is translated to and from these types. Nothing in here
//! knows about wire formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Raised when a method name is neither canonical nor a known device alias
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown method name: '{0}'")]
pub struct UnknownMethod(pub String);

/// Canonical request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Read,
    Create,
    Write,
    Delete,
    Execute,
    Options,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Read,
        Method::Create,
        Method::Write,
        Method::Delete,
        Method::Execute,
        Method::Options,
    ];

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Read => "READ",
            Method::Create => "CREATE",
            Method::Write => "WRITE",
            Method::Delete => "DELETE",
            Method::Execute => "EXECUTE",
            Method::Options => "OPTIONS",
        }
    }

    /// Name used on the device side of the wire
    pub fn device_alias(&self) -> &'static str {
        match self {
            Method::Read => "GET",
            Method::Create => "POST",
            Method::Write => "PUT",
            Method::Delete => "DEL",
            Method::Execute => "EXEC",
            Method::Options => "OPTIONS",
        }
    }

    /// Normalize a canonical name or a device alias, case-insensitively
    pub fn normalize(raw: &str) -> Result<Method, UnknownMethod> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "READ" | "GET" => Ok(Method::Read),
            "CREATE" | "POST" => Ok(Method::Create),
            "WRITE" | "PUT" => Ok(Method::Write),
            "DELETE" | "DEL" => Ok(Method::Delete),
            "EXECUTE" | "EXEC" => Ok(Method::Execute),
            "OPTIONS" => Ok(Method::Options),
            _ => Err(UnknownMethod(raw.to_string())),
        }
    }
}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::normalize(s)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a method name to its canonical spelling
pub fn normalize_method_name(raw: &str) -> Result<&'static str, UnknownMethod> {
    Method::normalize(raw).map(|m| m.as_str())
}

/// Ties a request to its eventual asynchronous reply.
///
/// Scoped by tenant and device so two devices can never collide even if a
/// request id were reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub tenant_id: String,
    pub device_id: String,
    pub request_id: Uuid,
}

impl CorrelationId {
    pub fn new(tenant_id: impl Into<String>, device_id: impl Into<String>, request_id: Uuid) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            request_id,
        }
    }

    /// Generate a fresh correlation id for a device
    pub fn generate(tenant_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::new(tenant_id, device_id, Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.device_id, self.request_id)
    }
}

/// Typed metric value carried alongside a body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetricValue {
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl MetricValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetricValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::String(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::String(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Long(value)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Bool(value)
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

/// Outcome class reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Accepted,
    BadRequest,
    NotFound,
    NotAllowed,
    InternalError,
}

impl ResponseCode {
    pub fn from_result_code(code: u32) -> Self {
        match code {
            200..=299 => ResponseCode::Accepted,
            404 => ResponseCode::NotFound,
            405 => ResponseCode::NotAllowed,
            400..=499 => ResponseCode::BadRequest,
            _ => ResponseCode::InternalError,
        }
    }

    pub fn result_code(&self) -> u32 {
        match self {
            ResponseCode::Accepted => 200,
            ResponseCode::BadRequest => 400,
            ResponseCode::NotFound => 404,
            ResponseCode::NotAllowed => 405,
            ResponseCode::InternalError => 500,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ResponseCode::Accepted)
    }
}

/// Correlation headers carried alongside every message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationHeaders {
    pub requester: String,
    pub request_id: String,
    pub username: String,
    pub client_id: String,
    pub client_ip: String,
    pub connection_id: String,
    pub result_code: Option<u32>,
    pub error_code: Option<String>,
}

/// Dialect-agnostic request addressed to one device application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRequest {
    pub tenant_id: String,
    pub device_id: String,
    pub app_name: String,
    pub app_version: String,
    pub method: Method,
    pub resource_path: Vec<String>,
    pub body: Vec<u8>,
    pub metrics: Metrics,
    pub captured_on: DateTime<Utc>,
    pub requester: String,
    pub username: String,
}

impl CanonicalRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        device_id: impl Into<String>,
        app_name: impl Into<String>,
        method: Method,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            app_name: app_name.into(),
            app_version: "1.0.0".into(),
            method,
            resource_path: Vec::new(),
            body: Vec::new(),
            metrics: Metrics::new(),
            captured_on: Utc::now(),
            requester: String::new(),
            username: String::new(),
        }
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    pub fn with_resource<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_path = segments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }
}

/// Dialect-agnostic reply from one device application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalResponse {
    pub tenant_id: String,
    pub device_id: String,
    pub app_name: String,
    pub app_version: String,
    pub method: Option<Method>,
    pub resource_path: Vec<String>,
    pub body: Vec<u8>,
    pub metrics: Metrics,
    pub captured_on: DateTime<Utc>,
    pub headers: CorrelationHeaders,
    pub code: ResponseCode,
    pub exception_message: Option<String>,
}

impl CanonicalResponse {
    pub fn is_accepted(&self) -> bool {
        self.code.is_accepted()
    }

    /// Body as UTF-8 text, lossy
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
