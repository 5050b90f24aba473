use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::ErrorResponse;
use super::handlers::{IsRunningManyRequest, JobEngineControl};
use crate::job::{JobEngineError, JobStartOptions};

/// Result of routing one control call
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ControlResponse {
    fn no_content() -> Self {
        Self { status: 204, body: None }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status: 200, body: Some(body) },
            Err(e) => Self::error(ErrorResponse::new(500, "SERIALIZATION_ERROR", e.to_string())),
        }
    }

    fn error(error: ErrorResponse) -> Self {
        let status = error.http_status;
        Self {
            status,
            body: serde_json::to_value(error).ok(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Error body, when this is a failure
    pub fn error_body(&self) -> Option<ErrorResponse> {
        if self.is_success() {
            return None;
        }
        self.body
            .clone()
            .and_then(|body| serde_json::from_value(body).ok())
    }
}

/// Maps `METHOD path` plus a JSON body onto the job engine handlers
pub struct ControlRouter {
    control: JobEngineControl,
    include_stack_trace: bool,
}

impl ControlRouter {
    pub fn new(control: JobEngineControl, include_stack_trace: bool) -> Self {
        Self {
            control,
            include_stack_trace,
        }
    }

    pub async fn route(&self, method: &str, path: &str, body: &[u8]) -> ControlResponse {
        let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
        let method_upper = method.to_ascii_uppercase();
        debug!(method = %method_upper, path, "Control call");

        let result = match (method_upper.as_str(), segments.as_slice()) {
            ("POST", ["clean-data", scope, job]) => self.unit(self.control.clean_data(scope, job).await),
            ("GET", ["is-running", scope, job]) => self.reply(self.control.is_running(scope, job).await),
            ("POST", ["is-running", scope]) => match parse_body::<IsRunningManyRequest>(body) {
                Ok(request) => self.reply(self.control.is_running_many(scope, request).await),
                Err(e) => Err(e),
            },
            ("POST", ["resume-execution", scope, job, execution]) => match parse_uuid(execution) {
                Ok(id) => self.unit(self.control.resume_execution(scope, job, id).await),
                Err(e) => Err(e),
            },
            ("POST", ["start", scope, job]) => self.unit(self.control.start(scope, job).await),
            ("POST", ["start-with-options", scope, job]) => match parse_body::<JobStartOptions>(body) {
                Ok(options) => self.unit(self.control.start_with_options(scope, job, options).await),
                Err(e) => Err(e),
            },
            ("POST", ["stop", scope, job]) => self.unit(self.control.stop(scope, job).await),
            ("POST", ["stop-execution", scope, job, execution]) => match parse_uuid(execution) {
                Ok(id) => self.unit(self.control.stop_execution(scope, job, id).await),
                Err(e) => Err(e),
            },
            _ => Err(ErrorResponse::route_not_found(&method_upper, path)),
        };

        match result {
            Ok(response) => response,
            Err(error) => {
                if error.http_status >= 500 {
                    warn!(status = error.http_status, code = %error.error_code, message = %error.message, "Control call failed");
                }
                ControlResponse::error(error)
            }
        }
    }

    fn unit(&self, result: Result<(), JobEngineError>) -> Result<ControlResponse, ErrorResponse> {
        result
            .map(|()| ControlResponse::no_content())
            .map_err(|e| ErrorResponse::from_job_error(&e, self.include_stack_trace))
    }

    fn reply<T: Serialize>(&self, result: Result<T, JobEngineError>) -> Result<ControlResponse, ErrorResponse> {
        result
            .map(|value| ControlResponse::json(&value))
            .map_err(|e| ErrorResponse::from_job_error(&e, self.include_stack_trace))
    }
}

fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ErrorResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ErrorResponse::bad_request(format!("Malformed body: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid, ErrorResponse> {
    Uuid::parse_str(raw).map_err(|e| ErrorResponse::bad_request(format!("Invalid execution id {raw}: {e}")))
}
