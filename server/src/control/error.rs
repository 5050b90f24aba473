use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

use crate::job::JobEngineError;

/// Body of every failed control call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub http_status: u16,
    pub error_code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(http_status: u16, error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            error_code: error_code.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn route_not_found(method: &str, path: &str) -> Self {
        Self::new(404, "ROUTE_NOT_FOUND", format!("No route for {method} {path}"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "BAD_REQUEST", message)
    }

    /// Render a job engine error; the source chain is attached when asked for
    pub fn from_job_error(error: &JobEngineError, include_stack_trace: bool) -> Self {
        let mut response = Self::new(error.http_status(), error.error_code(), error.to_string());
        if include_stack_trace {
            response.stack_trace = Some(error_chain(error));
        }
        response
    }
}

fn error_chain(error: &(dyn StdError + 'static)) -> Vec<String> {
    let mut chain = vec![format!("{error:?}")];
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}
