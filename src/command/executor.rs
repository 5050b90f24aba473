//! Command executor - validates requests and dispatches them to app handlers

use super::handlers::{self, AppHandler, AppRequest, DeviceState};
use devmgmt_shared::{
    now_ms, DeviceChannel, DeviceEnvelope, DeviceMetric, DevicePayload, MessageClass, Method,
    EXCEPTION_MESSAGE_METRIC,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of running one request
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Completed {
        body: Vec<u8>,
        metrics: Vec<DeviceMetric>,
    },
    Created,
    NotFound { message: String },
    NotAllowed { message: String },
    Rejected { message: String },
    Failed { message: String },
}

impl CommandResult {
    pub fn text(body: impl Into<String>) -> Self {
        CommandResult::Completed {
            body: body.into().into_bytes(),
            metrics: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        CommandResult::Completed {
            body: Vec::new(),
            metrics: Vec::new(),
        }
    }

    pub fn result_code(&self) -> u32 {
        match self {
            CommandResult::Completed { .. } => 200,
            CommandResult::Created => 201,
            CommandResult::Rejected { .. } => 400,
            CommandResult::NotFound { .. } => 404,
            CommandResult::NotAllowed { .. } => 405,
            CommandResult::Failed { .. } => 500,
        }
    }
}

/// Executes requests received from the server against the device state
pub struct CommandExecutor {
    device_id: String,
    state: Arc<RwLock<DeviceState>>,
    apps: HashMap<String, Box<dyn AppHandler>>,
}

impl CommandExecutor {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: Arc::new(RwLock::new(DeviceState::seeded())),
            apps: handlers::default_apps(),
        }
    }

    pub fn state(&self) -> Arc<RwLock<DeviceState>> {
        self.state.clone()
    }

    /// Run a request and build its reply; None when the envelope cannot be answered
    pub async fn execute(&self, envelope: &DeviceEnvelope) -> Option<DeviceEnvelope> {
        let Some(channel) = envelope.channel.as_ref() else {
            warn!("Request without channel, dropping");
            return None;
        };
        if envelope.class() != MessageClass::Request {
            debug!(class = ?envelope.class(), "Ignoring non-request envelope");
            return None;
        }
        if channel.request_id.is_empty() {
            warn!(app = %channel.app_name, "Request without request id, dropping");
            return None;
        }

        let result = self.run(channel, envelope.payload.as_ref()).await;
        info!(
            request_id = %channel.request_id,
            app = %channel.app_name,
            method = %channel.method,
            code = result.result_code(),
            "Request executed"
        );
        Some(reply(channel, result))
    }

    async fn run(&self, channel: &DeviceChannel, payload: Option<&DevicePayload>) -> CommandResult {
        if channel.client_id != self.device_id {
            return CommandResult::Rejected {
                message: format!("request addressed to {}", channel.client_id),
            };
        }
        let method = match Method::normalize(&channel.method) {
            Ok(method) => method,
            Err(e) => {
                return CommandResult::NotAllowed {
                    message: e.to_string(),
                }
            }
        };
        let Some(app) = self.apps.get(&channel.app_name.to_ascii_uppercase()) else {
            return CommandResult::NotFound {
                message: format!("no application {}", channel.app_name),
            };
        };

        let request = AppRequest {
            method,
            resource: channel.resource.clone(),
            body: payload.map(|p| p.body.clone()).unwrap_or_default(),
        };
        let mut state = self.state.write().await;
        app.handle(&mut state, &request).await
    }
}

fn reply(request: &DeviceChannel, result: CommandResult) -> DeviceEnvelope {
    let mut payload = DevicePayload {
        timestamp_ms: now_ms() as i64,
        ..Default::default()
    };
    let code = result.result_code();

    match result {
        CommandResult::Completed { body, metrics } => {
            payload.body = body;
            payload.metrics = metrics;
        }
        CommandResult::Created => {}
        CommandResult::NotFound { message }
        | CommandResult::NotAllowed { message }
        | CommandResult::Rejected { message }
        | CommandResult::Failed { message } => {
            payload.metrics.push(DeviceMetric::text(EXCEPTION_MESSAGE_METRIC, message));
        }
    }

    DeviceEnvelope {
        channel: Some(DeviceChannel::reply_to(request, code)),
        payload: Some(payload),
    }
}
