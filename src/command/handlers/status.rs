//! Device status report

use async_trait::async_trait;
use devmgmt_shared::{now_ms, DeviceMetric, Method};

use super::{not_allowed, AppHandler, AppRequest, DeviceState};
use crate::command::CommandResult;

pub const APP_NAME: &str = "STATUS-V1";

pub struct StatusApp;

#[async_trait]
impl AppHandler for StatusApp {
    async fn handle(&self, state: &mut DeviceState, request: &AppRequest) -> CommandResult {
        match request.method {
            Method::Read | Method::Options => CommandResult::Completed {
                body: Vec::new(),
                metrics: vec![
                    DeviceMetric::int64("uptime.ms", now_ms().saturating_sub(state.started_ms) as i64),
                    DeviceMetric::int64("bundles.count", state.bundles.len() as i64),
                    DeviceMetric::int64("keys.count", state.keys.len() as i64),
                    DeviceMetric::int64("assets.count", state.assets.len() as i64),
                    DeviceMetric::boolean("healthy", true),
                ],
            },
            method => not_allowed(APP_NAME, method),
        }
    }
}
