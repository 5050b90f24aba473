//! Named asset values reported and set by the server

use async_trait::async_trait;
use devmgmt_shared::{DeviceMetric, Method};

use super::{listing, not_allowed, AppHandler, AppRequest, DeviceState};
use crate::command::CommandResult;

pub const APP_NAME: &str = "ASSET-V1";

pub struct AssetsApp;

#[async_trait]
impl AppHandler for AssetsApp {
    async fn handle(&self, state: &mut DeviceState, request: &AppRequest) -> CommandResult {
        match request.method {
            Method::Read if request.resource.is_empty() => listing(state.assets.iter()),
            Method::Read | Method::Write => {
                let name = match request.item() {
                    Ok(name) => name,
                    Err(rejected) => return rejected,
                };
                let Some(value) = state.assets.get_mut(name) else {
                    return CommandResult::NotFound {
                        message: format!("no asset {name}"),
                    };
                };
                if request.method == Method::Write {
                    *value = request.body_text();
                }
                CommandResult::Completed {
                    body: value.clone().into_bytes(),
                    metrics: vec![DeviceMetric::text(format!("asset.{name}"), value.clone())],
                }
            }
            method => not_allowed(APP_NAME, method),
        }
    }
}
