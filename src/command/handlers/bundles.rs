//! Software bundles installed on the device

use async_trait::async_trait;
use devmgmt_shared::Method;

use super::{listing, not_allowed, AppHandler, AppRequest, DeviceState};
use crate::command::CommandResult;

pub const APP_NAME: &str = "BUN-V1";

pub struct BundlesApp;

#[async_trait]
impl AppHandler for BundlesApp {
    async fn handle(&self, state: &mut DeviceState, request: &AppRequest) -> CommandResult {
        if request.method == Method::Read && request.resource.is_empty() {
            return listing(state.bundles.iter());
        }
        let name = match request.item() {
            Ok(name) => name,
            Err(rejected) => return rejected,
        };

        match request.method {
            Method::Read => match state.bundles.get(name) {
                Some(version) => CommandResult::text(version.clone()),
                None => CommandResult::NotFound {
                    message: format!("bundle {name} is not installed"),
                },
            },
            Method::Create => {
                let version = request.body_text();
                if version.is_empty() {
                    return CommandResult::Rejected {
                        message: "bundle version missing".into(),
                    };
                }
                if state.bundles.contains_key(name) {
                    return CommandResult::Rejected {
                        message: format!("bundle {name} is already installed"),
                    };
                }
                state.bundles.insert(name.to_string(), version);
                CommandResult::Created
            }
            Method::Write => match state.bundles.get_mut(name) {
                Some(version) => {
                    *version = request.body_text();
                    CommandResult::empty()
                }
                None => CommandResult::NotFound {
                    message: format!("bundle {name} is not installed"),
                },
            },
            Method::Delete => match state.bundles.remove(name) {
                Some(_) => CommandResult::empty(),
                None => CommandResult::NotFound {
                    message: format!("bundle {name} is not installed"),
                },
            },
            Method::Execute | Method::Options => not_allowed(APP_NAME, request.method),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: Method, resource: &[&str], body: &str) -> AppRequest {
        AppRequest {
            method,
            resource: resource.iter().map(|s| s.to_string()).collect(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_install_upgrade_remove() {
        let mut state = DeviceState::seeded();

        assert_eq!(BundlesApp.handle(&mut state, &req(Method::Create, &["maps"], "3.2")).await, CommandResult::Created);
        assert_eq!(
            BundlesApp.handle(&mut state, &req(Method::Create, &["maps"], "3.3")).await.result_code(),
            400
        );
        BundlesApp.handle(&mut state, &req(Method::Write, &["maps"], "3.3")).await;
        assert_eq!(
            BundlesApp.handle(&mut state, &req(Method::Read, &["maps"], "")).await,
            CommandResult::text("3.3")
        );
        assert_eq!(
            BundlesApp.handle(&mut state, &req(Method::Read, &[], "")).await,
            CommandResult::text("core=1.0.0\nmaps=3.3")
        );

        BundlesApp.handle(&mut state, &req(Method::Delete, &["maps"], "")).await;
        assert_eq!(
            BundlesApp.handle(&mut state, &req(Method::Delete, &["maps"], "")).await.result_code(),
            404
        );
    }

    #[tokio::test]
    async fn test_execute_not_allowed() {
        let mut state = DeviceState::seeded();
        let result = BundlesApp.handle(&mut state, &req(Method::Execute, &["core"], "")).await;
        assert_eq!(result.result_code(), 405);
    }
}
