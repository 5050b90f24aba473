//! Application handlers, one per device application

mod assets;
mod bundles;
mod keystore;
mod status;

pub use assets::AssetsApp;
pub use bundles::BundlesApp;
pub use keystore::KeystoreApp;
pub use status::StatusApp;

use async_trait::async_trait;
use devmgmt_shared::{now_ms, Method};
use std::collections::{BTreeMap, HashMap};

use crate::command::CommandResult;

/// Request as handed to an application
#[derive(Debug, Clone, PartialEq)]
pub struct AppRequest {
    pub method: Method,
    pub resource: Vec<String>,
    pub body: Vec<u8>,
}

impl AppRequest {
    /// Single resource segment naming the item the request is about
    pub fn item(&self) -> Result<&str, CommandResult> {
        match self.resource.as_slice() {
            [name] if !name.is_empty() => Ok(name),
            _ => Err(CommandResult::Rejected {
                message: format!("expected one resource segment, got {:?}", self.resource),
            }),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

/// Everything the simulated device keeps
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Installed bundles, name to version
    pub bundles: BTreeMap<String, String>,
    /// Key material by alias
    pub keys: BTreeMap<String, String>,
    pub assets: BTreeMap<String, String>,
    pub started_ms: u64,
    pub key_rotations: u64,
}

impl DeviceState {
    pub fn seeded() -> Self {
        Self {
            bundles: BTreeMap::from([("core".to_string(), "1.0.0".to_string())]),
            keys: BTreeMap::from([("device".to_string(), "k0-device".to_string())]),
            assets: BTreeMap::from([
                ("firmware".to_string(), "1.0.0".to_string()),
                ("location".to_string(), "unknown".to_string()),
            ]),
            started_ms: now_ms(),
            key_rotations: 0,
        }
    }
}

#[async_trait]
pub trait AppHandler: Send + Sync {
    async fn handle(&self, state: &mut DeviceState, request: &AppRequest) -> CommandResult;
}

/// Handlers keyed by upper-case application name
pub fn default_apps() -> HashMap<String, Box<dyn AppHandler>> {
    let mut apps: HashMap<String, Box<dyn AppHandler>> = HashMap::new();
    apps.insert(bundles::APP_NAME.to_string(), Box::new(BundlesApp));
    apps.insert(keystore::APP_NAME.to_string(), Box::new(KeystoreApp));
    apps.insert(assets::APP_NAME.to_string(), Box::new(AssetsApp));
    apps.insert(status::APP_NAME.to_string(), Box::new(StatusApp));
    apps
}

fn listing<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> CommandResult {
    let lines: Vec<String> = entries.map(|(k, v)| format!("{k}={v}")).collect();
    CommandResult::text(lines.join("\n"))
}

fn not_allowed(app: &str, method: Method) -> CommandResult {
    CommandResult::NotAllowed {
        message: format!("{app} does not support {method}"),
    }
}
