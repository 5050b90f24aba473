//! Device keystore
//!
//! Key material never leaves the device; reads return a fingerprint.

use async_trait::async_trait;
use devmgmt_shared::{DeviceMetric, Method};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::{not_allowed, AppHandler, AppRequest, DeviceState};
use crate::command::CommandResult;

pub const APP_NAME: &str = "KEYS-V1";

const ROTATE: &str = "rotate";

pub struct KeystoreApp;

fn fingerprint(material: &str) -> String {
    let mut hasher = DefaultHasher::new();
    material.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl AppHandler for KeystoreApp {
    async fn handle(&self, state: &mut DeviceState, request: &AppRequest) -> CommandResult {
        match (request.method, request.resource.as_slice()) {
            (Method::Read, []) => {
                let aliases: Vec<&str> = state.keys.keys().map(String::as_str).collect();
                CommandResult::text(aliases.join("\n"))
            }
            (Method::Execute, [action]) if action == ROTATE => {
                state.key_rotations += 1;
                let generation = state.key_rotations;
                for (alias, material) in state.keys.iter_mut() {
                    *material = format!("k{generation}-{alias}");
                }
                CommandResult::Completed {
                    body: Vec::new(),
                    metrics: vec![DeviceMetric::int64("keys.rotated", state.keys.len() as i64)],
                }
            }
            (Method::Read | Method::Write | Method::Delete, _) => {
                let alias = match request.item() {
                    Ok(alias) => alias,
                    Err(rejected) => return rejected,
                };
                let missing = || CommandResult::NotFound {
                    message: format!("no key with alias {alias}"),
                };
                match request.method {
                    Method::Read => state
                        .keys
                        .get(alias)
                        .map(|material| CommandResult::text(fingerprint(material)))
                        .unwrap_or_else(missing),
                    Method::Write => {
                        let material = request.body_text();
                        if material.is_empty() {
                            return CommandResult::Rejected {
                                message: "key material missing".into(),
                            };
                        }
                        state.keys.insert(alias.to_string(), material);
                        CommandResult::empty()
                    }
                    _ => state
                        .keys
                        .remove(alias)
                        .map(|_| CommandResult::empty())
                        .unwrap_or_else(missing),
                }
            }
            (method, _) => not_allowed(APP_NAME, method),
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
    async fn test_read_returns_fingerprint_not_material() {
        let mut state = DeviceState::seeded();
        KeystoreApp.handle(&mut state, &req(Method::Write, &["tls"], "secret")).await;

        let CommandResult::Completed { body, .. } =
            KeystoreApp.handle(&mut state, &req(Method::Read, &["tls"], "")).await
        else {
            panic!("read should succeed");
        };
        let body = String::from_utf8(body).unwrap();
        assert_eq!(body, fingerprint("secret"));
        assert!(!body.contains("secret"));
    }

    #[tokio::test]
    async fn test_rotate_replaces_every_key() {
        let mut state = DeviceState::seeded();
        KeystoreApp.handle(&mut state, &req(Method::Write, &["tls"], "secret")).await;

        let result = KeystoreApp.handle(&mut state, &req(Method::Execute, &["rotate"], "")).await;
        assert_eq!(result.result_code(), 200);
        assert_eq!(state.keys["tls"], "k1-tls");
        assert_eq!(state.keys["device"], "k1-device");

        let result = KeystoreApp.handle(&mut state, &req(Method::Execute, &["explode"], "")).await;
        assert_eq!(result.result_code(), 405);
    }
}
