//! Registry of connected device agents

use async_trait::async_trait;
use devmgmt_shared::{DeviceEnvelope, DeviceTopic, MessageClass};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::connection::{DeviceSession, SessionHandle};
use crate::command::CommandDispatcher;
use crate::transport::{DeviceTransport, TransportError};

type DeviceKey = (String, String);

/// What the server knows about a connected device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub tenant_id: String,
    pub client_id: String,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

struct SessionEntry {
    handle: SessionHandle,
    info: DeviceInfo,
}

/// Sessions by (tenant, client); also the server's outbound transport
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<DeviceKey, SessionEntry>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session, replacing an older connection of the same device
    pub async fn register(&self, handle: SessionHandle) {
        let key = (handle.tenant_id.clone(), handle.client_id.clone());
        let info = DeviceInfo {
            tenant_id: handle.tenant_id.clone(),
            client_id: handle.client_id.clone(),
            addr: handle.addr,
            connected_at: handle.connected_at,
            last_seen: Instant::now(),
        };

        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.insert(key, SessionEntry { handle, info }) {
            debug!(addr = %previous.info.addr, "Replaced previous session");
        }
    }

    /// Remove the session of a device if it is still the one at `addr`
    pub async fn unregister(&self, tenant_id: &str, client_id: &str, addr: SocketAddr) -> bool {
        let key = (tenant_id.to_string(), client_id.to_string());
        let mut sessions = self.sessions.write().await;
        match sessions.get(&key) {
            Some(entry) if entry.info.addr == addr => {
                sessions.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, tenant_id: &str, client_id: &str) -> Option<SessionHandle> {
        let key = (tenant_id.to_string(), client_id.to_string());
        self.sessions.read().await.get(&key).map(|e| e.handle.clone())
    }

    pub async fn get_info(&self, tenant_id: &str, client_id: &str) -> Option<DeviceInfo> {
        let key = (tenant_id.to_string(), client_id.to_string());
        self.sessions.read().await.get(&key).map(|e| e.info.clone())
    }

    pub async fn touch(&self, tenant_id: &str, client_id: &str) {
        let key = (tenant_id.to_string(), client_id.to_string());
        if let Some(entry) = self.sessions.write().await.get_mut(&key) {
            entry.info.last_seen = Instant::now();
        }
    }

    pub async fn connected_devices(&self) -> Vec<(String, String)> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Read a connection until it closes, feeding replies to the dispatcher
    pub async fn serve(&self, mut session: DeviceSession, dispatcher: Arc<CommandDispatcher>) {
        let addr = session.addr();
        let mut identity: Option<DeviceKey> = None;

        while let Some(envelope) = session.recv().await {
            if identity.is_none() {
                if let Some(handle) = session.handle() {
                    info!(addr = %addr, tenant_id = %handle.tenant_id, client_id = %handle.client_id, "Device connected");
                    identity = Some((handle.tenant_id.clone(), handle.client_id.clone()));
                    self.register(handle.clone()).await;
                }
            }
            if let Some((tenant, client)) = &identity {
                self.touch(tenant, client).await;
            }

            match envelope.class() {
                MessageClass::Response => dispatcher.handle_reply(envelope).await,
                MessageClass::Birth => {}
                other => warn!(addr = %addr, class = ?other, "Unexpected message from device"),
            }
        }

        if let Some((tenant, client)) = identity {
            if self.unregister(&tenant, &client, addr).await {
                info!(addr = %addr, tenant_id = %tenant, client_id = %client, "Device disconnected");
            }
        } else {
            debug!(addr = %addr, "Anonymous connection closed");
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for SessionManager {
    async fn publish(&self, topic: &DeviceTopic, envelope: &DeviceEnvelope) -> Result<(), TransportError> {
        let handle = self
            .get(&topic.tenant_id, &topic.client_id)
            .await
            .ok_or_else(|| TransportError::NotConnected(topic.to_string()))?;
        handle.send(envelope).await
    }
}
