//! Connection to the device-management server
//!
//! This module handles:
//! - Persistent TCP connection with automatic reconnection and backoff
//! - Announcing the device with a BIRTH envelope on every connect
//! - Bidirectional frame streaming

mod manager;

pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager};
