//! Device agent sessions
//!
//! This module handles:
//! - Accepting agent connections and learning their identity from BIRTH
//! - Routing replies from devices to the command dispatcher
//! - Publishing requests to the session of the addressed device

mod connection;
mod manager;

pub use connection::{DeviceSession, SessionHandle};
pub use manager::{DeviceInfo, SessionManager};
