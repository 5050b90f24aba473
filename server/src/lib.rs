//! Device management server
//!
//! Dispatches canonical requests to device agents, correlates their replies,
//! records each operation exactly once and drives multi-step jobs over many
//! devices.

pub mod cache;
pub mod command;
pub mod config;
pub mod control;
pub mod datastore;
pub mod events;
pub mod job;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod translator;
pub mod transport;
