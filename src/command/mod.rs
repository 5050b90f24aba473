//! Request execution for the device agent
//!
//! This module handles:
//! - Validating request envelopes from the server
//! - Dispatching to the handler of the addressed application
//! - Building replies that echo the request's correlation headers

mod executor;
pub mod handlers;

pub use executor::{CommandExecutor, CommandResult};
