//! Device command dispatch and reply correlation
//!
//! This module handles:
//! - Registering pending calls and matching replies to them
//! - Expiring calls whose deadline passed
//! - Persisting the device operation behind every call
//! - Reconciling replies that arrive after their deadline

mod correlator;
mod dispatcher;
pub mod operation;
mod timeout;

pub use correlator::{
    CallResult, CorrelatorError, ExpectedResponse, PendingHandle, ResolveOutcome,
    ResponseCorrelator,
};
pub use dispatcher::{
    CommandDispatcher, CommunicationError, DispatchError, DispatchOutcome, Dispatched,
    DispatcherConfig, TimeoutError, OPERATION_EVENT_SOURCE,
};
pub use operation::{DeviceManagementOperation, OperationRepository, OperationStatus};
pub use timeout::TimeoutTracker;
