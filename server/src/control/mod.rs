//! Job engine control surface
//!
//! A method/path router over typed handlers. Failures come back as
//! [`ErrorResponse`] bodies carrying the HTTP status and a stable code.

mod error;
mod handlers;
pub mod line;
mod router;

pub use error::ErrorResponse;
pub use handlers::{IsRunningManyRequest, IsRunningManyResponse, IsRunningResponse, JobEngineControl};
pub use router::{ControlResponse, ControlRouter};
