//! Domain layer for the hookgate dispatch engine
//!
//! This module contains the event, handler and outcome models, the error type and the
//! handler port.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DispatchError, DispatchResult};
