//! Port trait definitions (Hexagonal Architecture)
//!
//! - Handler: executable side of a registered handler

pub mod handler;

pub use handler::Handler;
