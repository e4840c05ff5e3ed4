//! Control Plane Module
//!
//! The manager that drives registrations end to end, and the HTTP API in
//! front of it.

pub mod manager;
pub mod api;

pub use manager::*;
pub use api::*;
