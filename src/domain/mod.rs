//! Domain Layer
//!
//! Contains the ports (traits) separating allocation logic from the
//! durable store and host tooling.

pub mod ports;

pub use ports::*;
