//! API Module
//!
//! HTTP registration API for pods and services.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
