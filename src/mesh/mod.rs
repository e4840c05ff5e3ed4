//! Mesh Config Generator
//!
//! Deterministic renderers for the WireGuard gateway and client files and
//! for nginx stream rules, plus the key material they embed.

pub mod keys;
pub mod nginx;
pub mod wireguard;

pub use keys::*;
pub use nginx::*;
pub use wireguard::*;
