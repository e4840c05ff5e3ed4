//! Durable Store Adapters
//!
//! Implementations of [`crate::domain::ports::BindingStore`]:
//! - KubeStore: custom resources on the cluster API server
//! - MemoryStore: in-process store for standalone mode and tests

pub mod kubernetes;
pub mod memory;

pub use kubernetes::*;
pub use memory::*;
