//! Address Management Module
//!
//! Overlay address arithmetic, the singleton pool counter and the binding
//! registry that allocates, reserves and releases addresses.

pub mod addr;
pub mod counter;
pub mod registry;

pub use addr::*;
pub use counter::*;
pub use registry::*;

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Run a store call with an upper bound on its duration
pub(crate) async fn bounded<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::StoreTimeout(timeout, op.to_string()))?
}
