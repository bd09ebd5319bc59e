/*!
 * Utility functions and helpers for gepace.
 */
use std::future::Future;

use futures::future::BoxFuture;
use tokio::runtime::Builder as TokioRuntimeBuilder;
use tokio::runtime::Runtime as TokioRuntime;
use tracing::debug;

use crate::error::{Error, Result};

/// Build the single-threaded runtime that drives blocking facades
///
/// The runtime has I/O and timers enabled and is meant to be owned by exactly
/// one blocking handle.
pub fn blocking_runtime() -> Result<TokioRuntime> {
    debug!("Building current-thread runtime for blocking access");
    TokioRuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::runtime(format!("Failed to build tokio runtime: {}", e)))
}

/// Box a borrowed future
pub fn box_future<'a, F, T>(future: F) -> BoxFuture<'a, T>
where
    F: Future<Output = T> + Send + 'a,
{
    Box::pin(future)
}
