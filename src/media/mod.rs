#![forbid(unsafe_code)]

// Media-engine plumbing: the worker pool and the deadline applied to every
// call that crosses the IPC boundary into a worker.

pub mod worker_pool;

pub use worker_pool::WorkerPool;

use crate::error::{SignalingError, SignalingResult};
use std::future::Future;
use std::time::Duration;

/// Deadline for a single engine call. An engine that never answers would
/// otherwise stall its handler forever; expiry is reported as an engine
/// failure.
pub const ENGINE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one engine call under [`ENGINE_CALL_TIMEOUT`].
///
/// Timeout maps to `EngineFailed`; the engine's own error is handed back to
/// the caller, which decides between rejected and failed.
pub async fn engine_call<F, T, E>(op: &str, fut: F) -> SignalingResult<Result<T, E>>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(ENGINE_CALL_TIMEOUT, fut)
        .await
        .map_err(|_| SignalingError::EngineFailed(format!("{op}: engine call timed out")))
}
