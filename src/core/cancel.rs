//! Cancellation helpers shared by the engine and the orchestrator.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::CertError;

/// Races `fut` against cancellation. An already-cancelled token wins without
/// polling `fut`.
pub async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, CertError>
where
    F: Future<Output = Result<T, CertError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CertError::Cancelled),
        result = fut => result,
    }
}

/// Sleeps until `until` unless cancelled first.
pub async fn pause_until(cancel: &CancellationToken, until: Instant) -> Result<(), CertError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CertError::Cancelled),
        _ = tokio::time::sleep_until(until) => Ok(()),
    }
}
