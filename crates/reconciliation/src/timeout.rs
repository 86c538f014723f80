//! Bounded provider calls.

use std::future::Future;
use std::time::Duration;

use crate::ProviderCallError;

/// Default bound on a single provider call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a provider call under `limit`.
///
/// Expiry becomes [`ProviderCallError::Timeout`]; the call is not retried.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, ProviderCallError>
where
    F: Future<Output = Result<T, ProviderCallError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = limit.as_millis() as u64, "provider call timed out");
            Err(ProviderCallError::Timeout {
                operation,
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}
