//! Fail-open helpers for advisory side channels
//!
//! Session logging, milestone publishing and best-effort cleanup must never
//! change the outcome of a run. Wrap them with these helpers so a failure is
//! logged and swallowed.
//!
//! Do NOT use fail-open for:
//! - State store writes (crash recovery depends on them)
//! - Agent invocation (drives the retry machinery)
//! - Merges and verification (integration correctness)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an async operation whose failure is only worth a warning
///
/// Returns `None` when the operation failed.
///
/// ```no_run
/// use swarm_core::fail_open::fail_open;
/// use swarm_core::Result;
///
/// async fn publish_milestone() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let published = fail_open("bus::publish_status", || publish_milestone()).await;
///     assert!(published.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SwarmError;

    #[tokio::test]
    async fn test_fail_open_passes_value_through() {
        let result = fail_open("test_op", || async { Ok::<_, SwarmError>(7) }).await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_fail_open_swallows_error() {
        let result = fail_open("test_op", || async {
            Err::<u32, _>(SwarmError::Other("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
