//! Crate-wide error type and retry helper.
//!
//! Every public operation returns [`Result`]. Backend failures are classified
//! into the kinds the orchestration layer cares about: transient errors are
//! retried locally, permanent ones surface immediately, and node-local
//! degradations never become an `Err` at the graph level (they travel in the
//! state's error fields instead).

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or empty query, unknown mode, malformed document id.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Document absent or not visible to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Owner mismatch on a scoped operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Timeout, 5xx, connection drop. Retried with backoff before surfacing.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// 4xx, bad content type, parse failure. Never retried.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The orchestration was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Classify a reqwest failure. Timeouts and connection problems are
    /// retriable; everything else carried by the transport layer is not.
    pub fn from_http(err: reqwest::Error, what: &str) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::Transient(format!("{what}: {err}"))
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                Error::Transient(format!("{what}: HTTP {status}"))
            } else {
                Error::Permanent(format!("{what}: HTTP {status}"))
            }
        } else {
            Error::Permanent(format!("{what}: {err}"))
        }
    }
}

/// Retry an async operation with exponential backoff while it reports a
/// transient error. `attempts` counts the total tries, not the retries.
pub async fn retry<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut last = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after transient error");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last.unwrap_or_else(|| Error::Transient("retry budget exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Permanent("bad request".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_exhausted_transient() {
        let result: Result<()> = retry(2, Duration::from_millis(1), || async {
            Err(Error::Transient("still down".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Transient(_))));
    }
}
