//! Bounded retry with exponential backoff for external model calls.
//!
//! Shared by the embedding, generation, and rerank clients. Only
//! [`RagError::Transient`] outcomes are retried; everything else
//! propagates on first occurrence.
//!
//! Schedule: `base × 2^(attempt-1)` with ±20% jitter, base 500 ms,
//! at most `max_attempts` attempts in total.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::{RagError, RagResult};

const BASE_DELAY_MS: u64 = 500;
const JITTER: f64 = 0.2;

/// Run `op` up to `max_attempts` times, sleeping between transient failures.
pub async fn retry_transient<T, F, Fut>(max_attempts: u32, mut op: F) -> RagResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RagResult<T>>,
{
    let attempts = max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(attempt, error = %e, "transient failure, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| RagError::Transient("retries exhausted".into())))
}

/// Delay before retry number `retry` (1-based), with jitter applied.
fn backoff_delay(retry: u32) -> Duration {
    let base = BASE_DELAY_MS * (1u64 << (retry - 1).min(6));
    let factor = rand::rng().random_range(1.0 - JITTER..=1.0 + JITTER);
    Duration::from_millis((base as f64 * factor) as u64)
}

/// Classify an HTTP status for the retry policy: 429 and 5xx are
/// transient, any other non-success status is permanent.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> RagError {
    if status.as_u16() == 429 || status.is_server_error() {
        RagError::Transient(format!("HTTP {}: {}", status, body))
    } else {
        RagError::Permanent(format!("HTTP {}: {}", status, body))
    }
}

/// Map a reqwest transport error (connect failure, timeout) to transient.
pub fn classify_transport(err: reqwest::Error) -> RagError {
    RagError::Transient(err.to_string())
}
