//! fab-retry
//!
//! Safety Plane resilience primitives (spec §4.7, §9 design note
//! "Tenacity-style retry"): a generic transport-error retry wrapper for
//! individual REST-style calls, and a resilient stream reconnector for the
//! venue adapter's funding/ticker polling loops. Neither primitive
//! distinguishes transport-class failures from semantic ones on its own —
//! callers supply the predicate (spec §7: "never on semantic errors like
//! insufficient margin").

use std::future::Future;
use std::time::Duration;

use fab_venue::VenueError;

/// Default retry policy for individual REST-style calls (spec §9):
/// `max_attempts = 3`, wait `clamp(2^attempt, 1, 10)` seconds between
/// attempts, reraise after exhaustion.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff for one retry attempt of a single call: `clamp(2^attempt, 1,
/// 10)` seconds, where `attempt` is 1-based (the delay before the *next*
/// try, not the first).
pub fn call_backoff(attempt: u32) -> Duration {
    let seconds = 2u64.saturating_pow(attempt).clamp(1, 10);
    Duration::from_secs(seconds)
}

/// Backoff for one reconnect of a resilient stream (spec §4.7): `min(2^n,
/// 60)` seconds.
pub fn stream_backoff(retry: u32) -> Duration {
    let seconds = 2u64.saturating_pow(retry).min(60);
    Duration::from_secs(seconds)
}

/// Retry `op` up to `max_attempts` times, waiting `call_backoff(attempt)`
/// between tries, but only when `is_transport` returns true for the
/// error — semantic errors are returned immediately on the first failure
/// (spec §7: semantic errors are never retried).
pub async fn retry_transport<F, Fut, T, E>(mut op: F, is_transport: impl Fn(&E) -> bool, max_attempts: u32) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !is_transport(&err) || attempt >= max_attempts {
                    return Err(err);
                }
                let wait = call_backoff(attempt);
                tracing::warn!(attempt, wait_secs = wait.as_secs(), "transport_retry");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// [`retry_transport`] specialized to [`VenueError`]'s built-in
/// transport/semantic classification — the common case for venue adapter
/// calls.
pub async fn retry_venue_call<F, Fut, T>(op: F) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    retry_transport(op, VenueError::is_transport, DEFAULT_MAX_ATTEMPTS).await
}

/// Reconnects a fallible "pull next item" factory after any error, up to
/// `max_retries` consecutive failures, with `stream_backoff` between
/// attempts. A single successfully yielded item resets the retry counter
/// (spec §4.7) — the stream is only considered exhausted after
/// `max_retries` consecutive failures with no success between them.
pub struct ResilientStream<F> {
    factory: F,
    max_retries: u32,
    retries: u32,
}

impl<F, Fut, T, E> ResilientStream<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    pub fn new(factory: F, max_retries: u32) -> Self {
        Self { factory, max_retries, retries: 0 }
    }

    /// Pull the next item, transparently reconnecting on error. Returns
    /// `None` once `max_retries` consecutive failures have been observed
    /// without an intervening success.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            match (self.factory)().await {
                Ok(item) => {
                    self.retries = 0;
                    return Some(item);
                }
                Err(err) => {
                    self.retries += 1;
                    tracing::warn!(retries = self.retries, error = %err, "stream_reconnect");
                    if self.retries > self.max_retries {
                        return None;
                    }
                    tokio::time::sleep(stream_backoff(self.retries)).await;
                }
            }
        }
    }

    /// Current consecutive-failure count, for tests and diagnostics.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}
