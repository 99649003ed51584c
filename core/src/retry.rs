//! Polling, backoff, and bounded-retry primitives
//!
//! Every "wait for X to become Y" loop in the orchestrator goes through
//! [`poll_until`] wrapped in a `tokio::time::timeout` for its deadline;
//! nothing busy-waits or sleeps ad hoc.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// First delay
    pub initial: Duration,
    /// Multiplier applied after each delay
    pub factor: f64,
    /// Upper bound on any single delay
    pub cap: Duration,
}

impl Backoff {
    /// Build a schedule
    pub const fn new(initial: Duration, factor: f64, cap: Duration) -> Self {
        Backoff {
            initial,
            factor,
            cap,
        }
    }

    /// Infinite iterator of delays: `initial, initial*factor, ...` capped
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = self.factor;
        let cap = self.cap;
        let mut current = self.initial.as_secs_f64();
        std::iter::from_fn(move || {
            let delay = Duration::from_secs_f64(current.min(cap.as_secs_f64()));
            current *= factor;
            Some(delay)
        })
    }
}

/// Poll an operation until it yields a value, sleeping per the backoff
///
/// The closure returns `Ok(Some(v))` when the awaited condition holds,
/// `Ok(None)` to keep waiting, and `Err` to abort. Deadlines are imposed by
/// the caller with `tokio::time::timeout`, so each caller can map expiry to
/// its own error kind.
pub async fn poll_until<T, E, F, Fut>(backoff: Backoff, mut poll: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut delays = backoff.delays();
    loop {
        if let Some(value) = poll().await? {
            return Ok(value);
        }
        // delays() is infinite; unwrap is unreachable
        sleep(delays.next().unwrap_or(backoff.cap)).await;
    }
}

/// Retry an operation a bounded number of times on retryable errors
///
/// Used for control-plane poll hiccups, cloud-API throttling, and
/// eventual-consistency gaps in tag lookups. Non-retryable errors and the
/// final attempt's error propagate unchanged.
pub async fn retry_transient<T, E, F, Fut>(
    what: &str,
    attempts: usize,
    backoff: Backoff,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = backoff.delays();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                let delay = delays.next().unwrap_or(backoff.cap);
                tracing::warn!(
                    operation = what,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolve once the cancel channel carries `true`; pends forever otherwise
///
/// The channel latches, so a signal sent before the call still resolves it.
pub async fn cancelled(rx: &mut tokio::sync::watch::Receiver<bool>) {
    if *rx.borrow_and_update() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    // Sender dropped without cancelling; nothing left to wait for
    std::future::pending::<()>().await;
}
