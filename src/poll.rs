//! Bounded fixed-interval polling

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{Error, Result};

/// Poll until `check_fn` yields a value or `timeout` elapses.
///
/// `check_fn` returns `Ok(Some(v))` when done, `Ok(None)` to keep waiting. Errors
/// from the check are treated as "not yet" since the thing being polled is often
/// not reachable until it is ready. At least one check always runs.
pub async fn poll_for<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    what: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match check_fn().await {
            Ok(Some(value)) => {
                debug!(what, attempts, elapsed_ms = start.elapsed().as_millis(), "condition met");
                return Ok(value);
            }
            Ok(None) => trace!(what, attempts, "condition not yet met"),
            Err(e) => trace!(what, attempts, error = %e, "check failed, retrying"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::poll_timeout(what, timeout));
        }

        tokio::time::sleep(interval).await;
    }
}

/// Poll until `check_fn` returns `Ok(true)` or `timeout` elapses.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    what: &str,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    poll_for(timeout, interval, what, || {
        let fut = check_fn();
        async move { Ok(fut.await?.then_some(())) }
    })
    .await
}
