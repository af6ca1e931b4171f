//! Retry and polling helpers shared by drivers and the dispatcher.

pub mod pwd;

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::context::Context;
use crate::error::DockError;

/// Run `op` up to `attempts` times, sleeping `delay` between attempts, and
/// return the first success or the last error.
pub async fn retry<T, F, Fut>(
    what: &str,
    attempts: usize,
    delay: Duration,
    mut op: F,
) -> Result<T, DockError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, DockError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                warn!(%what, attempt, error = %e, "attempt failed, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Floor applied to polling intervals; a zero period would spin.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Poll `check` every `interval` until it reports `true`.
///
/// Returns [`DockError::Timeout`] after `timeout` and [`DockError::Canceled`]
/// when `ctx` is canceled first. Errors from `check` end the wait.
pub async fn wait_for<F, Fut>(
    ctx: &Context,
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<(), DockError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, DockError>>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));

    loop {
        tokio::select! {
            biased;
            _ = ctx.canceled() => return Err(DockError::Canceled(what.to_owned())),
            _ = &mut deadline => {
                return Err(DockError::Timeout(format!("{what} after {timeout:?}")));
            }
            _ = ticker.tick() => {
                if check().await? {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), _> = retry("part", 3, Duration::ZERO, |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(DockError::Transport(format!("attempt {n}"))) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(res.unwrap_err(), DockError::Transport("attempt 3".into()));
    }

    #[tokio::test]
    async fn retry_stops_on_success() {
        let res = retry("part", 3, Duration::ZERO, |n| async move {
            if n < 2 {
                Err(DockError::Transport("flaky".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 2);
    }

    #[tokio::test]
    async fn zero_interval_still_polls() {
        let calls = AtomicUsize::new(0);
        wait_for(
            &Context::background(),
            "lun ready",
            Duration::ZERO,
            Duration::from_millis(500),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n >= 2) }
            },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let err = wait_for(
            &Context::background(),
            "lun ready",
            Duration::from_millis(5),
            Duration::from_millis(30),
            || async { Ok(false) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();
        let err = wait_for(
            &ctx,
            "lun ready",
            Duration::from_millis(5),
            Duration::from_secs(5),
            || async { Ok(false) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn wait_succeeds_when_condition_turns_true() {
        let polls = AtomicUsize::new(0);
        wait_for(
            &Context::background(),
            "share healthy",
            Duration::from_millis(1),
            Duration::from_secs(1),
            || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n >= 2) }
            },
        )
        .await
        .unwrap();
    }
}
