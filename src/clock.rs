//! Time source and backoff utilities.
//!
//! Retry loops and the refresh policy read the current time and sleep through
//! a [`Clock`], so tests can drive them without real delay.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Boxed, sendable future used at the crate's dynamic seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Wall-clock time and sleeping.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current UTC time.
    fn now(&self) -> OffsetDateTime;

    /// Returns a future that completes after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// [`Clock`] backed by the system clock and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeps on `clock` unless `token` is cancelled first.
///
/// Returns `true` if the sleep was interrupted by cancellation.
pub(crate) async fn sleep_or_cancel(
    clock: &dyn Clock,
    token: &CancellationToken,
    dur: Duration,
) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = clock.sleep(dur) => false,
    }
}

/// Exponential backoff with small jitter.
///
/// Doubles `current`, clamps it to `max`, then adds 0-10% jitter (still
/// clamped to `max`) so that many processes started together do not hit the
/// endpoint in lockstep.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = (cur.saturating_mul(2)).min(max);
    if base == 0 {
        return Duration::from_millis(0);
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis((base.saturating_add(add)).min(max))
}

/// Converts a non-negative `time::Duration` into a `std::time::Duration`,
/// saturating negative values to zero.
pub(crate) fn to_std(d: time::Duration) -> Duration {
    Duration::try_from(d).unwrap_or(Duration::ZERO)
}
