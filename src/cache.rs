//! Credential cache and refresh policy.
//!
//! [`CredentialCache`] holds at most one current [`CredentialSet`] and
//! coordinates refreshes so that at most one refresh is in flight at a time:
//!
//! - **Empty**: the first caller starts a refresh; on failure the cache stays empty.
//! - **Valid**: while `expiry - now > early_refresh_margin` the cached set is
//!   returned without calling the refresh function.
//! - **Valid, nearly expired**: the next caller starts a refresh. On success the
//!   new set replaces the old one. On failure the previous set may be served
//!   once more (see [`RefreshPolicy::stale_tolerance`]); otherwise the error is
//!   returned. A set that has fully expired is dropped.
//! - **Refreshing**: callers join the in-flight refresh and receive its outcome.
//!
//! The refresh runs on a spawned task, so the cache never ends up half-updated
//! if a caller is dropped mid-refresh. Reads of a fresh cached set only touch
//! an atomic pointer and never wait on an in-flight refresh.

use crate::clock::{to_std, Clock, SystemClock};
use crate::credentials::CredentialSet;
use crate::prelude::{debug, warn};
use arc_swap::ArcSwapOption;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// When cached credentials are refreshed and how refresh failures are tolerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Credentials are refreshed once fewer than this much lifetime remains.
    pub early_refresh_margin: Duration,

    /// Stale serving on refresh failure.
    ///
    /// With `Some(min_remaining)`, a failed refresh returns the previous set
    /// one time if it still has more than `min_remaining` left; later
    /// failures surface the error until a refresh succeeds. `None` always
    /// surfaces the error.
    pub stale_tolerance: Option<Duration>,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            early_refresh_margin: Duration::from_secs(2 * 60),
            stale_tolerance: Some(Duration::from_secs(30)),
        }
    }
}

/// Observable cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No credentials are cached.
    Empty,
    /// Credentials are cached (they may be inside the refresh margin).
    Valid,
    /// A refresh is in flight.
    Refreshing,
}

/// How the credentials in a [`Lookup`] were obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source<E> {
    /// Served from cache without refreshing.
    Cached,
    /// Produced by a successful refresh.
    Refreshed,
    /// The refresh failed with the contained error; the previous set was served.
    Stale(E),
}

/// Credentials returned by [`CredentialCache::get_or_refresh`].
#[derive(Debug, Clone)]
pub struct Lookup<E> {
    /// The credentials.
    pub credentials: Arc<CredentialSet>,
    /// Where they came from.
    pub source: Source<E>,
}

/// Errors returned by [`CredentialCache::get_or_refresh`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError<E> {
    /// The refresh function failed and no cached set could be served.
    #[error(transparent)]
    Refresh(E),

    /// The refresh task ended without publishing a result (e.g. it panicked).
    #[error("refresh task ended without a result")]
    Aborted,
}

type RefreshResult<E> = Result<Lookup<E>, E>;
type InFlight<E> = watch::Receiver<Option<RefreshResult<E>>>;

/// Single-flight credential cache. See the [module documentation](self).
pub struct CredentialCache<E> {
    inner: Arc<Inner<E>>,
}

struct Inner<E> {
    current: ArcSwapOption<CredentialSet>,
    in_flight: Mutex<Option<InFlight<E>>>,
    stale_served: AtomicBool,
    refreshes: AtomicU64,
    policy: RefreshPolicy,
    clock: Arc<dyn Clock>,
}

impl<E> Debug for CredentialCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("current", &self.inner.current.load_full())
            .field("in_flight", &"<Mutex<Option<watch::Receiver<_>>>>")
            .field("stale_served", &self.inner.stale_served.load(Ordering::Relaxed))
            .field("refreshes", &self.inner.refreshes.load(Ordering::Relaxed))
            .field("policy", &self.inner.policy)
            .field("clock", &self.inner.clock)
            .finish()
    }
}

impl<E> CredentialCache<E>
where
    E: Clone + Debug + fmt::Display + Send + Sync + 'static,
{
    /// Creates an empty cache using the system clock.
    pub fn new(policy: RefreshPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Creates an empty cache reading time from `clock`.
    pub fn with_clock(policy: RefreshPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                current: ArcSwapOption::empty(),
                in_flight: Mutex::new(None),
                stale_served: AtomicBool::new(false),
                refreshes: AtomicU64::new(0),
                policy,
                clock,
            }),
        }
    }

    /// Returns the refresh policy.
    pub fn policy(&self) -> RefreshPolicy {
        self.inner.policy
    }

    /// Returns the current state.
    pub fn state(&self) -> CacheState {
        if self.inner.lock_in_flight().is_some() {
            CacheState::Refreshing
        } else if self.inner.current.load().is_some() {
            CacheState::Valid
        } else {
            CacheState::Empty
        }
    }

    /// Returns the cached set if it is outside the refresh margin.
    pub fn fresh(&self) -> Option<Arc<CredentialSet>> {
        self.inner.fresh()
    }

    /// Number of refreshes started since construction.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    /// Returns fresh cached credentials, or refreshes them with `refresh`.
    ///
    /// `refresh` is only called when this caller starts a new refresh; callers
    /// that join an in-flight refresh drop it unused.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Refresh`] with the refresh error when no cached set
    /// can be served, or [`CacheError::Aborted`] if the refresh task died.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<Lookup<E>, CacheError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CredentialSet, E>> + Send + 'static,
    {
        if let Some(credentials) = self.inner.fresh() {
            return Ok(Lookup {
                credentials,
                source: Source::Cached,
            });
        }

        let rx = {
            let mut slot = self.inner.lock_in_flight();
            match slot.as_ref() {
                Some(rx) => {
                    debug!("Joining in-flight credential refresh");
                    rx.clone()
                }
                None => {
                    // Double-check: a refresh may have completed while we waited for the lock.
                    if let Some(credentials) = self.inner.fresh() {
                        return Ok(Lookup {
                            credentials,
                            source: Source::Cached,
                        });
                    }

                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    self.inner.refreshes.fetch_add(1, Ordering::Relaxed);

                    let inner = Arc::clone(&self.inner);
                    let fut = refresh();
                    tokio::spawn(async move { inner.run_refresh(fut, tx).await });
                    rx
                }
            }
        };

        wait_for_outcome(rx).await
    }
}

async fn wait_for_outcome<E: Clone>(mut rx: InFlight<E>) -> Result<Lookup<E>, CacheError<E>> {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    match outcome {
        Some(Ok(lookup)) => Ok(lookup),
        Some(Err(e)) => Err(CacheError::Refresh(e)),
        None => Err(CacheError::Aborted),
    }
}

impl<E> Inner<E>
where
    E: Clone + Debug + fmt::Display + Send + Sync + 'static,
{
    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight<E>>> {
        // The slot holds no invariant a panic could break; recover from poisoning.
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh(&self) -> Option<Arc<CredentialSet>> {
        let now = self.clock.now();
        let margin = self.policy.early_refresh_margin;
        self.current
            .load_full()
            .filter(|c| to_std(c.remaining(now)) > margin)
    }

    async fn run_refresh<Fut>(self: Arc<Self>, fut: Fut, tx: watch::Sender<Option<RefreshResult<E>>>)
    where
        Fut: Future<Output = Result<CredentialSet, E>>,
    {
        let guard = ClearInFlight(&self.in_flight);
        let result = fut.await;
        let outcome = self.apply(result);
        // Clear the slot before publishing so later callers see the updated cache.
        drop(guard);
        // Every waiter may have been dropped already.
        let _ = tx.send(Some(outcome));
    }

    fn apply(&self, result: Result<CredentialSet, E>) -> RefreshResult<E> {
        let now = self.clock.now();
        match result {
            Ok(creds) => {
                let credentials = Arc::new(creds);
                self.current.store(Some(Arc::clone(&credentials)));
                self.stale_served.store(false, Ordering::Release);
                debug!(
                    "Stored refreshed credentials: expiration={}",
                    credentials.expiration()
                );
                Ok(Lookup {
                    credentials,
                    source: Source::Refreshed,
                })
            }
            Err(e) => match self.current.load_full() {
                Some(previous) if previous.is_expired(now) => {
                    self.current.store(None);
                    Err(e)
                }
                Some(previous) => {
                    let remaining = to_std(previous.remaining(now));
                    let tolerated = self
                        .policy
                        .stale_tolerance
                        .is_some_and(|min_remaining| remaining > min_remaining);
                    if tolerated && !self.stale_served.swap(true, Ordering::AcqRel) {
                        warn!(
                            "Credential refresh failed; serving previous credentials once: error={e}, remaining_s={}",
                            remaining.as_secs()
                        );
                        Ok(Lookup {
                            credentials: previous,
                            source: Source::Stale(e),
                        })
                    } else {
                        Err(e)
                    }
                }
                None => Err(e),
            },
        }
    }
}

struct ClearInFlight<'a, T>(&'a Mutex<Option<T>>);

impl<T> Drop for ClearInFlight<'_, T> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
