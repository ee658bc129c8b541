//! Process-wide cache of the published verification keys.
//!
//! [`KeyCache`] holds one immutable snapshot of the key set: a `kid` map plus a
//! single expiry shared by every entry. A refresh fetches and parses the whole
//! document outside any lock, then swaps the snapshot pointer, so readers see
//! either the old set or the new one and never block each other.
//!
//! # Refresh discipline
//!
//! - **TTL**: Default [`DEFAULT_CACHE_TTL`] (1 hour) from the last successful refresh
//! - **Failure isolation**: A failed fetch leaves the previous snapshot untouched
//! - **Single flight**: Refreshes are serialized; callers that observed the same snapshot share
//!   the outcome of one fetch (see [`refresh_after`](KeyCache::refresh_after))
//! - **Cancellation**: Every fetch races the caller's [`CancellationToken`] and the fetch timeout
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stockfolio_authn::{KeyCache, fetcher::KeySetFetcher};
//!
//! async fn example(fetcher: Arc<dyn KeySetFetcher>) {
//!     let cache = KeyCache::new(fetcher);
//!     cache.refresh().await.expect("initial fetch");
//!     let key = cache.lookup("rsa-1");
//! }
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fail::fail_point;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::FetchError,
    fetcher::KeySetFetcher,
    key_material::{KeyDescriptor, PublicKey, parse_key_set},
};

/// Default lifetime of a fetched key set (1 hour).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3_600);

/// Default deadline for one fetch of the key-publication document.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One immutable generation of the key set.
struct KeySnapshot {
    keys: HashMap<String, Arc<PublicKey>>,
    /// `None` until the first successful refresh.
    expires_at: Option<Instant>,
    generation: u64,
}

impl KeySnapshot {
    fn empty() -> Self {
        Self { keys: HashMap::new(), expires_at: None, generation: 0 }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now < expires_at)
    }
}

/// Position in the refresh history, captured before a lookup.
///
/// Passing it back to [`KeyCache::refresh_after`] lets the cache tell whether
/// another caller already refreshed since the lookup missed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshTicket {
    generation: u64,
    attempts: u64,
}

impl RefreshTicket {
    /// Snapshot generation observed when the ticket was taken.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Point-in-time counters for a [`KeyCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct KeyCacheStats {
    /// Generation of the current snapshot; bumped on every successful refresh.
    pub generation: u64,
    /// Keys in the current snapshot.
    pub keys: usize,
    /// Successful refreshes.
    pub refreshes: u64,
    /// Failed refreshes, excluding cancellations.
    pub failures: u64,
    /// Refresh requests answered by another caller's fetch.
    pub coalesced: u64,
}

/// TTL-bounded cache of parsed verification keys.
pub struct KeyCache {
    fetcher: Arc<dyn KeySetFetcher>,
    ttl: Duration,
    fetch_timeout: Duration,
    /// Current snapshot. The write lock is held only for the pointer swap.
    snapshot: RwLock<Arc<KeySnapshot>>,
    /// Serializes fetches; held across the network call.
    refresh_gate: AsyncMutex<()>,
    /// Completed fetch attempts, successful or not. Written under `refresh_gate`.
    attempts: AtomicU64,
    /// Outcome of the latest attempt when it failed. Written under `refresh_gate`.
    last_failure: Mutex<Option<FetchError>>,
    refreshes: AtomicU64,
    failures: AtomicU64,
    coalesced: AtomicU64,
    /// Stops the background refresh task and any fetch it has in flight.
    cancel_token: CancellationToken,
    refresh_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl KeyCache {
    /// Creates an empty cache with [`DEFAULT_CACHE_TTL`] and [`DEFAULT_FETCH_TIMEOUT`].
    ///
    /// Nothing is fetched until the first [`refresh`](Self::refresh).
    #[must_use]
    pub fn new(fetcher: Arc<dyn KeySetFetcher>) -> Self {
        Self {
            fetcher,
            ttl: DEFAULT_CACHE_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            snapshot: RwLock::new(Arc::new(KeySnapshot::empty())),
            refresh_gate: AsyncMutex::new(()),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            cancel_token: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
        }
    }

    /// Sets the lifetime of a fetched key set.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the deadline for a single fetch.
    #[must_use]
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Returns the key for `kid` if the current set is unexpired and contains it.
    ///
    /// Never blocks on other readers and never fetches.
    #[must_use]
    pub fn lookup(&self, kid: &str) -> Option<Arc<PublicKey>> {
        let snapshot = self.current();
        if !snapshot.is_fresh(Instant::now()) {
            tracing::debug!(kid, generation = snapshot.generation, "key set missing or expired");
            return None;
        }
        let key = snapshot.keys.get(kid).cloned();
        tracing::debug!(kid, hit = key.is_some(), "key cache lookup");
        key
    }

    /// Returns the key for `kid` from an expired set, provided the set expired
    /// less than `max_stale` ago.
    ///
    /// Used only as a fallback when a refresh cannot reach the endpoint.
    #[must_use]
    pub fn lookup_stale(&self, kid: &str, max_stale: Duration) -> Option<Arc<PublicKey>> {
        let snapshot = self.current();
        let expires_at = snapshot.expires_at?;
        // An unrepresentable limit never lapses.
        if expires_at.checked_add(max_stale).is_some_and(|limit| Instant::now() >= limit) {
            return None;
        }
        snapshot.keys.get(kid).cloned()
    }

    /// Captures the current refresh position. Take it before the lookup that
    /// may miss.
    #[must_use]
    pub fn ticket(&self) -> RefreshTicket {
        RefreshTicket {
            generation: self.current().generation,
            attempts: self.attempts.load(Ordering::Acquire),
        }
    }

    /// Fetches and installs the key set unconditionally.
    ///
    /// # Errors
    ///
    /// Returns the [`FetchError`] of the fetch; the previous snapshot is kept.
    pub async fn refresh(&self) -> Result<(), FetchError> {
        self.refresh_with_cancel(&CancellationToken::new()).await
    }

    /// [`refresh`](Self::refresh) that gives up with [`FetchError::Cancelled`]
    /// once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the [`FetchError`] of the fetch; the previous snapshot is kept.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn refresh_with_cancel(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let _gate = self.acquire_gate(cancel).await?;
        self.fetch_and_install(cancel).await
    }

    /// Refreshes unless another caller already did so since `ticket` was taken.
    ///
    /// - A newer snapshot already installed: returns `Ok(())` without fetching
    /// - A newer attempt already failed: returns that attempt's error without fetching, unless it
    ///   was a cancellation
    /// - Otherwise: fetches, as [`refresh_with_cancel`](Self::refresh_with_cancel)
    ///
    /// # Errors
    ///
    /// Returns the [`FetchError`] of this fetch or of the one it joined.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn refresh_after(
        &self,
        ticket: RefreshTicket,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let _gate = self.acquire_gate(cancel).await?;

        if self.current().generation != ticket.generation {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("joined concurrent refresh");
            return Ok(());
        }

        if self.attempts.load(Ordering::Acquire) != ticket.attempts
            && let Some(err) = self.last_failure.lock().clone()
            && err != FetchError::Cancelled
        {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(error = %err, "joined failed concurrent refresh");
            return Err(err);
        }

        self.fetch_and_install(cancel).await
    }

    /// Marks the current set as expired without dropping its keys.
    ///
    /// The next lookup misses and triggers a refresh; the old keys stay
    /// available to [`lookup_stale`](Self::lookup_stale).
    pub fn invalidate(&self) {
        let mut slot = self.snapshot.write();
        if slot.expires_at.is_none() {
            return;
        }
        let generation = slot.generation;
        *slot = Arc::new(KeySnapshot {
            keys: slot.keys.clone(),
            expires_at: Some(Instant::now()),
            generation,
        });
        drop(slot);
        tracing::info!(generation, "key set invalidated");
    }

    /// Key IDs in the current snapshot, sorted, whether fresh or not.
    #[must_use]
    pub fn key_ids(&self) -> Vec<String> {
        let mut kids: Vec<String> = self.current().keys.keys().cloned().collect();
        kids.sort_unstable();
        kids
    }

    /// Returns a snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> KeyCacheStats {
        let snapshot = self.current();
        KeyCacheStats {
            generation: snapshot.generation,
            keys: snapshot.keys.len(),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Configured key set lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cancellation token for the background refresh task.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Starts a background task that refreshes the key set every `interval`.
    ///
    /// The task holds only a weak reference and stops on [`shutdown`](Self::shutdown),
    /// on cancellation of [`cancel_token`](Self::cancel_token), or once the
    /// cache is dropped. A zero interval leaves the cache unchanged.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn with_refresh_interval(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        if interval.is_zero() {
            tracing::warn!("ignoring zero background refresh interval");
            return self;
        }

        let cache: Weak<Self> = Arc::downgrade(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("background refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        // Failures are logged inside the refresh.
                        let _ = cache.refresh_with_cancel(&token).await;
                    }
                }
            }
        });

        *self.refresh_handle.lock() = Some(handle);
        self
    }

    /// Stops the background refresh task, if any, and waits for it to exit.
    ///
    /// Cached keys are left in place.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "background refresh task panicked");
        }
    }

    fn current(&self) -> Arc<KeySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    async fn acquire_gate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AsyncMutexGuard<'_, ()>, FetchError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            guard = self.refresh_gate.lock() => Ok(guard),
        }
    }

    /// Must be called with `refresh_gate` held.
    async fn fetch_and_install(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let result = self.fetch_descriptors(cancel).await;
        self.attempts.fetch_add(1, Ordering::Release);

        match result {
            Ok(descriptors) => {
                let keys = parse_key_set(&descriptors);
                let loaded = keys.len();
                let expires_at = expiry_after(Instant::now(), self.ttl);

                let generation = {
                    let mut slot = self.snapshot.write();
                    let generation = slot.generation + 1;
                    *slot = Arc::new(KeySnapshot { keys, expires_at: Some(expires_at), generation });
                    generation
                };
                *self.last_failure.lock() = None;
                self.refreshes.fetch_add(1, Ordering::Relaxed);

                tracing::info!(
                    generation,
                    keys = loaded,
                    skipped = descriptors.len() - loaded,
                    "key set refreshed"
                );
                Ok(())
            },
            Err(err) => {
                *self.last_failure.lock() = Some(err.clone());
                if err == FetchError::Cancelled {
                    tracing::debug!("key set refresh cancelled");
                } else {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "key set refresh failed, keeping previous keys");
                }
                Err(err)
            },
        }
    }

    async fn fetch_descriptors(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyDescriptor>, FetchError> {
        fail_point!("key-cache-before-fetch", |_| {
            Err(FetchError::transport("injected failure before fetch"))
        });

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch()) => {
                result.unwrap_or_else(|_| Err(FetchError::Timeout))
            }
        }
    }
}

/// `now + ttl`, saturating at roughly 30 years ahead when the sum does not fit.
fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

    now.checked_add(ttl).or_else(|| now.checked_add(FAR_FUTURE)).unwrap_or(now)
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("ttl", &self.ttl)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
