//! Key-id to verification-key resolution.
//!
//! [`KeyResolver`] answers "which trusted key does this `kid` name?" from the
//! [`KeyCache`], refreshing the cache once on a miss. Only keys that came
//! through the cache's fetch pipeline are ever returned; the token can select
//! among them by id but never supply key material.

use std::{sync::Arc, time::Duration};

use moka::future::Cache;
use tokio_util::sync::CancellationToken;

use crate::{
    error::AuthError,
    key_cache::KeyCache,
    key_material::PublicKey,
};

/// Maximum number of remembered unknown key IDs.
pub const DEFAULT_UNKNOWN_KID_CAPACITY: u64 = 10_000;

/// Longest unknown-kid memory; longer TTLs are clamped to it.
pub const MAX_UNKNOWN_KID_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Resolves key IDs to trusted public keys.
///
/// Cheap to clone; clones share the cache.
///
/// # Optional behaviour
///
/// Both are off by default, in which case every miss refreshes and every
/// failed refresh fails the resolution.
///
/// - **Unknown-kid memory** ([`with_unknown_kid_ttl`](Self::with_unknown_kid_ttl)): a kid that a
///   successful refresh did not contain is answered [`AuthError::UnknownKey`] without another
///   fetch, until the TTL lapses or a newer key set is installed
/// - **Stale fallback** ([`with_max_stale`](Self::with_max_stale)): when a refresh fails
///   transiently, a key from the expired set is served if the set expired less than `max_stale`
///   ago
#[derive(Clone, Debug)]
pub struct KeyResolver {
    cache: Arc<KeyCache>,
    /// kid -> snapshot generation in which it was confirmed absent.
    unknown_kids: Option<Cache<String, u64>>,
    max_stale: Option<Duration>,
}

impl KeyResolver {
    /// Creates a resolver over `cache`.
    #[must_use]
    pub fn new(cache: Arc<KeyCache>) -> Self {
        Self { cache, unknown_kids: None, max_stale: None }
    }

    /// Remembers confirmed-unknown key IDs for `ttl`, at most [`MAX_UNKNOWN_KID_TTL`].
    #[must_use]
    pub fn with_unknown_kid_ttl(mut self, ttl: Duration) -> Self {
        let ttl = ttl.min(MAX_UNKNOWN_KID_TTL);
        self.unknown_kids = Some(
            Cache::builder().max_capacity(DEFAULT_UNKNOWN_KID_CAPACITY).time_to_live(ttl).build(),
        );
        self
    }

    /// Allows serving keys from a set that expired less than `max_stale` ago
    /// when the refresh fails transiently.
    #[must_use]
    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = Some(max_stale);
        self
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// Resolves `kid`, refreshing the cache once on a miss.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownKey`] if `kid` is absent after a successful refresh
    /// - [`AuthError::Fetch`] if the refresh failed and no stale key could be served
    pub async fn resolve(&self, kid: &str) -> Result<Arc<PublicKey>, AuthError> {
        self.resolve_with_cancel(kid, &CancellationToken::new()).await
    }

    /// [`resolve`](Self::resolve) whose refresh gives up once `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`resolve`](Self::resolve); cancellation yields
    /// `AuthError::Fetch(FetchError::Cancelled)`.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn resolve_with_cancel(
        &self,
        kid: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<PublicKey>, AuthError> {
        let ticket = self.cache.ticket();
        if let Some(key) = self.cache.lookup(kid) {
            return Ok(key);
        }

        if let Some(unknown_kids) = &self.unknown_kids
            && unknown_kids.get(kid).await == Some(ticket.generation())
        {
            tracing::debug!(kid, "kid remembered as unknown");
            return Err(AuthError::unknown_key(kid));
        }

        if let Err(err) = self.cache.refresh_after(ticket, cancel).await {
            if let Some(max_stale) = self.max_stale
                && err.is_transient()
                && let Some(key) = self.cache.lookup_stale(kid, max_stale)
            {
                tracing::warn!(kid, error = %err, "serving key from expired set, refresh failed");
                return Ok(key);
            }
            return Err(AuthError::Fetch(err));
        }

        if let Some(key) = self.cache.lookup(kid) {
            return Ok(key);
        }

        if let Some(unknown_kids) = &self.unknown_kids {
            unknown_kids.insert(kid.to_owned(), self.cache.ticket().generation()).await;
        }
        tracing::debug!(kid, "kid not in published key set");
        Err(AuthError::unknown_key(kid))
    }
}
