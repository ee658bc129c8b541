//! Retrieval of the key-publication document.
//!
//! [`KeySetFetcher`] is the I/O seam of the crate: one call, one remote fetch,
//! no caching and no retries. [`HttpKeySetFetcher`] is the production
//! implementation; tests substitute an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::{
    error::{AuthError, FetchError},
    key_material::{KeyDescriptor, KeySetDocument},
};

/// Performs a single fetch of the published key set.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Fetches the document and returns its descriptors in document order.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on transport failure, a non-success status, or
    /// a body that is not a key-publication document.
    async fn fetch(&self) -> Result<Vec<KeyDescriptor>, FetchError>;
}

/// Default limit on the size of a key-publication document (1 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Fetches the key set with an HTTP GET against a fixed URL.
#[derive(Clone, Debug)]
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    url: Url,
    max_body_bytes: usize,
}

impl HttpKeySetFetcher {
    /// Creates a fetcher with its own client bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the URL is not http(s) or the
    /// HTTP client cannot be built.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::invalid_config(format!("http client: {err}")))?;
        Self::with_client(client, url)
    }

    /// Creates a fetcher that shares an existing client.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the URL is not http(s).
    pub fn with_client(client: reqwest::Client, url: Url) -> Result<Self, AuthError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AuthError::invalid_config(format!(
                "jwks_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        Ok(Self { client, url, max_body_bytes: DEFAULT_MAX_BODY_BYTES })
    }

    /// Sets the largest document body accepted, in bytes.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// The endpoint this fetcher reads.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<KeyDescriptor>, FetchError> {
        let mut response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { status: status.as_u16() });
        }

        let limit = self.max_body_bytes;
        if let Some(length) = response.content_length()
            && length > limit as u64
        {
            return Err(FetchError::body(format!("document is {length} bytes, limit is {limit}")));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::body(format!("document exceeds {limit} bytes")));
            }
            body.extend_from_slice(&chunk);
        }

        let document: KeySetDocument = serde_json::from_slice(&body)
            .map_err(|err| FetchError::body(format!("invalid key set document: {err}")))?;
        tracing::debug!(keys = document.keys.len(), "fetched key set");
        Ok(document.keys)
    }
}
