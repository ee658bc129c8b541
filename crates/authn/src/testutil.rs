//! Shared test utilities for authentication testing.
//!
//! This module provides fixed key fixtures (RSA and EC private keys plus the
//! matching published key set), an in-memory [`StaticKeySetFetcher`], helpers
//! for signing tokens and crafting raw tokens (for attack testing), and the
//! [`assert_auth_error!`](crate::assert_auth_error) macro. It is feature-gated
//! behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use std::sync::Arc;
//! use stockfolio_authn::testutil::{StaticKeySetFetcher, key_set_descriptors};
//!
//! let fetcher = Arc::new(StaticKeySetFetcher::new(key_set_descriptors()));
//! ```

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;

use crate::{
    error::FetchError,
    fetcher::KeySetFetcher,
    key_material::{KeyDescriptor, KeySetDocument},
};

/// PKCS#8 RSA 2048 private key published as `rsa-1`.
pub const RSA_PRIMARY_PEM: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/rsa_primary.pem"));

/// PKCS#8 RSA 2048 private key published only in [`JWKS_UNTRUSTED_JSON`] as `rsa-untrusted`.
pub const RSA_UNTRUSTED_PEM: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/rsa_untrusted.pem"));

/// PKCS#8 P-256 private key published as `ec-256`.
pub const EC_P256_PEM: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/ec_p256.pem"));

/// PKCS#8 P-384 private key published as `ec-384`.
pub const EC_P384_PEM: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/ec_p384.pem"));

/// Key set publishing `rsa-1`, `ec-256`, `ec-384` and `ec-521`.
pub const JWKS_JSON: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/jwks.json"));

/// Key set publishing only `rsa-untrusted`.
pub const JWKS_UNTRUSTED_JSON: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/jwks_untrusted.json"));

const ES512_TOKEN: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/es512_token.txt"));

/// An ES512 token signed by `ec-521` with payload `{"sub":"user-521"}` and no `exp`.
///
/// `jsonwebtoken` cannot sign ES512, so this one is precomputed.
#[must_use]
pub fn es512_token() -> String {
    ES512_TOKEN.trim().to_owned()
}

/// Descriptors of [`JWKS_JSON`], in document order.
///
/// # Panics
///
/// Panics if the fixture is not a valid key set document.
#[must_use]
pub fn key_set_descriptors() -> Vec<KeyDescriptor> {
    parse_fixture(JWKS_JSON)
}

/// Descriptors of [`JWKS_UNTRUSTED_JSON`].
///
/// # Panics
///
/// Panics if the fixture is not a valid key set document.
#[must_use]
pub fn untrusted_descriptors() -> Vec<KeyDescriptor> {
    parse_fixture(JWKS_UNTRUSTED_JSON)
}

fn parse_fixture(json: &str) -> Vec<KeyDescriptor> {
    serde_json::from_str::<KeySetDocument>(json).expect("fixture key set").keys
}

/// Signs `claims` with a PEM private key.
///
/// # Panics
///
/// Panics if the PEM does not match `alg` or encoding fails.
pub fn sign_token(alg: Algorithm, pem: &str, kid: &str, claims: &serde_json::Value) -> String {
    let key = match alg {
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem.as_bytes()),
        _ => EncodingKey::from_rsa_pem(pem.as_bytes()),
    }
    .expect("fixture private key");

    let mut header = Header::new(alg);
    header.kid = Some(kid.to_owned());
    jsonwebtoken::encode(&header, claims, &key).expect("Failed to encode test JWT")
}

/// Creates a raw token string from arbitrary header and payload JSON.
///
/// The result has the structure `{header_b64}.{payload_b64}.` with an empty
/// signature. This is useful for testing rejection of malformed or attack
/// tokens (e.g., `alg: "none"`).
///
/// # Panics
///
/// Panics if JSON serialization fails.
pub fn craft_raw_token(header_json: &serde_json::Value, payload_json: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

/// In-memory [`KeySetFetcher`] with scripted behaviour.
///
/// Each call counts, then waits the configured delay, then returns either the
/// configured failure or the current descriptors.
#[derive(Debug, Default)]
pub struct StaticKeySetFetcher {
    keys: Mutex<Vec<KeyDescriptor>>,
    failure: Mutex<Option<FetchError>>,
    delay: Mutex<Duration>,
    fetch_count: AtomicUsize,
}

impl StaticKeySetFetcher {
    /// Creates a fetcher serving `keys`.
    #[must_use]
    pub fn new(keys: Vec<KeyDescriptor>) -> Self {
        Self { keys: Mutex::new(keys), ..Self::default() }
    }

    /// Replaces the served descriptors.
    pub fn set_keys(&self, keys: Vec<KeyDescriptor>) {
        *self.keys.lock() = keys;
    }

    /// Makes every fetch fail with `failure`, or succeed again with `None`.
    pub fn set_failure(&self, failure: Option<FetchError>) {
        *self.failure.lock() = failure;
    }

    /// Delays every fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Number of fetches started so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetFetcher for StaticKeySetFetcher {
    async fn fetch(&self) -> Result<Vec<KeyDescriptor>, FetchError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }
        Ok(self.keys.lock().clone())
    }
}

/// Asserts that a [`Result<T, AuthError>`](crate::error::AuthError) is an `Err`
/// matching the given [`AuthError`](crate::error::AuthError) variant.
///
/// Works with any `AuthError` variant. On failure, prints the expected variant
/// and the actual result for debugging.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use stockfolio_authn::assert_auth_error;
/// use stockfolio_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::token_expired());
/// assert_auth_error!(result, TokenExpired);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}
