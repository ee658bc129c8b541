//! # Stockfolio Authentication
//!
//! Bearer token verification for the Stockfolio API, backed by a cached copy
//! of the identity provider's published key set (JWKS).
//!
//! This crate provides:
//! - **Key material parsing**: RSA and EC (P-256, P-384, P-521) keys from JWK descriptors
//! - **Key set fetching**: One HTTP GET per refresh, behind the [`KeySetFetcher`] seam
//! - **Key cache**: Whole-set TTL, atomic snapshot swap, single-flight refresh
//! - **Token verification**: Algorithm/key binding, signature, `exp`/`nbf`, subject extraction
//!
//! ## Features
//!
//! - Only asymmetric algorithms (RS*, PS*, ES*) are supported
//! - Symmetric algorithms (HS256, etc.) and `none` are explicitly rejected
//! - A failed refresh never evicts keys that are already cached
//! - Every failure maps to one opaque [`PUBLIC_ERROR_MESSAGE`] at the HTTP boundary
//!
//! ## Example
//!
//! ```no_run
//! use stockfolio_authn::{AuthConfig, PRINCIPAL_CONTEXT_KEY, TokenVerifier};
//!
//! # async fn example(authorization: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::builder()
//!     .jwks_url("https://auth.example.com/.well-known/jwks.json")
//!     .build()?;
//! let verifier = TokenVerifier::from_config(&config)?;
//!
//! match verifier.authenticate(authorization).await {
//!     Ok(principal) => println!("{PRINCIPAL_CONTEXT_KEY} = {principal}"),
//!     Err(err) => println!("401: {}", err.public_message()),
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// `Authorization` header parsing and the verified principal.
pub mod bearer;
/// Verifier configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// Key set retrieval.
pub mod fetcher;
/// Cache of the published key set.
pub mod key_cache;
/// Key descriptors and parsed public keys.
pub mod key_material;
/// Key-id resolution.
pub mod resolver;
/// Test fixtures and helpers.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
/// Algorithm validation.
pub mod validation;
/// Token verification.
pub mod verifier;

// Re-export key types for convenience
pub use bearer::{PRINCIPAL_CONTEXT_KEY, Principal, extract_bearer_token};
pub use config::{AuthConfig, MAX_DURATION_SETTING};
pub use error::{AuthError, FetchError, PUBLIC_ERROR_MESSAGE, Result};
pub use fetcher::{DEFAULT_MAX_BODY_BYTES, HttpKeySetFetcher, KeySetFetcher};
pub use key_cache::{DEFAULT_CACHE_TTL, DEFAULT_FETCH_TIMEOUT, KeyCache, KeyCacheStats};
pub use key_material::{EcCurve, KeyDescriptor, KeyFamily, PublicKey};
pub use resolver::KeyResolver;
pub use validation::{
    ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, SigningAlgorithm, validate_algorithm, validate_kid,
};
pub use verifier::{TokenVerifier, decode_token};
