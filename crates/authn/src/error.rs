//! Authentication error types.
//!
//! This module defines the errors that can occur while fetching the published
//! key set, parsing key material, and verifying bearer tokens.
//!
//! Every variant is terminal for the request that produced it. The HTTP
//! boundary collapses all of them into a single 401 response carrying
//! [`AuthError::public_message`]; the `Display` text is for server-side logs
//! only.

use thiserror::Error;

/// Text the HTTP boundary may send back for any authentication failure.
pub const PUBLIC_ERROR_MESSAGE: &str = "unauthorized";

/// Failure to retrieve the key-publication document.
///
/// Kept separate from [`AuthError`] so the fetcher boundary stays small and so
/// the key cache can hand the same failure to every request coalesced onto a
/// single refresh (hence `Clone`).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    /// Connection, DNS or TLS failure before a response arrived.
    #[error("JWKS transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The endpoint answered with a non-success status.
    #[error("JWKS endpoint returned HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The response body is not a key-publication document.
    #[error("Malformed JWKS document: {message}")]
    Body {
        /// Description of the decoding failure.
        message: String,
    },

    /// The fetch exceeded its deadline.
    #[error("JWKS fetch timed out")]
    Timeout,

    /// The caller cancelled the fetch.
    #[error("JWKS fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Creates a new `Transport` error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a new `Body` error.
    #[must_use]
    pub fn body(message: impl Into<String>) -> Self {
        Self::Body { message: message.into() }
    }

    /// Returns `true` for failures a later attempt may not repeat.
    ///
    /// A non-success status is treated as transient only for 5xx and 429.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout => true,
            Self::Status { status } => *status >= 500 || *status == 429,
            Self::Body { .. } | Self::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Status { status: status.as_u16() }
        } else if err.is_decode() {
            FetchError::body(err.to_string())
        } else {
            FetchError::transport(err.to_string())
        }
    }
}

/// Authentication errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Token structure is invalid: segment count, encoding, JSON, or a
    /// required header field.
    #[error("Malformed token: {message}")]
    MalformedToken {
        /// What was wrong with the token.
        message: String,
    },

    /// A published key could not be turned into a public key.
    #[error("Malformed key {kid}: {message}")]
    MalformedKey {
        /// Key ID of the offending descriptor.
        kid: String,
        /// What was wrong with the key material.
        message: String,
    },

    /// A published EC key names a curve this crate cannot verify with.
    #[error("Unsupported curve {curve} for key {kid}")]
    UnsupportedCurve {
        /// Key ID of the offending descriptor.
        kid: String,
        /// Curve name as published.
        curve: String,
    },

    /// Retrieving the key set failed.
    #[error("Key set fetch failed: {0}")]
    Fetch(#[source] FetchError),

    /// The token's key ID is not in the published key set.
    #[error("Unknown signing key: {kid}")]
    UnknownKey {
        /// Key ID from the token header.
        kid: String,
    },

    /// Declared algorithm does not belong to the resolved key's family
    /// (or, for EC, its curve).
    #[error("Algorithm {alg} cannot be used with key {kid}")]
    AlgorithmMismatch {
        /// Algorithm from the token header.
        alg: String,
        /// Key ID from the token header.
        kid: String,
    },

    /// Declared algorithm is not trusted.
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// Why the algorithm was refused.
        message: String,
    },

    /// Signature verification failed.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Token has expired.
    #[error("Token expired")]
    TokenExpired,

    /// Token not yet valid (nbf claim in future).
    #[error("Token not yet valid")]
    TokenNotYetValid,

    /// The payload has no usable `sub` claim.
    #[error("Missing subject claim")]
    MissingSubject,

    /// Configuration rejected at construction time.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Which setting was rejected and why.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `MalformedToken` error.
    #[must_use]
    pub fn malformed_token(message: impl Into<String>) -> Self {
        Self::MalformedToken { message: message.into() }
    }

    /// Creates a new `MalformedKey` error.
    #[must_use]
    pub fn malformed_key(kid: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedKey { kid: kid.into(), message: message.into() }
    }

    /// Creates a new `UnsupportedCurve` error.
    #[must_use]
    pub fn unsupported_curve(kid: impl Into<String>, curve: impl Into<String>) -> Self {
        Self::UnsupportedCurve { kid: kid.into(), curve: curve.into() }
    }

    /// Creates a new `UnknownKey` error.
    #[must_use]
    pub fn unknown_key(kid: impl Into<String>) -> Self {
        Self::UnknownKey { kid: kid.into() }
    }

    /// Creates a new `AlgorithmMismatch` error.
    #[must_use]
    pub fn algorithm_mismatch(alg: impl Into<String>, kid: impl Into<String>) -> Self {
        Self::AlgorithmMismatch { alg: alg.into(), kid: kid.into() }
    }

    /// Creates a new `UnsupportedAlgorithm` error.
    #[must_use]
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm { message: message.into() }
    }

    /// Creates a new `InvalidSignature` error.
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::InvalidSignature
    }

    /// Creates a new `TokenExpired` error.
    #[must_use]
    pub fn token_expired() -> Self {
        Self::TokenExpired
    }

    /// Creates a new `TokenNotYetValid` error.
    #[must_use]
    pub fn token_not_yet_valid() -> Self {
        Self::TokenNotYetValid
    }

    /// Creates a new `MissingSubject` error.
    #[must_use]
    pub fn missing_subject() -> Self {
        Self::MissingSubject
    }

    /// Creates a new `InvalidConfig` error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// Returns `true` if the request was abandoned by its caller rather than
    /// rejected.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Cancelled))
    }

    /// The only text that may be returned to the client for this error.
    ///
    /// Identical for every variant so responses cannot be used as an oracle
    /// on the verification logic.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        PUBLIC_ERROR_MESSAGE
    }
}

impl From<FetchError> for AuthError {
    fn from(err: FetchError) -> Self {
        AuthError::Fetch(err)
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
