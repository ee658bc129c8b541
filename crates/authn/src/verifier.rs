//! Bearer token verification.
//!
//! [`TokenVerifier`] turns a compact JWS token into a verified [`Principal`]:
//!
//! ```text
//! token → split into header.payload.signature, decode, parse JSON
//!       → algorithm policy (none / HS* / untrusted family rejected)
//!       → kid hygiene
//!       → KeyResolver (cache, refresh on miss)
//!       → algorithm/key binding (family, and curve for EC)
//!       → signature over "header.payload"
//!       → exp / nbf
//!       → sub
//! ```
//!
//! Verification mutates nothing except, on a cache miss, the key cache.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    bearer::{Principal, extract_bearer_token},
    config::AuthConfig,
    error::{AuthError, FetchError},
    fetcher::HttpKeySetFetcher,
    key_cache::KeyCache,
    key_material::KeyFamily,
    resolver::KeyResolver,
    validation::{validate_algorithm, validate_kid},
};

/// The header fields the verifier reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenHeader {
    /// Declared algorithm.
    pub alg: String,
    /// Declared key ID.
    pub kid: String,
}

/// A structurally valid token whose signature has not been checked.
#[derive(Clone, Debug)]
pub struct UnverifiedToken<'a> {
    /// Decoded header.
    pub header: TokenHeader,
    /// Decoded payload claims.
    pub claims: Map<String, Value>,
    signing_input: &'a str,
    signature: &'a str,
}

/// Splits and decodes a compact token without verifying it.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the token does not have exactly
/// three segments, a segment is not base64url, the header or payload is not a
/// JSON object, or the header lacks `alg` or `kid`.
pub fn decode_token(token: &str) -> Result<UnverifiedToken<'_>, AuthError> {
    let mut segments = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(AuthError::malformed_token("expected 3 segments"));
    };

    let header_bytes = decode_segment("header", header_b64)?;
    let payload_bytes = decode_segment("payload", payload_b64)?;
    decode_segment("signature", signature)?;

    let header: Map<String, Value> = serde_json::from_slice(&header_bytes)
        .map_err(|err| AuthError::malformed_token(format!("header: {err}")))?;
    let claims: Map<String, Value> = serde_json::from_slice(&payload_bytes)
        .map_err(|err| AuthError::malformed_token(format!("payload: {err}")))?;

    let alg = header_string(&header, "alg")?;
    let kid = header_string(&header, "kid")?;

    // header.payload, as signed
    let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];

    Ok(UnverifiedToken { header: TokenHeader { alg, kid }, claims, signing_input, signature })
}

fn header_string(header: &Map<String, Value>, field: &str) -> Result<String, AuthError> {
    match header.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => {
            Err(AuthError::malformed_token(format!("header field '{field}' is not a string")))
        },
        None => Err(AuthError::malformed_token(format!("header missing '{field}' field"))),
    }
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|err| AuthError::malformed_token(format!("{name} is not base64url: {err}")))
}

/// Verifies bearer tokens against the published key set.
///
/// Cheap to clone; clones share the key cache.
///
/// # Example
///
/// ```no_run
/// use stockfolio_authn::{AuthConfig, TokenVerifier};
///
/// # async fn example(authorization: Option<&str>) -> Result<(), stockfolio_authn::AuthError> {
/// let config = AuthConfig::builder()
///     .jwks_url("https://auth.example.com/.well-known/jwks.json")
///     .build()?;
/// let verifier = TokenVerifier::from_config(&config)?;
///
/// let principal = verifier.authenticate(authorization).await?;
/// println!("request from {principal}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    resolver: KeyResolver,
    allowed_families: Vec<KeyFamily>,
    leeway: Duration,
}

impl TokenVerifier {
    /// Creates a verifier trusting RSA and EC with no clock leeway.
    #[must_use]
    pub fn new(resolver: KeyResolver) -> Self {
        Self {
            resolver,
            allowed_families: vec![KeyFamily::Rsa, KeyFamily::Ec],
            leeway: Duration::ZERO,
        }
    }

    /// Builds the full pipeline (HTTP fetcher, cache, resolver) from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the configuration is invalid or
    /// the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// With `refresh_interval` set, must be called within a Tokio runtime context.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        config.validate()?;

        let fetcher = HttpKeySetFetcher::new(config.jwks_url().clone(), config.fetch_timeout())?;
        let mut cache = Arc::new(
            KeyCache::new(Arc::new(fetcher))
                .with_ttl(config.cache_ttl())
                .with_fetch_timeout(config.fetch_timeout()),
        );
        if let Some(interval) = config.refresh_interval() {
            cache = cache.with_refresh_interval(interval);
        }

        let mut resolver = KeyResolver::new(cache);
        if let Some(ttl) = config.unknown_kid_ttl() {
            resolver = resolver.with_unknown_kid_ttl(ttl);
        }
        if let Some(max_stale) = config.max_stale() {
            resolver = resolver.with_max_stale(max_stale);
        }

        Ok(Self::new(resolver)
            .with_allowed_families(config.allowed_families().to_vec())
            .with_leeway(config.leeway()))
    }

    /// Restricts the trusted algorithm families.
    #[must_use]
    pub fn with_allowed_families(mut self, allowed_families: Vec<KeyFamily>) -> Self {
        self.allowed_families = allowed_families;
        self
    }

    /// Sets the clock skew tolerated on `exp` and `nbf`.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// The resolver this verifier obtains keys from.
    #[must_use]
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Verifies a compact token and returns its subject.
    ///
    /// # Errors
    ///
    /// Any [`AuthError`] kind except `InvalidConfig`. A key set that cannot be
    /// fetched surfaces as [`AuthError::UnknownKey`].
    pub async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.verify_with_cancel(token, &CancellationToken::new()).await
    }

    /// [`verify`](Self::verify) whose key fetch gives up once `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`verify`](Self::verify); cancellation yields
    /// `AuthError::Fetch(FetchError::Cancelled)` rather than `UnknownKey`.
    #[tracing::instrument(skip(self, token, cancel))]
    pub async fn verify_with_cancel(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Principal, AuthError> {
        let result = self.verify_inner(token, cancel).await;
        match &result {
            Ok(principal) => tracing::debug!(principal = %principal, "token verified"),
            Err(err) if err.is_cancelled() => tracing::debug!("token verification cancelled"),
            Err(err) => tracing::debug!(error = %err, "token rejected"),
        }
        result
    }

    /// Extracts the bearer token from an `Authorization` header value and
    /// verifies it.
    ///
    /// # Errors
    ///
    /// [`AuthError::MalformedToken`] for a missing or malformed header, then as
    /// [`verify`](Self::verify).
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, AuthError> {
        let token = extract_bearer_token(authorization)?;
        self.verify(token).await
    }

    /// Stops the key cache's background refresh task, if any.
    pub async fn shutdown(&self) {
        self.resolver.cache().shutdown().await;
    }

    async fn verify_inner(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Principal, AuthError> {
        let decoded = decode_token(token)?;
        let TokenHeader { alg, kid } = &decoded.header;

        let algorithm = validate_algorithm(alg, &self.allowed_families)?;
        validate_kid(kid)?;

        let key = match self.resolver.resolve_with_cancel(kid, cancel).await {
            Ok(key) => key,
            Err(AuthError::Fetch(FetchError::Cancelled)) => {
                return Err(AuthError::Fetch(FetchError::Cancelled));
            },
            Err(AuthError::Fetch(err)) => {
                tracing::warn!(kid = %kid, error = %err, "key set unavailable, rejecting token");
                return Err(AuthError::unknown_key(kid.as_str()));
            },
            Err(err) => return Err(err),
        };

        if !key.accepts(algorithm) {
            return Err(AuthError::algorithm_mismatch(alg.as_str(), kid.as_str()));
        }

        key.verify_signature(algorithm, decoded.signing_input.as_bytes(), decoded.signature)?;

        check_temporal_claims(&decoded.claims, now_seconds(), self.leeway)?;

        match decoded.claims.get("sub") {
            Some(Value::String(sub)) if !sub.is_empty() => Ok(Principal::new(sub.clone())),
            _ => Err(AuthError::missing_subject()),
        }
    }
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1_000.0
}

/// Checks `exp` and `nbf` against `now` (seconds since the epoch).
///
/// Absent claims are accepted. The token is expired once `now >= exp + leeway`
/// and not yet valid while `now < nbf - leeway`.
fn check_temporal_claims(
    claims: &Map<String, Value>,
    now: f64,
    leeway: Duration,
) -> Result<(), AuthError> {
    let leeway = leeway.as_secs_f64();

    if let Some(exp) = numeric_date(claims, "exp")?
        && now >= exp + leeway
    {
        return Err(AuthError::token_expired());
    }

    if let Some(nbf) = numeric_date(claims, "nbf")?
        && now < nbf - leeway
    {
        return Err(AuthError::token_not_yet_valid());
    }

    Ok(())
}

/// Reads an integer or fractional NumericDate claim.
fn numeric_date(claims: &Map<String, Value>, name: &str) -> Result<Option<f64>, AuthError> {
    match claims.get(name) {
        None => Ok(None),
        Some(Value::Number(number)) => match number.as_f64() {
            Some(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(AuthError::malformed_token(format!("'{name}' is out of range"))),
        },
        Some(_) => Err(AuthError::malformed_token(format!("'{name}' must be a number"))),
    }
}
