//! JWT algorithm and key ID validation.
//!
//! This module provides the security checks that run on a token header before
//! any key lookup happens.
//!
//! # Security
//!
//! - Only asymmetric RSA and EC signature algorithms are recognised
//! - Symmetric algorithms and "none" are always rejected
//! - Each algorithm is bound to a key family (and, for EC, to a curve); the verifier enforces that
//!   binding against the resolved key

use std::fmt;

use crate::{
    error::AuthError,
    key_material::{EcCurve, KeyFamily},
};

/// Forbidden JWT algorithms that are never accepted for security reasons.
///
/// - `none`: No signature verification (trivially bypassable)
/// - `HS256`, `HS384`, `HS512`: Symmetric algorithms; the published public key would become the
///   shared secret
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Every algorithm name this crate can verify.
///
/// Whether a given name is accepted at runtime also depends on the configured
/// key families (see [`validate_algorithm`]).
pub const ACCEPTED_ALGORITHMS: &[&str] =
    &["RS256", "RS384", "RS512", "PS256", "PS384", "PS512", "ES256", "ES384", "ES512"];

/// Maximum accepted length of a `kid` header value, in bytes.
pub const MAX_KID_LENGTH: usize = 256;

/// A signature algorithm accepted in the token header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RS256,
    /// RSASSA-PKCS1-v1_5 with SHA-384.
    RS384,
    /// RSASSA-PKCS1-v1_5 with SHA-512.
    RS512,
    /// RSASSA-PSS with SHA-256.
    PS256,
    /// RSASSA-PSS with SHA-384.
    PS384,
    /// RSASSA-PSS with SHA-512.
    PS512,
    /// ECDSA over P-256 with SHA-256.
    ES256,
    /// ECDSA over P-384 with SHA-384.
    ES384,
    /// ECDSA over P-521 with SHA-512.
    ES512,
}

impl SigningAlgorithm {
    /// Parses a JOSE algorithm name. Matching is case-sensitive.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let alg = match name {
            "RS256" => Self::RS256,
            "RS384" => Self::RS384,
            "RS512" => Self::RS512,
            "PS256" => Self::PS256,
            "PS384" => Self::PS384,
            "PS512" => Self::PS512,
            "ES256" => Self::ES256,
            "ES384" => Self::ES384,
            "ES512" => Self::ES512,
            _ => return None,
        };
        Some(alg)
    }

    /// The JOSE name of this algorithm.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::PS256 => "PS256",
            Self::PS384 => "PS384",
            Self::PS512 => "PS512",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
        }
    }

    /// The key family a key must belong to for this algorithm.
    #[must_use]
    pub fn family(&self) -> KeyFamily {
        match self {
            Self::RS256 | Self::RS384 | Self::RS512 | Self::PS256 | Self::PS384 | Self::PS512 => {
                KeyFamily::Rsa
            },
            Self::ES256 | Self::ES384 | Self::ES512 => KeyFamily::Ec,
        }
    }

    /// The curve an EC key must be on for this algorithm.
    #[must_use]
    pub fn curve(&self) -> Option<EcCurve> {
        match self {
            Self::ES256 => Some(EcCurve::P256),
            Self::ES384 => Some(EcCurve::P384),
            Self::ES512 => Some(EcCurve::P521),
            _ => None,
        }
    }

    /// The `jsonwebtoken` equivalent, if that crate can verify it.
    ///
    /// `ES512` has no `jsonwebtoken` counterpart and is verified with `p521`.
    pub(crate) fn jwt_algorithm(&self) -> Option<jsonwebtoken::Algorithm> {
        use jsonwebtoken::Algorithm;

        match self {
            Self::RS256 => Some(Algorithm::RS256),
            Self::RS384 => Some(Algorithm::RS384),
            Self::RS512 => Some(Algorithm::RS512),
            Self::PS256 => Some(Algorithm::PS256),
            Self::PS384 => Some(Algorithm::PS384),
            Self::PS512 => Some(Algorithm::PS512),
            Self::ES256 => Some(Algorithm::ES256),
            Self::ES384 => Some(Algorithm::ES384),
            Self::ES512 => None,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a JWT algorithm name against security policies.
///
/// - ALWAYS rejects symmetric algorithms (HS256, HS384, HS512)
/// - ALWAYS rejects "none"
/// - Rejects names outside [`ACCEPTED_ALGORITHMS`]
/// - Rejects algorithms whose family is not in `allowed_families`
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] on any of the above.
///
/// # Examples
///
/// ```
/// use stockfolio_authn::{key_material::KeyFamily, validation::validate_algorithm};
///
/// let families = [KeyFamily::Rsa, KeyFamily::Ec];
/// assert!(validate_algorithm("RS256", &families).is_ok());
/// assert!(validate_algorithm("HS256", &families).is_err());
///
/// // EC algorithms are refused once the EC family is no longer trusted
/// assert!(validate_algorithm("ES256", &[KeyFamily::Rsa]).is_err());
/// ```
pub fn validate_algorithm(
    alg: &str,
    allowed_families: &[KeyFamily],
) -> Result<SigningAlgorithm, AuthError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|forbidden| forbidden.eq_ignore_ascii_case(alg)) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    let Some(algorithm) = SigningAlgorithm::from_name(alg) else {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not in accepted list"
        )));
    };

    if !allowed_families.contains(&algorithm.family()) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' belongs to the untrusted {} family",
            algorithm.family()
        )));
    }

    Ok(algorithm)
}

/// Validate a `kid` header value before it is used as a cache key.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the key ID is empty, longer than
/// [`MAX_KID_LENGTH`] bytes, or contains control characters.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::malformed_token("kid must not be empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(AuthError::malformed_token(format!(
            "kid exceeds {MAX_KID_LENGTH} bytes ({} bytes)",
            kid.len()
        )));
    }
    if kid.chars().any(char::is_control) {
        return Err(AuthError::malformed_token("kid contains control characters"));
    }
    Ok(())
}
