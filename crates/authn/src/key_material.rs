//! Published key descriptors and their conversion into verification keys.
//!
//! A key-publication document lists [`KeyDescriptor`]s. Each one is turned into
//! an immutable [`PublicKey`] by [`parse_descriptor`]; [`parse_key_set`] does
//! the same for a whole document, skipping (and logging) descriptors that
//! cannot be used so one bad key never blocks the rest of the set.
//!
//! EC points are checked to lie on their curve when parsed, so a bad point
//! is skipped here instead of failing every signature later.
//!
//! # Example
//!
//! ```
//! use stockfolio_authn::key_material::{KeyDescriptor, KeyFamily, parse_key_set};
//!
//! let descriptors = vec![
//!     KeyDescriptor::rsa("k1", "AQAB", "AQAB"),
//!     KeyDescriptor::ec("k2", "secp256k1", "AA", "AA"),
//! ];
//!
//! let keys = parse_key_set(&descriptors);
//! assert_eq!(keys.len(), 1);
//! assert_eq!(keys["k1"].family(), KeyFamily::Rsa);
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::DecodingKey;
use p521::ecdsa::{Signature as P521Signature, VerifyingKey as P521VerifyingKey, signature::Verifier};
use serde::{Deserialize, Serialize};

use crate::{error::AuthError, validation::SigningAlgorithm};

/// Only descriptors published for signatures are loaded.
const SIGNATURE_USE: &str = "sig";

/// One key as published by the key-publication endpoint.
///
/// Field names follow the JWK wire format; unknown members (`x5c`, `key_ops`, ...)
/// are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    /// Key ID, unique within a key set.
    #[serde(default)]
    pub kid: String,
    /// Key type: `"RSA"` or `"EC"`.
    #[serde(default)]
    pub kty: String,
    /// Algorithm the publisher intends the key for. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Public key use (`"sig"` or `"enc"`).
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// RSA modulus, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA public exponent, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// EC curve name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC X coordinate, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC Y coordinate, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl KeyDescriptor {
    /// Builds an RSA signing descriptor.
    #[must_use]
    pub fn rsa(kid: impl Into<String>, n: impl Into<String>, e: impl Into<String>) -> Self {
        Self {
            kid: kid.into(),
            kty: "RSA".to_owned(),
            key_use: Some(SIGNATURE_USE.to_owned()),
            n: Some(n.into()),
            e: Some(e.into()),
            ..Self::default()
        }
    }

    /// Builds an EC signing descriptor.
    #[must_use]
    pub fn ec(
        kid: impl Into<String>,
        crv: impl Into<String>,
        x: impl Into<String>,
        y: impl Into<String>,
    ) -> Self {
        Self {
            kid: kid.into(),
            kty: "EC".to_owned(),
            key_use: Some(SIGNATURE_USE.to_owned()),
            crv: Some(crv.into()),
            x: Some(x.into()),
            y: Some(y.into()),
            ..Self::default()
        }
    }
}

/// The key-publication document: `{"keys": [...]}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySetDocument {
    /// Published keys, in document order.
    pub keys: Vec<KeyDescriptor>,
}

/// Cryptographic family of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFamily {
    /// RSA keys (RS* and PS* algorithms).
    #[serde(rename = "RSA", alias = "rsa")]
    Rsa,
    /// Elliptic-curve keys (ES* algorithms).
    #[serde(rename = "EC", alias = "ec")]
    Ec,
}

impl KeyFamily {
    /// Maps a JWK `kty` value to a family.
    #[must_use]
    pub fn from_kty(kty: &str) -> Option<Self> {
        match kty {
            "RSA" => Some(Self::Rsa),
            "EC" => Some(Self::Ec),
            _ => None,
        }
    }

    /// The JWK `kty` value for this family.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
        }
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// NIST prime curves accepted for EC keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// P-256 (secp256r1).
    P256,
    /// P-384 (secp384r1).
    P384,
    /// P-521 (secp521r1).
    P521,
}

impl EcCurve {
    /// Maps a JWK `crv` value to a curve.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "P-256" => Some(Self::P256),
            "P-384" => Some(Self::P384),
            "P-521" => Some(Self::P521),
            _ => None,
        }
    }

    /// The JWK `crv` value for this curve.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
            Self::P521 => "P-521",
        }
    }

    /// Byte length of one affine coordinate.
    #[must_use]
    pub fn coordinate_len(&self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An RSA verification key.
pub struct RsaPublicKey {
    kid: String,
    modulus_bits: usize,
    decoding_key: DecodingKey,
}

/// An EC verification key.
pub struct EcPublicKey {
    kid: String,
    curve: EcCurve,
    material: EcMaterial,
}

/// P-256/P-384 verify through `jsonwebtoken`; P-521 has no backend there.
enum EcMaterial {
    Jwt(DecodingKey),
    P521(P521VerifyingKey),
}

/// A parsed, immutable verification key tagged with its family.
pub enum PublicKey {
    /// RSA key.
    Rsa(RsaPublicKey),
    /// EC key.
    Ec(EcPublicKey),
}

impl PublicKey {
    /// Key ID this key was published under.
    #[must_use]
    pub fn kid(&self) -> &str {
        match self {
            Self::Rsa(key) => &key.kid,
            Self::Ec(key) => &key.kid,
        }
    }

    /// Family of this key.
    #[must_use]
    pub fn family(&self) -> KeyFamily {
        match self {
            Self::Rsa(_) => KeyFamily::Rsa,
            Self::Ec(_) => KeyFamily::Ec,
        }
    }

    /// Curve of an EC key; `None` for RSA.
    #[must_use]
    pub fn curve(&self) -> Option<EcCurve> {
        match self {
            Self::Rsa(_) => None,
            Self::Ec(key) => Some(key.curve),
        }
    }

    /// Returns `true` if `alg` may be used with this key.
    ///
    /// The family must match, and for EC the curve must be the one the
    /// algorithm is defined over.
    #[must_use]
    pub fn accepts(&self, alg: SigningAlgorithm) -> bool {
        match self {
            Self::Rsa(_) => alg.family() == KeyFamily::Rsa,
            Self::Ec(key) => alg.curve() == Some(key.curve),
        }
    }

    /// Checks a base64url `signature` over `message`.
    ///
    /// Callers must check [`accepts`](Self::accepts) first; an unbound
    /// algorithm is reported as [`AuthError::AlgorithmMismatch`].
    pub(crate) fn verify_signature(
        &self,
        alg: SigningAlgorithm,
        message: &[u8],
        signature: &str,
    ) -> Result<(), AuthError> {
        if !self.accepts(alg) {
            return Err(AuthError::algorithm_mismatch(alg.as_str(), self.kid()));
        }

        let valid = match self {
            Self::Rsa(RsaPublicKey { decoding_key, .. })
            | Self::Ec(EcPublicKey { material: EcMaterial::Jwt(decoding_key), .. }) => {
                let Some(algorithm) = alg.jwt_algorithm() else {
                    return Err(AuthError::algorithm_mismatch(alg.as_str(), self.kid()));
                };
                jsonwebtoken::crypto::verify(signature, message, decoding_key, algorithm)
                    .unwrap_or(false)
            },
            Self::Ec(EcPublicKey { material: EcMaterial::P521(verifying_key), .. }) => {
                let Ok(bytes) = URL_SAFE_NO_PAD.decode(signature) else {
                    return Err(AuthError::malformed_token("signature is not valid base64url"));
                };
                match P521Signature::from_slice(&bytes) {
                    Ok(sig) => verifying_key.verify(message, &sig).is_ok(),
                    Err(_) => false,
                }
            },
        };

        if valid { Ok(()) } else { Err(AuthError::invalid_signature()) }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa(key) => f
                .debug_struct("RsaPublicKey")
                .field("kid", &key.kid)
                .field("modulus_bits", &key.modulus_bits)
                .finish_non_exhaustive(),
            Self::Ec(key) => f
                .debug_struct("EcPublicKey")
                .field("kid", &key.kid)
                .field("curve", &key.curve)
                .finish_non_exhaustive(),
        }
    }
}

/// Converts one descriptor into a [`PublicKey`].
///
/// # Errors
///
/// - [`AuthError::MalformedKey`] for an unknown `kty`, a missing or undecodable parameter, a zero
///   exponent, or EC coordinates that do not fit the curve
/// - [`AuthError::UnsupportedCurve`] for a curve outside P-256, P-384 and P-521
pub fn parse_descriptor(descriptor: &KeyDescriptor) -> Result<PublicKey, AuthError> {
    match KeyFamily::from_kty(&descriptor.kty) {
        Some(KeyFamily::Rsa) => parse_rsa(descriptor).map(PublicKey::Rsa),
        Some(KeyFamily::Ec) => parse_ec(descriptor).map(PublicKey::Ec),
        None => Err(AuthError::malformed_key(
            &descriptor.kid,
            format!("unsupported key type '{}'", descriptor.kty),
        )),
    }
}

/// Converts a whole key set, keyed by `kid`.
///
/// Descriptors that are not usable are skipped with a warning: unknown key
/// type, missing `kid`, `use` other than `"sig"`, a duplicate `kid` (the first
/// occurrence wins), or any [`parse_descriptor`] failure.
pub fn parse_key_set(descriptors: &[KeyDescriptor]) -> HashMap<String, Arc<PublicKey>> {
    let mut keys = HashMap::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let kid = descriptor.kid.as_str();
        let kty = descriptor.kty.as_str();

        if KeyFamily::from_kty(kty).is_none() {
            tracing::warn!(kid, kty, "skipping key with unsupported key type");
            continue;
        }
        if kid.is_empty() {
            tracing::warn!(kty, "skipping key without kid");
            continue;
        }
        if let Some(key_use) = descriptor.key_use.as_deref()
            && key_use != SIGNATURE_USE
        {
            tracing::warn!(kid, kty, key_use, "skipping key not published for signatures");
            continue;
        }
        if keys.contains_key(kid) {
            tracing::warn!(kid, kty, "skipping duplicate kid");
            continue;
        }

        match parse_descriptor(descriptor) {
            Ok(key) => {
                keys.insert(kid.to_owned(), Arc::new(key));
            },
            Err(err) => {
                tracing::warn!(kid, kty, error = %err, "skipping malformed key");
            },
        }
    }

    keys
}

fn parse_rsa(descriptor: &KeyDescriptor) -> Result<RsaPublicKey, AuthError> {
    let kid = descriptor.kid.as_str();
    let n = required(kid, "n", descriptor.n.as_deref())?;
    let e = required(kid, "e", descriptor.e.as_deref())?;

    let modulus = decode_param(kid, "n", n)?;
    let exponent = decode_param(kid, "e", e)?;

    let modulus = strip_leading_zeros(&modulus);
    if modulus.is_empty() {
        return Err(AuthError::malformed_key(kid, "modulus is zero"));
    }
    if strip_leading_zeros(&exponent).is_empty() {
        return Err(AuthError::malformed_key(kid, "exponent must be positive"));
    }

    let decoding_key = DecodingKey::from_rsa_components(n, e)
        .map_err(|err| AuthError::malformed_key(kid, err.to_string()))?;

    Ok(RsaPublicKey { kid: kid.to_owned(), modulus_bits: bit_length(modulus), decoding_key })
}

fn parse_ec(descriptor: &KeyDescriptor) -> Result<EcPublicKey, AuthError> {
    let kid = descriptor.kid.as_str();
    let crv = required(kid, "crv", descriptor.crv.as_deref())?;
    let Some(curve) = EcCurve::from_name(crv) else {
        return Err(AuthError::unsupported_curve(kid, crv));
    };

    let x = decode_coordinate(kid, "x", required(kid, "x", descriptor.x.as_deref())?, curve)?;
    let y = decode_coordinate(kid, "y", required(kid, "y", descriptor.y.as_deref())?, curve)?;

    let mut sec1 = Vec::with_capacity(1 + x.len() + y.len());
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    let off_curve = || AuthError::malformed_key(kid, format!("point is not on curve {curve}"));

    let material = match curve {
        EcCurve::P256 | EcCurve::P384 => {
            let on_curve = match curve {
                EcCurve::P256 => p256::PublicKey::from_sec1_bytes(&sec1).is_ok(),
                _ => p384::PublicKey::from_sec1_bytes(&sec1).is_ok(),
            };
            if !on_curve {
                return Err(off_curve());
            }
            let key = DecodingKey::from_ec_components(
                &URL_SAFE_NO_PAD.encode(&x),
                &URL_SAFE_NO_PAD.encode(&y),
            )
            .map_err(|err| AuthError::malformed_key(kid, err.to_string()))?;
            EcMaterial::Jwt(key)
        },
        EcCurve::P521 => {
            EcMaterial::P521(P521VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| off_curve())?)
        },
    };

    Ok(EcPublicKey { kid: kid.to_owned(), curve, material })
}

fn required<'a>(kid: &str, name: &str, value: Option<&'a str>) -> Result<&'a str, AuthError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(AuthError::malformed_key(kid, format!("missing parameter '{name}'"))),
    }
}

fn decode_param(kid: &str, name: &str, value: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|err| AuthError::malformed_key(kid, format!("parameter '{name}': {err}")))
}

/// Decodes a coordinate, left-padding short encodings to the curve size.
fn decode_coordinate(
    kid: &str,
    name: &str,
    value: &str,
    curve: EcCurve,
) -> Result<Vec<u8>, AuthError> {
    let bytes = decode_param(kid, name, value)?;
    let size = curve.coordinate_len();
    if bytes.len() > size {
        return Err(AuthError::malformed_key(
            kid,
            format!("coordinate '{name}' is {} bytes, {curve} allows {size}", bytes.len()),
        ));
    }
    let mut padded = vec![0u8; size - bytes.len()];
    padded.extend_from_slice(&bytes);
    Ok(padded)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn bit_length(magnitude: &[u8]) -> usize {
    match magnitude.first() {
        Some(first) => magnitude.len() * 8 - first.leading_zeros() as usize,
        None => 0,
    }
}
