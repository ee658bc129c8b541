//! Security-focused verification tests.
//!
//! These tests drive the public [`TokenVerifier`] API against a fixed key set
//! and check resistance to common JWT attack vectors: `none` and HMAC
//! algorithm substitution, RSA/EC algorithm confusion, curve confusion,
//! foreign signing keys, expired and future tokens, key rotation, and
//! malformed token structures.
#![allow(clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::json;
use stockfolio_authn::{
    AuthError, FetchError, KeyCache, KeyDescriptor, KeyFamily, KeyResolver, KeySetFetcher,
    TokenVerifier, key_material::KeySetDocument,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const RSA_PRIMARY_PEM: &str = include_str!("../testdata/rsa_primary.pem");
const RSA_UNTRUSTED_PEM: &str = include_str!("../testdata/rsa_untrusted.pem");
const EC_P256_PEM: &str = include_str!("../testdata/ec_p256.pem");
const EC_P384_PEM: &str = include_str!("../testdata/ec_p384.pem");
const JWKS_JSON: &str = include_str!("../testdata/jwks.json");
const JWKS_UNTRUSTED_JSON: &str = include_str!("../testdata/jwks_untrusted.json");

fn descriptors(json: &str) -> Vec<KeyDescriptor> {
    serde_json::from_str::<KeySetDocument>(json).expect("fixture key set").keys
}

fn only(kids: &[&str]) -> Vec<KeyDescriptor> {
    descriptors(JWKS_JSON).into_iter().filter(|d| kids.contains(&d.kid.as_str())).collect()
}

/// Key set source whose contents can be swapped mid-test.
#[derive(Default)]
struct RotatingKeySet {
    keys: Mutex<Vec<KeyDescriptor>>,
    fetches: AtomicUsize,
}

impl RotatingKeySet {
    fn serving(keys: Vec<KeyDescriptor>) -> Arc<Self> {
        Arc::new(Self { keys: Mutex::new(keys), fetches: AtomicUsize::new(0) })
    }

    fn rotate(&self, keys: Vec<KeyDescriptor>) {
        *self.keys.lock() = keys;
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetFetcher for RotatingKeySet {
    async fn fetch(&self) -> Result<Vec<KeyDescriptor>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.keys.lock().clone())
    }
}

fn verifier_for(source: &Arc<RotatingKeySet>) -> TokenVerifier {
    let fetcher: Arc<dyn KeySetFetcher> = Arc::clone(source) as Arc<dyn KeySetFetcher>;
    TokenVerifier::new(KeyResolver::new(Arc::new(KeyCache::new(fetcher))))
}

fn sign(alg: Algorithm, pem: &str, kid: &str, claims: &serde_json::Value) -> String {
    let key = match alg {
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem.as_bytes()),
        _ => EncodingKey::from_rsa_pem(pem.as_bytes()),
    }
    .expect("fixture private key");

    let mut header = Header::new(alg);
    header.kid = Some(kid.to_owned());
    jsonwebtoken::encode(&header, claims, &key).expect("Failed to encode test JWT")
}

fn valid_claims(sub: &str) -> serde_json::Value {
    json!({ "sub": sub, "exp": Utc::now().timestamp() + 3_600 })
}

/// Header and payload as given, signature segment empty.
///
/// Local copy of `testutil::craft_raw_token` so this suite runs without the
/// `testutil` feature. `test_craft_raw_token_matches_testutil` keeps the two
/// in step when the feature is on.
fn craft_raw_token(header_json: &serde_json::Value, payload_json: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header"));
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload"));
    format!("{header_b64}.{payload_b64}.")
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rs256_token_yields_subject() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &valid_claims("user-42"));
    let principal = verifier.verify(&token).await.expect("valid token");

    assert_eq!(principal.as_str(), "user-42");
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn cached_key_set_serves_repeated_verifications() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let rsa = sign(Algorithm::PS384, RSA_PRIMARY_PEM, "rsa-1", &valid_claims("a"));
    let ec = sign(Algorithm::ES256, EC_P256_PEM, "ec-256", &valid_claims("b"));
    for _ in 0..5 {
        verifier.verify(&rsa).await.expect("rsa token");
        verifier.verify(&ec).await.expect("ec token");
    }

    assert_eq!(source.fetches(), 1, "one fetch serves the whole TTL");
}

// ---------------------------------------------------------------------------
// Algorithm substitution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn alg_none_rejected_before_key_lookup() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    for alg in ["none", "None", "NONE"] {
        let token = craft_raw_token(&json!({"alg": alg, "kid": "rsa-1"}), &valid_claims("x"));
        let result = verifier.verify(&token).await;
        assert!(
            matches!(result, Err(AuthError::UnsupportedAlgorithm { .. })),
            "alg {alg:?} must be rejected, got {result:?}"
        );
    }
    assert_eq!(source.fetches(), 0);
}

#[tokio::test]
async fn hmac_signed_with_public_key_bytes_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    // Classic confusion: the attacker HMACs with the published key as secret.
    let secret = EncodingKey::from_secret(JWKS_JSON.as_bytes());
    for alg in [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512] {
        let mut header = Header::new(alg);
        header.kid = Some("rsa-1".to_owned());
        let token =
            jsonwebtoken::encode(&header, &valid_claims("attacker"), &secret).expect("hmac token");

        let result = verifier.verify(&token).await;
        assert!(matches!(result, Err(AuthError::UnsupportedAlgorithm { .. })), "{alg:?}");
    }
    assert_eq!(source.fetches(), 0);
}

#[tokio::test]
async fn unknown_algorithm_names_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    for alg in ["EdDSA", "RS1", "rs256", "", "ES256K"] {
        let token = craft_raw_token(&json!({"alg": alg, "kid": "rsa-1"}), &valid_claims("x"));
        let result = verifier.verify(&token).await;
        assert!(matches!(result, Err(AuthError::UnsupportedAlgorithm { .. })), "{alg:?}");
    }
}

#[tokio::test]
async fn untrusted_family_rejected_before_key_lookup() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source).with_allowed_families(vec![KeyFamily::Ec]);

    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &valid_claims("x"));
    let result = verifier.verify(&token).await;

    assert!(matches!(result, Err(AuthError::UnsupportedAlgorithm { .. })));
    assert_eq!(source.fetches(), 0);
}

// ---------------------------------------------------------------------------
// Algorithm / key confusion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ec_algorithm_against_rsa_key_is_mismatch() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let token = craft_raw_token(&json!({"alg": "ES256", "kid": "rsa-1"}), &valid_claims("x"));
    let result = verifier.verify(&token).await;

    assert!(
        matches!(result, Err(AuthError::AlgorithmMismatch { ref alg, ref kid }) if alg == "ES256" && kid == "rsa-1"),
        "got {result:?}"
    );
}

#[tokio::test]
async fn rsa_algorithm_against_ec_key_is_mismatch() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "ec-256", &valid_claims("x"));
    let result = verifier.verify(&token).await;

    assert!(matches!(result, Err(AuthError::AlgorithmMismatch { .. })), "got {result:?}");
}

#[tokio::test]
async fn curve_confusion_is_mismatch() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    // ES384 over a P-384 key, but pointing at the P-256 key.
    let token = sign(Algorithm::ES384, EC_P384_PEM, "ec-256", &valid_claims("x"));
    let result = verifier.verify(&token).await;
    assert!(matches!(result, Err(AuthError::AlgorithmMismatch { .. })), "got {result:?}");

    let token = craft_raw_token(&json!({"alg": "ES512", "kid": "ec-384"}), &valid_claims("x"));
    let result = verifier.verify(&token).await;
    assert!(matches!(result, Err(AuthError::AlgorithmMismatch { .. })), "got {result:?}");
}

// ---------------------------------------------------------------------------
// Foreign keys and forged signatures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn token_signed_by_foreign_key_with_trusted_kid_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let token = sign(Algorithm::RS256, RSA_UNTRUSTED_PEM, "rsa-1", &valid_claims("attacker"));
    let result = verifier.verify(&token).await;

    assert!(matches!(result, Err(AuthError::InvalidSignature)), "got {result:?}");
}

#[tokio::test]
async fn token_naming_unpublished_kid_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let token =
        sign(Algorithm::RS256, RSA_UNTRUSTED_PEM, "rsa-untrusted", &valid_claims("attacker"));
    let result = verifier.verify(&token).await;

    assert!(matches!(result, Err(AuthError::UnknownKey { ref kid }) if kid == "rsa-untrusted"));
}

#[tokio::test]
async fn tampered_payload_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let token = sign(Algorithm::ES256, EC_P256_PEM, "ec-256", &valid_claims("user-1"));
    let parts: Vec<&str> = token.split('.').collect();
    let forged_payload = URL_SAFE_NO_PAD.encode(valid_claims("admin").to_string());
    let forged = format!("{}.{forged_payload}.{}", parts[0], parts[2]);

    let result = verifier.verify(&forged).await;
    assert!(matches!(result, Err(AuthError::InvalidSignature)), "got {result:?}");
}

#[tokio::test]
async fn stripped_signature_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &valid_claims("user-1"));
    let stripped = format!("{}.", token.rsplit_once('.').expect("three segments").0);

    let result = verifier.verify(&stripped).await;
    assert!(matches!(result, Err(AuthError::InvalidSignature)), "got {result:?}");
}

// ---------------------------------------------------------------------------
// Temporal claims
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_token_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let claims = json!({"sub": "user-1", "exp": Utc::now().timestamp() - 60});
    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &claims);

    assert!(matches!(verifier.verify(&token).await, Err(AuthError::TokenExpired)));
}

#[tokio::test]
async fn expired_token_within_leeway_accepted() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source).with_leeway(Duration::from_secs(300));

    let claims = json!({"sub": "user-1", "exp": Utc::now().timestamp() - 60});
    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &claims);

    assert_eq!(verifier.verify(&token).await.expect("within leeway").as_str(), "user-1");
}

#[tokio::test]
async fn future_nbf_rejected() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let claims = json!({"sub": "user-1", "nbf": Utc::now().timestamp() + 3_600});
    let token = sign(Algorithm::ES256, EC_P256_PEM, "ec-256", &claims);

    assert!(matches!(verifier.verify(&token).await, Err(AuthError::TokenNotYetValid)));
}

#[tokio::test]
async fn expiry_checked_only_after_signature() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    // Expired and forged: the forgery is what gets reported.
    let claims = json!({"sub": "user-1", "exp": 1});
    let token = sign(Algorithm::RS256, RSA_UNTRUSTED_PEM, "rsa-1", &claims);

    assert!(matches!(verifier.verify(&token).await, Err(AuthError::InvalidSignature)));
}

// ---------------------------------------------------------------------------
// Key rotation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_kid_in_fresh_set_triggers_refresh() {
    let source = RotatingKeySet::serving(only(&["ec-256"]));
    let verifier = verifier_for(&source);

    let ec = sign(Algorithm::ES256, EC_P256_PEM, "ec-256", &valid_claims("a"));
    verifier.verify(&ec).await.expect("ec token");
    assert_eq!(source.fetches(), 1);

    // Provider publishes a new key; the cached set is still fresh.
    source.rotate(only(&["ec-256", "rsa-1"]));
    let rsa = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &valid_claims("b"));
    assert_eq!(verifier.verify(&rsa).await.expect("rotated-in key").as_str(), "b");
    assert_eq!(source.fetches(), 2);

    // Both keys now come from cache.
    verifier.verify(&ec).await.expect("ec token");
    verifier.verify(&rsa).await.expect("rsa token");
    assert_eq!(source.fetches(), 2);
}

#[tokio::test]
async fn retired_key_survives_until_set_refreshes() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let rsa = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &valid_claims("a"));
    verifier.verify(&rsa).await.expect("rsa token");

    source.rotate(only(&["ec-256"]));
    verifier.verify(&rsa).await.expect("cached set still holds rsa-1");

    verifier.resolver().cache().invalidate();
    let result = verifier.verify(&rsa).await;
    assert!(matches!(result, Err(AuthError::UnknownKey { .. })), "got {result:?}");
}

#[tokio::test]
async fn missing_kid_after_fetch_is_unknown_key() {
    let source = RotatingKeySet::serving(only(&["rsa-1"]));
    let verifier = verifier_for(&source);

    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "k9", &valid_claims("x"));
    let result = verifier.verify(&token).await;

    assert!(matches!(result, Err(AuthError::UnknownKey { ref kid }) if kid == "k9"));
    assert!(source.fetches() >= 1);
}

#[tokio::test]
async fn untrusted_set_does_not_validate_primary_tokens() {
    let source = RotatingKeySet::serving(descriptors(JWKS_UNTRUSTED_JSON));
    let verifier = verifier_for(&source);

    let ours = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &valid_claims("x"));
    assert!(matches!(verifier.verify(&ours).await, Err(AuthError::UnknownKey { .. })));

    let theirs = sign(Algorithm::RS256, RSA_UNTRUSTED_PEM, "rsa-untrusted", &valid_claims("y"));
    assert_eq!(verifier.verify(&theirs).await.expect("published key").as_str(), "y");
}

// ---------------------------------------------------------------------------
// Malformed structures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_structures_rejected_without_fetch() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","kid":"rsa-1"}"#);
    let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"x"}"#);
    let cases = [
        String::new(),
        "not-a-token".to_owned(),
        format!("{header}.{payload}"),
        format!("{header}.{payload}.sig.extra"),
        format!("!!!.{payload}.sig"),
        format!("{header}.!!!.sig"),
        format!("{header}.{payload}.!!!"),
        format!("{}.{payload}.", URL_SAFE_NO_PAD.encode("not json")),
        format!("{}.{payload}.", URL_SAFE_NO_PAD.encode("[1,2,3]")),
        format!("{header}.{}.", URL_SAFE_NO_PAD.encode("\"just a string\"")),
        craft_raw_token(&json!({"alg": "RS256"}), &json!({"sub": "x"})),
        craft_raw_token(&json!({"kid": "rsa-1"}), &json!({"sub": "x"})),
        craft_raw_token(&json!({"alg": 256, "kid": "rsa-1"}), &json!({"sub": "x"})),
    ];

    for token in &cases {
        let result = verifier.verify(token).await;
        assert!(
            matches!(result, Err(AuthError::MalformedToken { .. })),
            "{token:?} should be malformed, got {result:?}"
        );
    }
    assert_eq!(source.fetches(), 0);
}

#[tokio::test]
async fn hostile_kid_rejected_without_fetch() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    for kid in [String::new(), "a".repeat(257), "rsa-1\n".to_owned(), "x\u{0}y".to_owned()] {
        let token = craft_raw_token(&json!({"alg": "RS256", "kid": kid}), &json!({"sub": "x"}));
        let result = verifier.verify(&token).await;
        assert!(matches!(result, Err(AuthError::MalformedToken { .. })), "{kid:?}");
    }
    assert_eq!(source.fetches(), 0);
}

#[tokio::test]
async fn non_numeric_exp_is_malformed() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let claims = json!({"sub": "user-1", "exp": "tomorrow"});
    let token = sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &claims);

    assert!(matches!(verifier.verify(&token).await, Err(AuthError::MalformedToken { .. })));
}

#[tokio::test]
async fn every_rejection_has_the_same_public_message() {
    let source = RotatingKeySet::serving(descriptors(JWKS_JSON));
    let verifier = verifier_for(&source);

    let tokens = [
        "garbage".to_owned(),
        craft_raw_token(&json!({"alg": "none", "kid": "rsa-1"}), &valid_claims("x")),
        sign(Algorithm::RS256, RSA_UNTRUSTED_PEM, "rsa-1", &valid_claims("x")),
        sign(Algorithm::RS256, RSA_PRIMARY_PEM, "k9", &valid_claims("x")),
        sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &json!({"exp": 1, "sub": "x"})),
        sign(Algorithm::RS256, RSA_PRIMARY_PEM, "rsa-1", &json!({"exp": i64::MAX / 2})),
    ];

    for token in &tokens {
        let err = verifier.verify(token).await.expect_err("rejected");
        assert_eq!(err.public_message(), stockfolio_authn::PUBLIC_ERROR_MESSAGE, "{err}");
    }
}

#[cfg(feature = "testutil")]
#[test]
fn test_craft_raw_token_matches_testutil() {
    let header = json!({"alg": "none", "kid": "rsa-1"});
    let claims = valid_claims("x");
    assert_eq!(
        craft_raw_token(&header, &claims),
        stockfolio_authn::testutil::craft_raw_token(&header, &claims)
    );
}
