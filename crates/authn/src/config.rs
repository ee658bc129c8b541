//! Verifier configuration.
//!
//! [`AuthConfig`] is built either through its validating builder or by
//! deserializing (durations in humantime form, e.g. `"1h"`, `"250ms"`) and
//! then calling [`AuthConfig::validate`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::AuthError,
    key_cache::{DEFAULT_CACHE_TTL, DEFAULT_FETCH_TIMEOUT},
    key_material::KeyFamily,
};

/// Upper bound for every duration setting (30 days).
pub const MAX_DURATION_SETTING: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_allowed_families() -> Vec<KeyFamily> {
    vec![KeyFamily::Rsa, KeyFamily::Ec]
}

/// Configuration for a [`TokenVerifier`](crate::TokenVerifier).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stockfolio_authn::AuthConfig;
///
/// let config = AuthConfig::builder()
///     .jwks_url("https://auth.example.com/.well-known/jwks.json")
///     .leeway(Duration::from_secs(30))
///     .build()?;
/// assert_eq!(config.cache_ttl(), Duration::from_secs(3_600));
/// # Ok::<(), stockfolio_authn::AuthError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Key-publication endpoint.
    pub(crate) jwks_url: Url,

    /// Lifetime of a fetched key set.
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub(crate) cache_ttl: Duration,

    /// Deadline for one fetch of the key set.
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    pub(crate) fetch_timeout: Duration,

    /// Trusted algorithm families.
    #[serde(default = "default_allowed_families")]
    pub(crate) allowed_families: Vec<KeyFamily>,

    /// Clock skew tolerated on `exp` and `nbf`.
    #[serde(with = "humantime_serde", default)]
    pub(crate) leeway: Duration,

    /// How long a kid absent from a fresh key set is remembered.
    #[serde(with = "humantime_serde", default)]
    pub(crate) unknown_kid_ttl: Option<Duration>,

    /// How long after expiry a key set may still be served when refreshes fail.
    #[serde(with = "humantime_serde", default)]
    pub(crate) max_stale: Option<Duration>,

    /// Period of the background refresh task.
    #[serde(with = "humantime_serde", default)]
    pub(crate) refresh_interval: Option<Duration>,
}

#[bon::bon]
impl AuthConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Optional Fields
    ///
    /// * `cache_ttl` - Key set lifetime (default: 1 hour).
    /// * `fetch_timeout` - Fetch deadline (default: 10 seconds).
    /// * `allowed_families` - Trusted families (default: RSA and EC).
    /// * `leeway` - Clock skew tolerance (default: none).
    /// * `unknown_kid_ttl` - Unknown-kid memory (default: disabled).
    /// * `max_stale` - Stale fallback window (default: disabled).
    /// * `refresh_interval` - Background refresh period (default: disabled).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if:
    /// - `jwks_url` is not an absolute http(s) URL with a host
    /// - `cache_ttl`, `fetch_timeout`, or a configured optional duration is zero
    /// - any duration exceeds [`MAX_DURATION_SETTING`]
    /// - `allowed_families` is empty
    #[builder]
    pub fn new(
        #[builder(into)] jwks_url: String,
        #[builder(default = DEFAULT_CACHE_TTL)] cache_ttl: Duration,
        #[builder(default = DEFAULT_FETCH_TIMEOUT)] fetch_timeout: Duration,
        #[builder(default = default_allowed_families())] allowed_families: Vec<KeyFamily>,
        #[builder(default)] leeway: Duration,
        unknown_kid_ttl: Option<Duration>,
        max_stale: Option<Duration>,
        refresh_interval: Option<Duration>,
    ) -> Result<Self, AuthError> {
        let jwks_url = Url::parse(&jwks_url)
            .map_err(|err| AuthError::invalid_config(format!("jwks_url '{jwks_url}': {err}")))?;

        let config = Self {
            jwks_url,
            cache_ttl,
            fetch_timeout,
            allowed_families,
            leeway,
            unknown_kid_ttl,
            max_stale,
            refresh_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces. Call after deserializing.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<(), AuthError> {
        if !matches!(self.jwks_url.scheme(), "http" | "https") {
            return Err(AuthError::invalid_config(format!(
                "jwks_url must use http or https, got '{}'",
                self.jwks_url.scheme()
            )));
        }
        if self.jwks_url.host_str().is_none_or(str::is_empty) {
            return Err(AuthError::invalid_config("jwks_url must have a host"));
        }
        if self.cache_ttl.is_zero() {
            return Err(AuthError::invalid_config("cache_ttl must be greater than zero"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(AuthError::invalid_config("fetch_timeout must be greater than zero"));
        }
        if self.allowed_families.is_empty() {
            return Err(AuthError::invalid_config("allowed_families must not be empty"));
        }
        for (name, value) in [
            ("unknown_kid_ttl", self.unknown_kid_ttl),
            ("max_stale", self.max_stale),
            ("refresh_interval", self.refresh_interval),
        ] {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(AuthError::invalid_config(format!(
                    "{name} must be greater than zero when set"
                )));
            }
        }
        for (name, value) in [
            ("cache_ttl", Some(self.cache_ttl)),
            ("fetch_timeout", Some(self.fetch_timeout)),
            ("leeway", Some(self.leeway)),
            ("unknown_kid_ttl", self.unknown_kid_ttl),
            ("max_stale", self.max_stale),
            ("refresh_interval", self.refresh_interval),
        ] {
            if value.is_some_and(|d| d > MAX_DURATION_SETTING) {
                return Err(AuthError::invalid_config(format!("{name} must not exceed 30 days")));
            }
        }
        Ok(())
    }

    /// Returns the key-publication endpoint.
    #[must_use]
    pub fn jwks_url(&self) -> &Url {
        &self.jwks_url
    }

    /// Returns the key set lifetime.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Returns the fetch deadline.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Returns the trusted algorithm families.
    #[must_use]
    pub fn allowed_families(&self) -> &[KeyFamily] {
        &self.allowed_families
    }

    /// Returns the clock skew tolerance.
    #[must_use]
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Returns the unknown-kid memory TTL, if enabled.
    #[must_use]
    pub fn unknown_kid_ttl(&self) -> Option<Duration> {
        self.unknown_kid_ttl
    }

    /// Returns the stale fallback window, if enabled.
    #[must_use]
    pub fn max_stale(&self) -> Option<Duration> {
        self.max_stale
    }

    /// Returns the background refresh period, if enabled.
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    const URL: &str = "https://auth.example.com/.well-known/jwks.json";

    #[test]
    fn test_builder_defaults() {
        let config = AuthConfig::builder().jwks_url(URL).build().unwrap();

        assert_eq!(config.jwks_url().as_str(), URL);
        assert_eq!(config.cache_ttl(), Duration::from_secs(3_600));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.allowed_families(), &[KeyFamily::Rsa, KeyFamily::Ec]);
        assert_eq!(config.leeway(), Duration::ZERO);
        assert_eq!(config.unknown_kid_ttl(), None);
        assert_eq!(config.max_stale(), None);
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn test_builder_with_custom_values() {
        let config = AuthConfig::builder()
            .jwks_url("http://localhost:8080/jwks")
            .cache_ttl(Duration::from_secs(600))
            .allowed_families(vec![KeyFamily::Ec])
            .unknown_kid_ttl(Duration::from_secs(30))
            .max_stale(Duration::from_secs(900))
            .refresh_interval(Duration::from_secs(300))
            .build()
            .unwrap();

        assert_eq!(config.cache_ttl(), Duration::from_secs(600));
        assert_eq!(config.allowed_families(), &[KeyFamily::Ec]);
        assert_eq!(config.unknown_kid_ttl(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_stale(), Some(Duration::from_secs(900)));
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(300)));
    }

    #[rstest]
    #[case::not_a_url("not a url")]
    #[case::ftp("ftp://auth.example.com/jwks")]
    #[case::file("file:///etc/jwks.json")]
    fn test_rejects_bad_url(#[case] url: &str) {
        let result = AuthConfig::builder().jwks_url(url).build();
        assert!(matches!(result, Err(AuthError::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let result = AuthConfig::builder().jwks_url(URL).cache_ttl(Duration::ZERO).build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cache_ttl"));
    }

    #[test]
    fn test_rejects_empty_families() {
        let result = AuthConfig::builder().jwks_url(URL).allowed_families(vec![]).build();
        assert!(result.unwrap_err().to_string().contains("allowed_families"));
    }

    #[test]
    fn test_rejects_zero_optional_duration() {
        let result = AuthConfig::builder().jwks_url(URL).refresh_interval(Duration::ZERO).build();
        assert!(result.unwrap_err().to_string().contains("refresh_interval"));
    }

    #[rstest]
    #[case::cache_ttl("cache_ttl")]
    #[case::fetch_timeout("fetch_timeout")]
    #[case::leeway("leeway")]
    #[case::unknown_kid_ttl("unknown_kid_ttl")]
    #[case::max_stale("max_stale")]
    #[case::refresh_interval("refresh_interval")]
    fn test_rejects_oversized_duration(#[case] field: &str) {
        let too_long = MAX_DURATION_SETTING + Duration::from_secs(1);
        let builder = AuthConfig::builder().jwks_url(URL);
        let result = match field {
            "cache_ttl" => builder.cache_ttl(too_long).build(),
            "fetch_timeout" => builder.fetch_timeout(too_long).build(),
            "leeway" => builder.leeway(too_long).build(),
            "unknown_kid_ttl" => builder.unknown_kid_ttl(too_long).build(),
            "max_stale" => builder.max_stale(too_long).build(),
            "refresh_interval" => builder.refresh_interval(too_long).build(),
            other => panic!("no case for {other}"),
        };

        let err = result.unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfig { .. }));
        assert!(err.to_string().contains(field), "{err}");
    }

    #[test]
    fn test_rejects_ttl_that_would_overflow_the_clock() {
        let result =
            AuthConfig::builder().jwks_url(URL).cache_ttl(Duration::from_secs(u64::MAX / 2)).build();
        assert!(result.unwrap_err().to_string().contains("cache_ttl"));
    }

    #[test]
    fn test_accepts_durations_at_the_bound() {
        let config = AuthConfig::builder()
            .jwks_url(URL)
            .cache_ttl(MAX_DURATION_SETTING)
            .unknown_kid_ttl(MAX_DURATION_SETTING)
            .max_stale(MAX_DURATION_SETTING)
            .build()
            .unwrap();
        assert_eq!(config.cache_ttl(), MAX_DURATION_SETTING);
    }

    #[test]
    fn test_deserialized_huge_ttl_rejected_by_validate() {
        let json = format!(r#"{{"jwks_url": "{URL}", "cache_ttl": "1000000000years"}}"#);
        let config: AuthConfig = serde_json::from_str(&json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cache_ttl"));
    }

    #[test]
    fn test_deserialization_with_defaults() {
        let json = format!(r#"{{"jwks_url": "{URL}"}}"#);
        let config: AuthConfig = serde_json::from_str(&json).unwrap();
        config.validate().unwrap();

        assert_eq!(config, AuthConfig::builder().jwks_url(URL).build().unwrap());
    }

    #[test]
    fn test_deserialization_humantime_durations() {
        let json = format!(
            r#"{{
                "jwks_url": "{URL}",
                "cache_ttl": "30m",
                "fetch_timeout": "2s 500ms",
                "allowed_families": ["RSA"],
                "leeway": "1m",
                "max_stale": "2h"
            }}"#
        );
        let config: AuthConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.cache_ttl(), Duration::from_secs(1_800));
        assert_eq!(config.fetch_timeout(), Duration::from_millis(2_500));
        assert_eq!(config.allowed_families(), &[KeyFamily::Rsa]);
        assert_eq!(config.leeway(), Duration::from_secs(60));
        assert_eq!(config.max_stale(), Some(Duration::from_secs(7_200)));
        assert_eq!(config.unknown_kid_ttl(), None);
    }

    #[test]
    fn test_deserialization_rejects_unknown_fields() {
        let json = format!(r#"{{"jwks_url": "{URL}", "audience": "api"}}"#);
        assert!(serde_json::from_str::<AuthConfig>(&json).is_err());
    }

    #[test]
    fn test_validate_catches_deserialized_violations() {
        let json = format!(r#"{{"jwks_url": "{URL}", "allowed_families": []}}"#);
        let config: AuthConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(config.validate(), Err(AuthError::InvalidConfig { .. })));
    }
}
