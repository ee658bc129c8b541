//! `Authorization` header handling and the verified principal.

use std::fmt;

use crate::error::AuthError;

/// Request-context key under which the HTTP layer stores the [`Principal`].
pub const PRINCIPAL_CONTEXT_KEY: &str = "userID";

/// The verified subject of a token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub(crate) fn new(subject: String) -> Self {
        Self(subject)
    }

    /// The subject identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the principal, returning the subject identifier.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Principal {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
///
/// The scheme is matched case-insensitively and must be followed by exactly
/// one whitespace-free token.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the header is absent, uses another
/// scheme, or does not split into exactly scheme and token.
///
/// # Examples
///
/// ```
/// use stockfolio_authn::bearer::extract_bearer_token;
///
/// assert_eq!(extract_bearer_token(Some("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
/// assert!(extract_bearer_token(Some("Basic dXNlcjpwYXNz")).is_err());
/// assert!(extract_bearer_token(None).is_err());
/// ```
pub fn extract_bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let Some(header) = header else {
        return Err(AuthError::malformed_token("missing Authorization header"));
    };

    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        (Some(scheme), Some(_), None) => {
            Err(AuthError::malformed_token(format!("unsupported authorization scheme '{scheme}'")))
        },
        _ => Err(AuthError::malformed_token("Authorization header must be 'Bearer <token>'")),
    }
}
