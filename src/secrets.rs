//! Types for working with registry access secrets

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use unicase::UniCase;

/// The username docker credential helpers report for identity (refresh) tokens
pub const IDENTITY_TOKEN_USERNAME: &str = "<token>";

/// A method for authenticating to a registry
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// Access the registry anonymously
    Anonymous,

    /// Access the registry using HTTP Basic authentication.
    ///
    /// A username of [`IDENTITY_TOKEN_USERNAME`] marks the password as an
    /// OAuth2 identity token.
    Basic(String, String),
}

impl RegistryAuth {
    /// The static [`Authorization`] to use when the registry does not issue bearer tokens
    pub fn to_authorization(&self) -> Option<Authorization> {
        match self {
            RegistryAuth::Anonymous => None,
            RegistryAuth::Basic(username, password) => {
                Some(Authorization::basic(username, password))
            }
        }
    }

    pub(crate) fn identity_token(&self) -> Option<&str> {
        match self {
            RegistryAuth::Basic(username, token) if username == IDENTITY_TOKEN_USERNAME => {
                Some(token)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryAuth::Anonymous => f.write_str("Anonymous"),
            RegistryAuth::Basic(username, _) => f
                .debug_tuple("Basic")
                .field(username)
                .field(&"<redacted>")
                .finish(),
        }
    }
}

pub(crate) trait Authenticable {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self;
}

impl Authenticable for reqwest::RequestBuilder {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self {
        match auth {
            RegistryAuth::Anonymous => self,
            RegistryAuth::Basic(username, password) => self.basic_auth(username, Some(password)),
        }
    }
}

/// The value of an `Authorization` header: a scheme and its credential.
///
/// Immutable once built. The credential is either a base64-encoded
/// `username:password` pair or a bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Authorization {
    scheme: String,
    token: String,
}

impl Authorization {
    /// Creates an authorization from an arbitrary scheme and credential
    pub fn new(scheme: impl Into<String>, token: impl Into<String>) -> Self {
        Authorization {
            scheme: scheme.into(),
            token: token.into(),
        }
    }

    /// A `Basic` authorization for the given username and password
    pub fn basic(username: &str, password: &str) -> Self {
        Self::new("Basic", STANDARD.encode(format!("{username}:{password}")))
    }

    /// A `Basic` authorization from an already base64-encoded `username:password`
    pub fn basic_encoded(credential: impl Into<String>) -> Self {
        Self::new("Basic", credential)
    }

    /// A `Bearer` authorization for a registry token
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new("Bearer", token)
    }

    /// The authentication scheme, e.g. `Basic` or `Bearer`
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The credential sent after the scheme
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the scheme is `bearer`, compared case-insensitively
    pub fn is_bearer(&self) -> bool {
        UniCase::new(self.scheme.as_str()) == UniCase::new("bearer")
    }

    pub(crate) fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.token)
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("scheme", &self.scheme)
            .field("token", &"<redacted>")
            .finish()
    }
}
