//! Errors related to interacting with a Docker/OCI registry

use std::fmt;

use http::Method;
use serde::Deserialize;

use crate::digest::DigestError;
use crate::manifest::ManifestError;

/// Boxed error used as the underlying cause of transport failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used by this crate
pub type Result<T> = std::result::Result<T, RegistryError>;

/// The broad category a [`RegistryError`] belongs to.
///
/// Callers use it to decide whether to retry with different configuration,
/// change credentials, or give up on a particular image or blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The registry could not be reached, or the secure channel could not be established
    Transport,
    /// The registry or its token realm refused the supplied credentials
    Authentication,
    /// The registry answered in a way that violates the Registry V2 protocol
    Protocol,
    /// The client was configured with invalid values
    Configuration,
}

/// The cause of a failure at the transport level.
///
/// Only [`TransportFailure::Tls`] and [`TransportFailure::Connect`] are
/// eligible for the insecure-registry fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The TLS handshake or the certificate verification failed
    Tls,
    /// The connection was refused, reset or could not be established
    Connect,
    /// The request timed out after the connection was established
    Timeout,
    /// Any other network failure
    Other,
}

impl TransportFailure {
    /// Whether the insecure-registry fallback may retry after this failure
    pub(crate) fn allows_fallback(&self) -> bool {
        matches!(self, TransportFailure::Tls | TransportFailure::Connect)
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportFailure::Tls => {
                "secure connection failed (allow insecure registries to skip certificate verification)"
            }
            TransportFailure::Connect => "connection failed",
            TransportFailure::Timeout => "request timed out",
            TransportFailure::Other => "network failure",
        };
        f.write_str(text)
    }
}

/// Errors that can be raised while talking to a registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The request could not be delivered to the registry
    #[error("{method} {url} failed: {failure}")]
    Transport {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// Classification of the transport failure
        failure: TransportFailure,
        /// The underlying error
        #[source]
        source: BoxError,
    },
    /// The body of a response could not be read
    #[error("failed reading the response of {method} {url}")]
    ResponseBody {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// The underlying error
        #[source]
        source: BoxError,
    },
    /// The registry refused the request with a 401 or 403
    #[error("{method} {url} is not authorized (HTTP {status})")]
    Unauthorized {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// The HTTP status code received
        status: u16,
    },
    /// A bearer token could not be obtained from the authentication realm
    #[error("authentication with {method} {url} failed: {reason}")]
    Authentication {
        /// HTTP method of the token request
        method: Method,
        /// URL of the token realm
        url: String,
        /// Why the token could not be obtained
        reason: String,
    },
    /// The registry answered with a structured error envelope
    #[error("{method} {url} failed with HTTP {status}: {envelope}")]
    Registry {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// The HTTP status code received
        status: u16,
        /// The errors reported by the registry
        envelope: RegistryErrorEnvelope,
    },
    /// The registry answered with a status code the operation does not expect
    #[error("{method} {url} returned unexpected HTTP {status}: {message}")]
    UnexpectedStatus {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// The HTTP status code received
        status: u16,
        /// The body of the response
        message: String,
    },
    /// The registry accepted an upload step but did not say where to continue
    #[error("{method} {url} succeeded but the registry did not send a Location header")]
    MissingLocation {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
    },
    /// The Location header sent by the registry cannot be used as a URL
    #[error("{method} {url} returned an invalid Location header: {reason}")]
    InvalidLocation {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// Why the header was rejected
        reason: String,
    },
    /// A blob check succeeded without telling the blob size
    #[error("{method} {url} did not return a Content-Length header")]
    MissingContentLength {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
    },
    /// A digest could not be parsed, or content did not match its digest
    #[error("{method} {url}: {source}")]
    Digest {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// The underlying digest error
        #[source]
        source: DigestError,
    },
    /// A manifest received from the registry could not be understood
    #[error("{method} {url}: {source}")]
    Manifest {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// The underlying manifest error
        #[source]
        source: ManifestError,
    },
    /// The registry refused the format of a pushed manifest
    #[error("{method} {url}: registry may not support pushing this manifest format (HTTP {status}): {message}")]
    ManifestRejected {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: String,
        /// The HTTP status code received
        status: u16,
        /// The registry's explanation
        message: String,
    },
    /// A URL could not be built from the configuration
    #[error("invalid URL {url}: {source}")]
    Url {
        /// The text that failed to parse
        url: String,
        /// The underlying parsing error
        #[source]
        source: url::ParseError,
    },
    /// A manifest could not be serialized for pushing
    #[error("cannot serialize manifest: {0}")]
    ManifestSerialization(#[source] serde_json::Error),
    /// The client or endpoint configuration is invalid
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The HTTP client could not be created
    #[error("cannot create HTTP client")]
    ClientBuild(#[source] reqwest::Error),
    /// Pulled content could not be written to its destination
    #[error("cannot write pulled content")]
    Output(#[source] std::io::Error),
}

impl RegistryError {
    /// Returns the category of this error
    pub fn kind(&self) -> FailureKind {
        match self {
            RegistryError::Transport { .. }
            | RegistryError::ResponseBody { .. }
            | RegistryError::Output(_) => FailureKind::Transport,
            RegistryError::Unauthorized { .. } | RegistryError::Authentication { .. } => {
                FailureKind::Authentication
            }
            RegistryError::Registry { .. }
            | RegistryError::UnexpectedStatus { .. }
            | RegistryError::MissingLocation { .. }
            | RegistryError::InvalidLocation { .. }
            | RegistryError::MissingContentLength { .. }
            | RegistryError::Digest { .. }
            | RegistryError::Manifest { .. }
            | RegistryError::ManifestRejected { .. } => FailureKind::Protocol,
            RegistryError::Url { .. }
            | RegistryError::ManifestSerialization(_)
            | RegistryError::InvalidConfiguration(_)
            | RegistryError::ClientBuild(_) => FailureKind::Configuration,
        }
    }

    /// The HTTP method of the failing request, for registry-facing failures
    pub fn method(&self) -> Option<&Method> {
        match self {
            RegistryError::Transport { method, .. }
            | RegistryError::ResponseBody { method, .. }
            | RegistryError::Unauthorized { method, .. }
            | RegistryError::Authentication { method, .. }
            | RegistryError::Registry { method, .. }
            | RegistryError::UnexpectedStatus { method, .. }
            | RegistryError::MissingLocation { method, .. }
            | RegistryError::InvalidLocation { method, .. }
            | RegistryError::MissingContentLength { method, .. }
            | RegistryError::Digest { method, .. }
            | RegistryError::Manifest { method, .. }
            | RegistryError::ManifestRejected { method, .. } => Some(method),
            _ => None,
        }
    }

    /// The URL of the failing request, for registry-facing failures
    pub fn url(&self) -> Option<&str> {
        match self {
            RegistryError::Transport { url, .. }
            | RegistryError::ResponseBody { url, .. }
            | RegistryError::Unauthorized { url, .. }
            | RegistryError::Authentication { url, .. }
            | RegistryError::Registry { url, .. }
            | RegistryError::UnexpectedStatus { url, .. }
            | RegistryError::MissingLocation { url, .. }
            | RegistryError::InvalidLocation { url, .. }
            | RegistryError::MissingContentLength { url, .. }
            | RegistryError::Digest { url, .. }
            | RegistryError::Manifest { url, .. }
            | RegistryError::ManifestRejected { url, .. } => Some(url),
            _ => None,
        }
    }

    /// The transport failure classification, if this is a transport error
    pub fn transport_failure(&self) -> Option<TransportFailure> {
        match self {
            RegistryError::Transport { failure, .. } => Some(*failure),
            _ => None,
        }
    }
}

/// Error codes defined by the Registry V2 API that this client reacts to
pub mod codes {
    /// The blob is unknown to the registry
    pub const BLOB_UNKNOWN: &str = "BLOB_UNKNOWN";
    /// The manifest is invalid
    pub const MANIFEST_INVALID: &str = "MANIFEST_INVALID";
    /// The tag is invalid
    pub const TAG_INVALID: &str = "TAG_INVALID";
}

/// The error body returned by a registry.
///
/// See <https://distribution.github.io/distribution/spec/api/#errors>
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RegistryErrorEnvelope {
    /// The list of errors reported
    #[serde(default)]
    pub errors: Vec<RegistryErrorDetail>,
}

impl RegistryErrorEnvelope {
    /// Checks whether the envelope contains an error with the given code
    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

impl fmt::Display for RegistryErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "[{}]", errors.join(", "))
    }
}

/// A single error reported by a registry
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RegistryErrorDetail {
    /// The error code, e.g. `BLOB_UNKNOWN`
    pub code: String,
    /// A human readable description
    #[serde(default)]
    pub message: String,
    /// Unstructured extra information
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl fmt::Display for RegistryErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
