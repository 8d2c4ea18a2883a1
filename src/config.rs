//! Client and endpoint configuration
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{RegistryError, Result};
use crate::events::EventHandler;
use crate::regexp::{ANCHORED_DOMAIN, ANCHORED_NAME};

/// Setting this variable to any non-empty value disables the `User-Agent` header
pub const DISABLE_USER_AGENT_ENV: &str = "_JIB_DISABLE_USER_AGENT";
/// Tag of the tool driving this client, appended to the `User-Agent`
pub const UPSTREAM_CLIENT_ENV: &str = "_JIB_UPSTREAM_CLIENT";
/// Setting this variable to `false` disables cross-repository blob mounts
pub const BLOB_MOUNTS_ENV: &str = "JIB_BLOB_MOUNTS";
/// HTTP timeout in milliseconds, `0` disables the timeout
pub const HTTP_TIMEOUT_ENV: &str = "JIB_HTTP_TIMEOUT";
/// Setting this variable to `true` keeps credentials on plain HTTP fallbacks
pub const SEND_CREDENTIALS_OVER_HTTP_ENV: &str = "JIB_SEND_CREDENTIALS_OVER_HTTP";

/// Default timeout applied to connecting and reading from a registry
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// The encoding of the certificate
#[derive(Debug, Clone)]
pub enum CertificateEncoding {
    #[allow(missing_docs)]
    Der,
    #[allow(missing_docs)]
    Pem,
}

/// A x509 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    /// Which encoding is used by the certificate
    pub encoding: CertificateEncoding,

    /// Actual certificate
    pub data: Vec<u8>,
}

impl Certificate {
    pub(crate) fn to_reqwest(&self) -> Result<reqwest::Certificate> {
        match self.encoding {
            CertificateEncoding::Der => reqwest::Certificate::from_der(self.data.as_slice()),
            CertificateEncoding::Pem => reqwest::Certificate::from_pem(self.data.as_slice()),
        }
        .map_err(RegistryError::ClientBuild)
    }
}

/// What this client reports about itself in the `User-Agent` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentConfig {
    /// When false, no `User-Agent` header is sent
    pub enabled: bool,
    /// The version reported after `jib`
    pub version: String,
    /// Identifies the build tool, e.g. `jib-maven-plugin`
    pub suffix: Option<String>,
    /// Identifies a tool driving the build tool
    pub upstream_client: Option<String>,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            suffix: None,
            upstream_client: None,
        }
    }
}

impl UserAgentConfig {
    /// The `User-Agent` value, in the form `jib <version>[ <suffix>][ <upstream>]`.
    ///
    /// The value is empty when reporting is disabled.
    pub fn header_value(&self) -> String {
        if !self.enabled {
            return String::new();
        }
        let mut agent = format!("jib {}", self.version);
        for part in [&self.suffix, &self.upstream_client].into_iter().flatten() {
            if !part.is_empty() {
                agent.push(' ');
                agent.push_str(part);
            }
        }
        agent
    }
}

/// A client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Fall back to unverified TLS and then to plain HTTP when a registry
    /// cannot be reached securely. Defaults to false
    pub allow_insecure_registries: bool,

    /// Keep sending the `Authorization` header after falling back to plain
    /// HTTP. Defaults to false
    pub send_credentials_over_http: bool,

    /// The `User-Agent` to report
    pub user_agent: UserAgentConfig,

    /// Whether blob pushes may try to mount the blob from another repository
    /// of the same registry. Defaults to true
    pub cross_repository_blob_mounts: bool,

    /// Timeout for connecting and for each request. `None` disables it.
    ///
    /// This defaults to [`DEFAULT_HTTP_TIMEOUT`].
    pub http_timeout: Option<Duration>,

    /// A list of extra root certificate to trust. This can be used to connect
    /// to servers using self-signed certificates
    pub extra_root_certificates: Vec<Certificate>,

    /// Receives the timing events of every registry call
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            allow_insecure_registries: false,
            send_credentials_over_http: false,
            user_agent: UserAgentConfig::default(),
            cross_repository_blob_mounts: true,
            http_timeout: Some(DEFAULT_HTTP_TIMEOUT),
            extra_root_certificates: Vec::new(),
            event_handler: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("allow_insecure_registries", &self.allow_insecure_registries)
            .field(
                "send_credentials_over_http",
                &self.send_credentials_over_http,
            )
            .field("user_agent", &self.user_agent)
            .field(
                "cross_repository_blob_mounts",
                &self.cross_repository_blob_mounts,
            )
            .field("http_timeout", &self.http_timeout)
            .field(
                "extra_root_certificates",
                &self.extra_root_certificates.len(),
            )
            .field("event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl ClientConfig {
    /// Reads the defaults overridable through environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = ClientConfig::default();
        if lookup(DISABLE_USER_AGENT_ENV).is_some_and(|v| !v.is_empty()) {
            config.user_agent.enabled = false;
        }
        config.user_agent.upstream_client =
            lookup(UPSTREAM_CLIENT_ENV).filter(|v| !v.is_empty());
        if let Some(send) = lookup(SEND_CREDENTIALS_OVER_HTTP_ENV) {
            config.send_credentials_over_http = send.trim().eq_ignore_ascii_case("true");
        }
        if let Some(mounts) = lookup(BLOB_MOUNTS_ENV) {
            config.cross_repository_blob_mounts = !mounts.trim().eq_ignore_ascii_case("false");
        }
        if let Some(timeout) = lookup(HTTP_TIMEOUT_ENV) {
            match timeout.trim().parse::<u64>() {
                Ok(0) => config.http_timeout = None,
                Ok(millis) => config.http_timeout = Some(Duration::from_millis(millis)),
                Err(_) => tracing::warn!(
                    value = %timeout,
                    "Ignoring {} that is not a number of milliseconds",
                    HTTP_TIMEOUT_ENV
                ),
            }
        }
        config
    }
}

/// A source that can provide a `ClientConfig`.
/// If you are using this crate in your own application, you can implement this
/// trait on your configuration type so that it can be passed to
/// [`RegistryClient::from_source`](crate::client::RegistryClient::from_source).
pub trait ClientConfigSource {
    /// Provides a `ClientConfig`.
    fn client_config(&self) -> ClientConfig;
}

/// The registry and repository a client talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    server: String,
    image_name: String,
    source_image_name: Option<String>,
}

impl EndpointConfig {
    /// Creates an endpoint for `image_name` on the registry `server`
    /// (a host with an optional port, e.g. `gcr.io` or `localhost:5000`)
    pub fn new(server: impl Into<String>, image_name: impl Into<String>) -> Result<Self> {
        let server = server.into();
        let image_name = image_name.into();
        if !ANCHORED_DOMAIN.is_match(&server) {
            return Err(RegistryError::InvalidConfiguration(format!(
                "invalid registry host {server:?}"
            )));
        }
        validate_image_name(&image_name)?;
        Ok(Self {
            server,
            image_name,
            source_image_name: None,
        })
    }

    /// Names another repository of the same registry that blobs may be mounted from
    pub fn with_source_image(mut self, source_image_name: impl Into<String>) -> Result<Self> {
        let source_image_name = source_image_name.into();
        validate_image_name(&source_image_name)?;
        self.source_image_name = Some(source_image_name);
        Ok(self)
    }

    /// The registry host
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The repository pushed to and pulled from
    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// The repository blobs may be mounted from
    pub fn source_image_name(&self) -> Option<&str> {
        self.source_image_name.as_deref()
    }
}

fn validate_image_name(name: &str) -> Result<()> {
    if !ANCHORED_NAME.is_match(name) {
        return Err(RegistryError::InvalidConfiguration(format!(
            "invalid repository name {name:?}"
        )));
    }
    Ok(())
}
