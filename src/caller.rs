//! Sends endpoint requests and applies the insecure-registry fallback policy
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::RequestBuilder;
use tracing::{debug, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::endpoint::{CallSite, RegistryEndpoint, RequestBody};
use crate::errors::{RegistryError, Result, TransportFailure};
use crate::events::{EventHandler, TimerScope};
use crate::secrets::Authorization;

/// The ways a registry can be reached, from most to least secure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    /// HTTPS with certificate verification
    Secure,
    /// HTTPS without certificate verification
    InsecureTls,
    /// Plain HTTP
    PlainHttp,
}

impl Transport {
    fn scheme(&self) -> &'static str {
        match self {
            Transport::Secure | Transport::InsecureTls => "https",
            Transport::PlainHttp => "http",
        }
    }

    /// The `/v2/` root of `server` over this transport
    pub fn api_base(&self, server: &str) -> Result<Url> {
        let text = format!("{}://{}/v2/", self.scheme(), server);
        Url::parse(&text).map_err(|source| RegistryError::Url { url: text, source })
    }
}

/// Runs `attempt` over the secure transport, retrying over less secure ones
/// when `allow_insecure` is set and the failure is eligible.
///
/// A certificate failure is retried without verification; a connection
/// failure of either HTTPS attempt is retried over plain HTTP. Any other
/// failure, and every HTTP response, is final. Each retry starts `attempt`
/// from scratch.
pub(crate) async fn with_transport_fallback<T, F, Fut>(
    allow_insecure: bool,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(Transport) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let error = match attempt(Transport::Secure).await {
        Err(error) => error,
        done => return done,
    };
    let Some(failure) = error.transport_failure() else {
        return Err(error);
    };
    if !allow_insecure || !failure.allows_fallback() {
        return Err(error);
    }

    let error = if failure == TransportFailure::Tls {
        warn!(
            "Cannot verify server at {}. Attempting again with no TLS verification.",
            error.url().unwrap_or_default()
        );
        match attempt(Transport::InsecureTls).await {
            Err(error)
                if error
                    .transport_failure()
                    .is_some_and(|failure| failure.allows_fallback()) =>
            {
                error
            }
            done => return done,
        }
    } else {
        error
    };

    warn!(
        "Failed to connect to {} over HTTPS. Attempting again with HTTP.",
        error.url().unwrap_or_default()
    );
    attempt(Transport::PlainHttp).await
}

/// Classifies a failed request for the fallback policy
pub(crate) fn classify(error: &reqwest::Error) -> TransportFailure {
    // the top-level message carries the URL, which must not be matched on
    if error.source().is_some_and(mentions_tls) {
        TransportFailure::Tls
    } else if error.is_connect() {
        TransportFailure::Connect
    } else if error.is_timeout() {
        TransportFailure::Timeout
    } else {
        TransportFailure::Other
    }
}

/// Whether any error of the chain reports a TLS or certificate problem
fn mentions_tls(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        let text = err.to_string().to_lowercase();
        if ["certificate", "tls", "ssl", "handshake"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            return true;
        }
        current = err.source();
    }
    false
}

fn build_client(config: &ClientConfig, verify_certificates: bool) -> Result<reqwest::Client> {
    let mut client_builder = reqwest::Client::builder();
    if !verify_certificates {
        client_builder = client_builder.danger_accept_invalid_certs(true);
        client_builder = match () {
            #[cfg(feature = "native-tls")]
            () => client_builder.danger_accept_invalid_hostnames(true),
            #[cfg(not(feature = "native-tls"))]
            () => client_builder,
        };
    }
    if let Some(timeout) = config.http_timeout {
        client_builder = client_builder.connect_timeout(timeout).read_timeout(timeout);
    }
    for c in &config.extra_root_certificates {
        client_builder = client_builder.add_root_certificate(c.to_reqwest()?);
    }
    client_builder.build().map_err(RegistryError::ClientBuild)
}

/// Sends [`RegistryEndpoint`] requests to one registry.
///
/// Holds no mutable state; clones share the connection pools.
#[derive(Clone)]
pub(crate) struct EndpointCaller {
    secure: reqwest::Client,
    insecure: reqwest::Client,
    server: String,
    user_agent: String,
    authorization: Option<Authorization>,
    allow_insecure: bool,
    send_credentials_over_http: bool,
    events: Option<Arc<dyn EventHandler>>,
}

impl fmt::Debug for EndpointCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCaller")
            .field("server", &self.server)
            .field("user_agent", &self.user_agent)
            .field("authorization", &self.authorization)
            .field("allow_insecure", &self.allow_insecure)
            .finish_non_exhaustive()
    }
}

impl EndpointCaller {
    pub fn new(server: &str, config: &ClientConfig) -> Result<Self> {
        Ok(EndpointCaller {
            secure: build_client(config, true)?,
            insecure: build_client(config, false)?,
            server: server.to_string(),
            user_agent: config.user_agent.header_value(),
            authorization: None,
            allow_insecure: config.allow_insecure_registries,
            send_credentials_over_http: config.send_credentials_over_http,
            events: config.event_handler.clone(),
        })
    }

    pub fn with_authorization(&self, authorization: Option<Authorization>) -> Self {
        EndpointCaller {
            authorization,
            ..self.clone()
        }
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    pub fn secure_client(&self) -> &reqwest::Client {
        &self.secure
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn allow_insecure(&self) -> bool {
        self.allow_insecure
    }

    pub fn events(&self) -> Option<Arc<dyn EventHandler>> {
        self.events.clone()
    }

    /// Sends the request of `endpoint` inside a timing scope named after it
    pub async fn call<E: RegistryEndpoint>(&self, endpoint: &E) -> Result<E::Output> {
        let _timer = TimerScope::new(self.events(), endpoint.description());
        self.send(endpoint).await
    }

    /// Sends the request of `endpoint`, applying the fallback policy
    pub async fn send<E: RegistryEndpoint>(&self, endpoint: &E) -> Result<E::Output> {
        with_transport_fallback(self.allow_insecure, |transport| {
            self.call_at(endpoint, transport)
        })
        .await
    }

    /// Sends the request of `endpoint` over a single transport
    pub async fn call_at<E: RegistryEndpoint>(
        &self,
        endpoint: &E,
        transport: Transport,
    ) -> Result<E::Output> {
        let api_base = transport.api_base(&self.server)?;
        let site = CallSite::new(endpoint.method(), endpoint.url(&api_base)?);

        let client = match transport {
            Transport::InsecureTls => &self.insecure,
            Transport::Secure | Transport::PlainHttp => &self.secure,
        };
        let authorization = match transport {
            Transport::PlainHttp if !self.send_credentials_over_http => {
                if self.authorization.is_some() {
                    debug!("Not sending credentials over plain HTTP");
                }
                None
            }
            _ => self.authorization.as_ref(),
        };

        debug!(method = %site.method, url = %site.url, ?transport, "Sending request");
        let response = RequestBuilderWrapper::from_client(client, |c| {
            c.request(site.method.clone(), site.url.clone())
        })
        .apply_user_agent(&self.user_agent)
        .apply_authorization(authorization)
        .apply_accept(endpoint.accept())
        .apply_body(endpoint.body())
        .into_request_builder()
        .send()
        .await
        .map_err(|e| site.transport_error(e))?;

        debug!(status = %response.status(), url = %site.url, "Received response");
        if response.status().is_success() {
            endpoint.handle_response(&site, response).await
        } else {
            endpoint.handle_error(&site, response).await
        }
    }
}

/// The request builder wrapper allows composable operations on the request
/// builder, to produce a `RequestBuilder` object that can be executed.
struct RequestBuilderWrapper {
    request_builder: RequestBuilder,
}

// RequestBuilderWrapper type management
impl RequestBuilderWrapper {
    /// Create a `RequestBuilderWrapper` from a `reqwest::Client`, by
    /// instantiating the internal `RequestBuilder` with the provided
    /// function `f`.
    fn from_client(
        client: &reqwest::Client,
        f: impl FnOnce(&reqwest::Client) -> RequestBuilder,
    ) -> RequestBuilderWrapper {
        RequestBuilderWrapper {
            request_builder: f(client),
        }
    }

    // Produces a final `RequestBuilder` out of this `RequestBuilderWrapper`
    fn into_request_builder(self) -> RequestBuilder {
        self.request_builder
    }

    fn map(self, f: impl FnOnce(RequestBuilder) -> RequestBuilder) -> Self {
        RequestBuilderWrapper {
            request_builder: f(self.request_builder),
        }
    }
}

// Composable functions applicable to a `RequestBuilderWrapper`
impl RequestBuilderWrapper {
    fn apply_user_agent(self, user_agent: &str) -> Self {
        if user_agent.is_empty() {
            return self;
        }
        self.map(|rb| rb.header(USER_AGENT, user_agent))
    }

    fn apply_authorization(self, authorization: Option<&Authorization>) -> Self {
        match authorization {
            Some(authorization) => {
                self.map(|rb| rb.header(AUTHORIZATION, authorization.header_value()))
            }
            None => self,
        }
    }

    fn apply_accept(self, accept: &[&str]) -> Self {
        if accept.is_empty() {
            return self;
        }
        self.map(|rb| rb.header(ACCEPT, accept.join(", ")))
    }

    fn apply_body(self, body: Option<RequestBody>) -> Self {
        match body {
            None => self,
            Some(RequestBody::Bytes { content_type, data }) => {
                self.map(|rb| rb.header(CONTENT_TYPE, content_type).body(data))
            }
            Some(RequestBody::Stream {
                content_type,
                length,
                body,
            }) => self.map(|rb| {
                rb.header(CONTENT_TYPE, content_type)
                    .header(CONTENT_LENGTH, length)
                    .body(body)
            }),
        }
    }
}
