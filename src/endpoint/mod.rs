//! One unit per Registry V2 action.
//!
//! An endpoint describes the request (method, URL, accepted media types,
//! body) and interprets the response. The [`EndpointCaller`] owns the
//! transport: it sends the request and hands the response back to the
//! endpoint, success and error ranges separately.
//!
//! [`EndpointCaller`]: crate::caller::EndpointCaller
use std::future::Future;

use bytes::Bytes;
use http::{Method, StatusCode};
use reqwest::header::LOCATION;
use reqwest::Response;
use tracing::debug;
use url::Url;

use crate::errors::{RegistryError, RegistryErrorEnvelope, Result};

pub(crate) mod blob;
pub(crate) mod manifest;
pub(crate) mod probe;
pub(crate) mod upload;

/// A request body and the way it is framed
pub(crate) enum RequestBody {
    /// A body fully held in memory
    Bytes { content_type: String, data: Bytes },
    /// A body produced while the request is sent
    Stream {
        content_type: String,
        length: u64,
        body: reqwest::Body,
    },
}

pub(crate) trait RegistryEndpoint: Sync {
    type Output: Send;

    fn method(&self) -> Method;

    /// The request URL. `api_base` is the `/v2/` root of the registry over the
    /// transport currently tried.
    fn url(&self, api_base: &Url) -> Result<Url>;

    fn accept(&self) -> &[&'static str] {
        &[]
    }

    /// Built again for every attempt
    fn body(&self) -> Option<RequestBody> {
        None
    }

    /// Names the call in timing events
    fn description(&self) -> String;

    /// Interprets a 2xx response
    fn handle_response(
        &self,
        site: &CallSite,
        response: Response,
    ) -> impl Future<Output = Result<Self::Output>> + Send;

    /// Interprets any other response
    fn handle_error(
        &self,
        site: &CallSite,
        response: Response,
    ) -> impl Future<Output = Result<Self::Output>> + Send {
        async move { Err(site.error_from_response(response).await) }
    }
}

/// Joins a path below the `/v2/` root
pub(crate) fn api_url(api_base: &Url, path: &str) -> Result<Url> {
    api_base.join(path).map_err(|source| RegistryError::Url {
        url: format!("{api_base}{path}"),
        source,
    })
}

/// The method and URL of a request being made, used to build errors
#[derive(Debug, Clone)]
pub(crate) struct CallSite {
    pub method: Method,
    pub url: Url,
}

impl CallSite {
    pub fn new(method: Method, url: Url) -> Self {
        CallSite { method, url }
    }

    fn url_string(&self) -> String {
        self.url.to_string()
    }

    pub fn transport_error(&self, error: reqwest::Error) -> RegistryError {
        let failure = crate::caller::classify(&error);
        debug!(method = %self.method, url = %self.url, ?failure, ?error, "Request failed");
        RegistryError::Transport {
            method: self.method.clone(),
            url: self.url_string(),
            failure,
            source: Box::new(error),
        }
    }

    pub fn body_error(&self, error: reqwest::Error) -> RegistryError {
        RegistryError::ResponseBody {
            method: self.method.clone(),
            url: self.url_string(),
            source: Box::new(error),
        }
    }

    pub fn digest_error(&self, source: crate::digest::DigestError) -> RegistryError {
        RegistryError::Digest {
            method: self.method.clone(),
            url: self.url_string(),
            source,
        }
    }

    pub fn manifest_error(&self, source: crate::manifest::ManifestError) -> RegistryError {
        RegistryError::Manifest {
            method: self.method.clone(),
            url: self.url_string(),
            source,
        }
    }

    pub fn missing_location(&self) -> RegistryError {
        RegistryError::MissingLocation {
            method: self.method.clone(),
            url: self.url_string(),
        }
    }

    pub fn missing_content_length(&self) -> RegistryError {
        RegistryError::MissingContentLength {
            method: self.method.clone(),
            url: self.url_string(),
        }
    }

    pub fn unexpected_status(&self, status: StatusCode, message: impl Into<String>) -> RegistryError {
        RegistryError::UnexpectedStatus {
            method: self.method.clone(),
            url: self.url_string(),
            status: status.as_u16(),
            message: message.into(),
        }
    }

    pub async fn read_body(&self, response: Response) -> Result<Bytes> {
        response.bytes().await.map_err(|e| self.body_error(e))
    }

    /// Turns a non-2xx response into an error, reading the registry error
    /// envelope when there is one
    pub async fn error_from_response(&self, response: Response) -> RegistryError {
        let status = response.status();
        match self.read_body(response).await {
            Ok(body) => self.error_from_body(status, &body),
            Err(error) => error,
        }
    }

    pub fn error_from_body(&self, status: StatusCode, body: &[u8]) -> RegistryError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return RegistryError::Unauthorized {
                method: self.method.clone(),
                url: self.url_string(),
                status: status.as_u16(),
            };
        }
        if status.is_client_error() {
            if let Some(envelope) = parse_envelope(body) {
                return RegistryError::Registry {
                    method: self.method.clone(),
                    url: self.url_string(),
                    status: status.as_u16(),
                    envelope,
                };
            }
        }
        self.unexpected_status(status, String::from_utf8_lossy(body))
    }

    /// The `Location` header, resolved against the request URL.
    ///
    /// The value is used as sent by the registry; relative values keep the
    /// host and scheme of the request.
    pub fn location(&self, response: &Response) -> Result<Option<Url>> {
        let Some(value) = response.headers().get(LOCATION) else {
            return Ok(None);
        };
        let invalid = |reason: String| RegistryError::InvalidLocation {
            method: self.method.clone(),
            url: self.url_string(),
            reason,
        };
        let text = value.to_str().map_err(|e| invalid(e.to_string()))?;
        let location = self.url.join(text).map_err(|e| invalid(e.to_string()))?;
        debug!(%location, "Location header");
        Ok(Some(location))
    }
}

pub(crate) fn parse_envelope(body: &[u8]) -> Option<RegistryErrorEnvelope> {
    serde_json::from_slice::<RegistryErrorEnvelope>(body)
        .ok()
        .filter(|envelope| !envelope.errors.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::codes;

    fn site() -> CallSite {
        CallSite::new(
            Method::GET,
            Url::parse("https://registry.local/v2/app/blobs/uploads/abc?_state=1").unwrap(),
        )
    }

    #[test]
    fn error_statuses_are_classified() {
        let site = site();
        assert!(matches!(
            site.error_from_body(StatusCode::UNAUTHORIZED, b""),
            RegistryError::Unauthorized { status: 401, .. }
        ));
        assert!(matches!(
            site.error_from_body(StatusCode::FORBIDDEN, b"denied"),
            RegistryError::Unauthorized { status: 403, .. }
        ));

        let body = br#"{"errors":[{"code":"BLOB_UNKNOWN","message":"nope"}]}"#;
        match site.error_from_body(StatusCode::NOT_FOUND, body) {
            RegistryError::Registry {
                status, envelope, ..
            } => {
                assert_eq!(status, 404);
                assert!(envelope.has_code(codes::BLOB_UNKNOWN));
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert!(matches!(
            site.error_from_body(StatusCode::BAD_REQUEST, b"plain text"),
            RegistryError::UnexpectedStatus { status: 400, .. }
        ));
        // a server error keeps its body as the message even when it looks like an envelope
        match site.error_from_body(StatusCode::INTERNAL_SERVER_ERROR, body) {
            RegistryError::UnexpectedStatus {
                status, message, ..
            } => {
                assert_eq!(status, 500);
                assert!(message.contains("BLOB_UNKNOWN"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn api_urls_join_below_the_root() {
        let base = Url::parse("https://registry.local:5000/v2/").unwrap();
        assert_eq!(
            api_url(&base, "library/openjdk/manifests/latest")
                .unwrap()
                .as_str(),
            "https://registry.local:5000/v2/library/openjdk/manifests/latest"
        );
    }
}
