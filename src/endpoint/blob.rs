use http::{Method, StatusCode};
use reqwest::header::CONTENT_LENGTH;
use reqwest::Response;
use tracing::debug;
use url::Url;

use super::{api_url, parse_envelope, CallSite, RegistryEndpoint};
use crate::digest::ContentDigest;
use crate::errors::{codes, Result};
use crate::types::BlobDescriptor;

fn blob_url(api_base: &Url, image_name: &str, digest: &ContentDigest) -> Result<Url> {
    api_url(api_base, &format!("{image_name}/blobs/{digest}"))
}

/// `HEAD /v2/<name>/blobs/<digest>`
pub(crate) struct BlobChecker {
    image_name: String,
    digest: ContentDigest,
}

impl BlobChecker {
    pub fn new(image_name: &str, digest: &ContentDigest) -> Self {
        BlobChecker {
            image_name: image_name.to_string(),
            digest: digest.clone(),
        }
    }
}

impl RegistryEndpoint for BlobChecker {
    type Output = Option<BlobDescriptor>;

    fn method(&self) -> Method {
        Method::HEAD
    }

    fn url(&self, api_base: &Url) -> Result<Url> {
        blob_url(api_base, &self.image_name, &self.digest)
    }

    fn description(&self) -> String {
        format!("check blob {}", self.digest)
    }

    async fn handle_response(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        // HEAD responses have no body, so the header is read directly
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| site.missing_content_length())?;
        Ok(Some(BlobDescriptor {
            digest: self.digest.clone(),
            size,
        }))
    }

    async fn handle_error(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        let status = response.status();
        let body = site.read_body(response).await?;
        if status == StatusCode::NOT_FOUND {
            let unknown = body.is_empty()
                || parse_envelope(&body).is_some_and(|e| e.has_code(codes::BLOB_UNKNOWN));
            if unknown {
                debug!(digest = %self.digest, "Blob does not exist");
                return Ok(None);
            }
        }
        Err(site.error_from_body(status, &body))
    }
}

/// `GET /v2/<name>/blobs/<digest>`, returning the response with its body unread
pub(crate) struct BlobPuller {
    image_name: String,
    digest: ContentDigest,
}

impl BlobPuller {
    pub fn new(image_name: &str, digest: &ContentDigest) -> Self {
        BlobPuller {
            image_name: image_name.to_string(),
            digest: digest.clone(),
        }
    }
}

impl RegistryEndpoint for BlobPuller {
    type Output = (CallSite, Response);

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, api_base: &Url) -> Result<Url> {
        blob_url(api_base, &self.image_name, &self.digest)
    }

    fn description(&self) -> String {
        format!("pull blob {}", self.digest)
    }

    async fn handle_response(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        Ok((site.clone(), response))
    }
}
