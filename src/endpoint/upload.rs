//! The three requests of a blob push: start, write, commit.
//!
//! Every continuation URL comes from the `Location` header of the previous
//! response and is used as is.
use bytes::Bytes;
use http::{Method, StatusCode};
use reqwest::Response;
use tracing::debug;
use url::Url;

use super::{api_url, CallSite, RegistryEndpoint, RequestBody};
use crate::blob::{upload_body, ProgressCallback};
use crate::digest::ContentDigest;
use crate::errors::Result;

const OCTET_STREAM: &str = "application/octet-stream";

fn empty_body() -> RequestBody {
    RequestBody::Bytes {
        content_type: OCTET_STREAM.to_string(),
        data: Bytes::new(),
    }
}

/// The registry-issued URL of an upload in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UploadSession {
    pub location: Url,
}

/// The outcome of starting an upload
#[derive(Debug)]
pub(crate) enum UploadStart {
    /// The blob is already in the repository, possibly mounted just now
    Exists,
    /// Content must be uploaded to the session
    Session(UploadSession),
}

/// `POST /v2/<name>/blobs/uploads/[?mount=<digest>&from=<repository>]`
pub(crate) struct UploadInitializer {
    image_name: String,
    digest: ContentDigest,
    mount_from: Option<String>,
}

impl UploadInitializer {
    pub fn new(image_name: &str, digest: &ContentDigest, mount_from: Option<&str>) -> Self {
        UploadInitializer {
            image_name: image_name.to_string(),
            digest: digest.clone(),
            mount_from: mount_from.map(str::to_string),
        }
    }
}

impl RegistryEndpoint for UploadInitializer {
    type Output = UploadStart;

    fn method(&self) -> Method {
        Method::POST
    }

    fn url(&self, api_base: &Url) -> Result<Url> {
        let mut url = api_url(api_base, &format!("{}/blobs/uploads/", self.image_name))?;
        if let Some(source) = &self.mount_from {
            url.query_pairs_mut()
                .append_pair("mount", &self.digest.to_string())
                .append_pair("from", source);
        }
        Ok(url)
    }

    fn body(&self) -> Option<RequestBody> {
        Some(empty_body())
    }

    fn description(&self) -> String {
        format!("start upload of {}", self.digest)
    }

    async fn handle_response(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        let status = response.status();
        if status == StatusCode::CREATED {
            if let Some(source) = &self.mount_from {
                debug!(digest = %self.digest, %source, "Blob mounted");
            } else {
                debug!(digest = %self.digest, "Blob already exists");
            }
            return Ok(UploadStart::Exists);
        }
        match site.location(&response)? {
            Some(location) => Ok(UploadStart::Session(UploadSession { location })),
            None if status == StatusCode::ACCEPTED => Err(site.missing_location()),
            None => {
                debug!(digest = %self.digest, %status, "No upload location, blob already exists");
                Ok(UploadStart::Exists)
            }
        }
    }
}

/// `PATCH <location>` with the whole blob as a single chunk
pub(crate) struct UploadWriter {
    session: UploadSession,
    content: Bytes,
    progress: Option<ProgressCallback>,
}

impl UploadWriter {
    pub fn new(session: UploadSession, content: Bytes, progress: Option<ProgressCallback>) -> Self {
        UploadWriter {
            session,
            content,
            progress,
        }
    }
}

impl RegistryEndpoint for UploadWriter {
    type Output = UploadSession;

    fn method(&self) -> Method {
        Method::PATCH
    }

    fn url(&self, _api_base: &Url) -> Result<Url> {
        Ok(self.session.location.clone())
    }

    fn body(&self) -> Option<RequestBody> {
        Some(RequestBody::Stream {
            content_type: OCTET_STREAM.to_string(),
            length: self.content.len() as u64,
            body: upload_body(self.content.clone(), self.progress.clone()),
        })
    }

    fn description(&self) -> String {
        "upload blob content".to_string()
    }

    async fn handle_response(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        let location = site.location(&response)?.ok_or_else(|| site.missing_location())?;
        Ok(UploadSession { location })
    }
}

/// `PUT <location>?digest=<digest>`
pub(crate) struct UploadCommitter {
    session: UploadSession,
    digest: ContentDigest,
}

impl UploadCommitter {
    pub fn new(session: UploadSession, digest: &ContentDigest) -> Self {
        UploadCommitter {
            session,
            digest: digest.clone(),
        }
    }
}

impl RegistryEndpoint for UploadCommitter {
    type Output = ();

    fn method(&self) -> Method {
        Method::PUT
    }

    fn url(&self, _api_base: &Url) -> Result<Url> {
        let mut url = self.session.location.clone();
        url.query_pairs_mut()
            .append_pair("digest", &self.digest.to_string());
        Ok(url)
    }

    fn body(&self) -> Option<RequestBody> {
        Some(empty_body())
    }

    fn description(&self) -> String {
        format!("commit upload of {}", self.digest)
    }

    async fn handle_response(&self, _site: &CallSite, _response: Response) -> Result<Self::Output> {
        debug!(digest = %self.digest, "Upload committed");
        Ok(())
    }
}
