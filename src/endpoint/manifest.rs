use std::marker::PhantomData;

use bytes::Bytes;
use http::{Method, StatusCode};
use reqwest::Response;
use tracing::{debug, warn};
use url::Url;

use super::{api_url, parse_envelope, CallSite, RegistryEndpoint, RequestBody};
use crate::digest::{digest_header_value, validate_digest, ContentDigest};
use crate::errors::{codes, RegistryError, Result};
use crate::manifest::{to_canonical_json, ManifestFormat, PushableManifest};
use crate::regexp::ANCHORED_TAG;
use crate::types::ManifestAndDigest;

/// Rejects a manifest reference that is neither a tag nor a digest
fn check_reference(reference: &str) -> Result<()> {
    if ANCHORED_TAG.is_match(reference) || reference.parse::<ContentDigest>().is_ok() {
        return Ok(());
    }
    Err(RegistryError::InvalidConfiguration(format!(
        "invalid tag or digest {reference:?}"
    )))
}

/// `GET /v2/<name>/manifests/<reference>`
pub(crate) struct ManifestPuller<M> {
    image_name: String,
    reference: String,
    _format: PhantomData<fn() -> M>,
}

impl<M> ManifestPuller<M> {
    pub fn new(image_name: &str, reference: &str) -> Result<Self> {
        check_reference(reference)?;
        Ok(ManifestPuller {
            image_name: image_name.to_string(),
            reference: reference.to_string(),
            _format: PhantomData,
        })
    }
}

impl<M: ManifestFormat> RegistryEndpoint for ManifestPuller<M> {
    type Output = ManifestAndDigest<M>;

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, api_base: &Url) -> Result<Url> {
        api_url(
            api_base,
            &format!("{}/manifests/{}", self.image_name, self.reference),
        )
    }

    fn accept(&self) -> &[&'static str] {
        M::accepted_media_types()
    }

    fn description(&self) -> String {
        format!("pull manifest for {}:{}", self.image_name, self.reference)
    }

    async fn handle_response(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        let digest_header =
            digest_header_value(response.headers()).map_err(|e| site.digest_error(e))?;
        let body = site.read_body(response).await?;

        // Only digests contain a colon, tags cannot
        let reference_digest = self
            .reference
            .contains(':')
            .then(|| self.reference.parse::<ContentDigest>())
            .transpose()
            .map_err(|e| site.digest_error(e))?;

        let digest = validate_digest(&body, digest_header.as_deref(), reference_digest.as_ref())
            .map_err(|e| site.digest_error(e))?;
        let manifest = M::from_slice(&body).map_err(|e| site.manifest_error(e))?;
        debug!(%digest, reference = %self.reference, "Pulled manifest");
        Ok(ManifestAndDigest { manifest, digest })
    }
}

/// `PUT /v2/<name>/manifests/<tag>`
pub(crate) struct ManifestPusher {
    image_name: String,
    tag: String,
    content_type: String,
    body: Bytes,
    local_digest: ContentDigest,
}

impl ManifestPusher {
    pub fn new<M: PushableManifest>(image_name: &str, tag: &str, manifest: &M) -> Result<Self> {
        check_reference(tag)?;
        let body = to_canonical_json(manifest).map_err(RegistryError::ManifestSerialization)?;
        let local_digest = ContentDigest::sha256_of(&body);
        Ok(ManifestPusher {
            image_name: image_name.to_string(),
            tag: tag.to_string(),
            content_type: manifest.content_type(),
            body: Bytes::from(body),
            local_digest,
        })
    }
}

impl RegistryEndpoint for ManifestPusher {
    type Output = ContentDigest;

    fn method(&self) -> Method {
        Method::PUT
    }

    fn url(&self, api_base: &Url) -> Result<Url> {
        api_url(
            api_base,
            &format!("{}/manifests/{}", self.image_name, self.tag),
        )
    }

    fn body(&self) -> Option<RequestBody> {
        Some(RequestBody::Bytes {
            content_type: self.content_type.clone(),
            data: self.body.clone(),
        })
    }

    fn description(&self) -> String {
        format!("push manifest for {}:{}", self.image_name, self.tag)
    }

    async fn handle_response(&self, _site: &CallSite, response: Response) -> Result<Self::Output> {
        let reported = digest_header_value(response.headers())
            .ok()
            .flatten()
            .and_then(|header| match header.parse::<ContentDigest>() {
                Ok(digest) => Some(digest),
                Err(error) => {
                    warn!(%header, %error, "Ignoring unparseable digest reported by the registry");
                    None
                }
            });
        match reported {
            Some(reported) => {
                if reported != self.local_digest {
                    warn!(
                        %reported,
                        local = %self.local_digest,
                        "Registry reported a manifest digest different from the pushed content"
                    );
                }
                Ok(reported)
            }
            None => Ok(self.local_digest.clone()),
        }
    }

    async fn handle_error(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        let status = response.status();
        let body = site.read_body(response).await?;
        let rejected_format = status == StatusCode::UNSUPPORTED_MEDIA_TYPE
            || parse_envelope(&body).is_some_and(|envelope| {
                envelope.has_code(codes::MANIFEST_INVALID) || envelope.has_code(codes::TAG_INVALID)
            });
        if rejected_format {
            return Err(RegistryError::ManifestRejected {
                method: site.method.clone(),
                url: site.url.to_string(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Err(site.error_from_body(status, &body))
    }
}
