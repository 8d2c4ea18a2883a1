//! Manifest media types and the shapes a pulled manifest can be parsed into
//!
//! The manifest documents themselves are modeled by [`oci_spec::image`]; this
//! module only decides which shape a received document has and how to put
//! one on the wire.
use std::fmt;

use oci_spec::image::{ImageIndex, ImageManifest};
use olpc_cjson::CanonicalFormatter;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

/// The mediatype for a Docker v2 schema 2 manifest.
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// The mediatype for a Docker v2 schema 2 manifest list.
pub const IMAGE_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// The mediatype for an OCI image index manifest.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// The mediatype for an OCI image manifest.
pub const OCI_IMAGE_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Errors raised while interpreting a manifest document
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The document is not valid JSON for the requested shape
    #[error("cannot parse manifest: {0}")]
    Parsing(#[source] serde_json::Error),
    /// Only schema version 2 documents are supported
    #[error("unsupported manifest schema version {0}")]
    UnsupportedSchemaVersion(u32),
    /// The media type is not one of the known manifest media types
    #[error("unsupported manifest media type {0}")]
    UnsupportedMediaType(String),
    /// The document is a valid manifest, but not of the requested kind
    #[error("expected {expected}, but the registry returned {actual}")]
    UnexpectedKind {
        /// The requested kind
        expected: ManifestKind,
        /// The kind found in the document
        actual: ManifestKind,
    },
}

/// The two families of schema 2 manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// A single-platform image manifest
    Image,
    /// A multi-platform image index (manifest list)
    Index,
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestKind::Image => f.write_str("an image manifest"),
            ManifestKind::Index => f.write_str("an image index"),
        }
    }
}

/// The discriminating fields every manifest carries
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Versioned {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<IgnoredAny>,
}

impl ManifestKind {
    /// Inspects the discriminator fields of a raw manifest
    pub fn detect(body: &[u8]) -> Result<Self, ManifestError> {
        let versioned: Versioned = serde_json::from_slice(body).map_err(ManifestError::Parsing)?;
        if versioned.schema_version != 2 {
            return Err(ManifestError::UnsupportedSchemaVersion(
                versioned.schema_version,
            ));
        }
        match versioned.media_type.as_deref() {
            Some(IMAGE_MANIFEST_MEDIA_TYPE) | Some(OCI_IMAGE_MEDIA_TYPE) => Ok(ManifestKind::Image),
            Some(IMAGE_MANIFEST_LIST_MEDIA_TYPE) | Some(OCI_IMAGE_INDEX_MEDIA_TYPE) => {
                Ok(ManifestKind::Index)
            }
            Some(other) => Err(ManifestError::UnsupportedMediaType(other.to_string())),
            // OCI documents may omit the media type
            None if versioned.manifests.is_some() => Ok(ManifestKind::Index),
            None => Ok(ManifestKind::Image),
        }
    }
}

/// A shape a pulled manifest can be parsed into.
pub trait ManifestFormat: Sized + Send + 'static {
    /// The media types to send in the `Accept` header
    fn accepted_media_types() -> &'static [&'static str];

    /// Parses the exact bytes received from the registry
    fn from_slice(body: &[u8]) -> Result<Self, ManifestError>;
}

/// A manifest that can be pushed to a registry
pub trait PushableManifest: Serialize + Sync {
    /// The `Content-Type` to push the manifest with
    fn content_type(&self) -> String;
}

/// Any manifest this client understands, chosen after inspecting the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    /// A single-platform image manifest (OCI or Docker schema 2)
    Image(ImageManifest),
    /// An image index or Docker manifest list
    Index(ImageIndex),
}

impl Manifest {
    /// The kind of this manifest
    pub fn kind(&self) -> ManifestKind {
        match self {
            Manifest::Image(_) => ManifestKind::Image,
            Manifest::Index(_) => ManifestKind::Index,
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ManifestError> {
    serde_json::from_slice(body).map_err(ManifestError::Parsing)
}

fn expect_kind(body: &[u8], expected: ManifestKind) -> Result<(), ManifestError> {
    let actual = ManifestKind::detect(body)?;
    if actual != expected {
        return Err(ManifestError::UnexpectedKind { expected, actual });
    }
    Ok(())
}

impl ManifestFormat for ImageManifest {
    fn accepted_media_types() -> &'static [&'static str] {
        &[OCI_IMAGE_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE]
    }

    fn from_slice(body: &[u8]) -> Result<Self, ManifestError> {
        expect_kind(body, ManifestKind::Image)?;
        parse(body)
    }
}

impl ManifestFormat for ImageIndex {
    fn accepted_media_types() -> &'static [&'static str] {
        &[OCI_IMAGE_INDEX_MEDIA_TYPE, IMAGE_MANIFEST_LIST_MEDIA_TYPE]
    }

    fn from_slice(body: &[u8]) -> Result<Self, ManifestError> {
        expect_kind(body, ManifestKind::Index)?;
        parse(body)
    }
}

impl ManifestFormat for Manifest {
    fn accepted_media_types() -> &'static [&'static str] {
        &[
            OCI_IMAGE_MEDIA_TYPE,
            IMAGE_MANIFEST_MEDIA_TYPE,
            OCI_IMAGE_INDEX_MEDIA_TYPE,
            IMAGE_MANIFEST_LIST_MEDIA_TYPE,
        ]
    }

    fn from_slice(body: &[u8]) -> Result<Self, ManifestError> {
        match ManifestKind::detect(body)? {
            ManifestKind::Image => parse(body).map(Manifest::Image),
            ManifestKind::Index => parse(body).map(Manifest::Index),
        }
    }
}

impl PushableManifest for ImageManifest {
    fn content_type(&self) -> String {
        self.media_type()
            .as_ref()
            .map(|media_type| media_type.to_string())
            .unwrap_or_else(|| OCI_IMAGE_MEDIA_TYPE.to_string())
    }
}

impl PushableManifest for ImageIndex {
    fn content_type(&self) -> String {
        self.media_type()
            .as_ref()
            .map(|media_type| media_type.to_string())
            .unwrap_or_else(|| OCI_IMAGE_INDEX_MEDIA_TYPE.to_string())
    }
}

impl PushableManifest for Manifest {
    fn content_type(&self) -> String {
        match self {
            Manifest::Image(manifest) => manifest.content_type(),
            Manifest::Index(index) => index.content_type(),
        }
    }
}

/// Serializes a manifest with a canonical json formatter, as described at
/// <https://github.com/opencontainers/image-spec/blob/main/considerations.md#json>
pub(crate) fn to_canonical_json<M: Serialize + ?Sized>(
    manifest: &M,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut body, CanonicalFormatter::new());
    manifest.serialize(&mut ser)?;
    Ok(body)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) const DOCKER_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1469,
            "digest": "sha256:feb5d9fea6a5e9606aa995e879d862b825965ba48de054caab5ef356dc6b3412"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 2479,
                "digest": "sha256:2db29710123e3e53a794f2694094b9b4338aa9ee5c40b930cb8063a1be392c54"
            }
        ]
    }"#;

    pub(crate) const OCI_INDEX_WITHOUT_MEDIA_TYPE: &str = r#"{
        "schemaVersion": 2,
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 7143,
                "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
                "platform": {"architecture": "amd64", "os": "linux"}
            }
        ]
    }"#;

    #[test]
    fn detects_manifest_kinds() {
        assert_eq!(
            ManifestKind::detect(DOCKER_MANIFEST.as_bytes()).unwrap(),
            ManifestKind::Image
        );
        assert_eq!(
            ManifestKind::detect(OCI_INDEX_WITHOUT_MEDIA_TYPE.as_bytes()).unwrap(),
            ManifestKind::Index
        );
        assert!(matches!(
            ManifestKind::detect(br#"{"schemaVersion": 1, "name": "x"}"#),
            Err(ManifestError::UnsupportedSchemaVersion(1))
        ));
        assert!(matches!(
            ManifestKind::detect(br#"{"schemaVersion": 2, "mediaType": "text/plain"}"#),
            Err(ManifestError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            ManifestKind::detect(b"not json"),
            Err(ManifestError::Parsing(_))
        ));
    }

    #[test]
    fn generic_envelope_chooses_variant() {
        let manifest = Manifest::from_slice(DOCKER_MANIFEST.as_bytes()).unwrap();
        assert_eq!(manifest.kind(), ManifestKind::Image);
        assert_eq!(manifest.content_type(), IMAGE_MANIFEST_MEDIA_TYPE);

        let index = Manifest::from_slice(OCI_INDEX_WITHOUT_MEDIA_TYPE.as_bytes()).unwrap();
        assert_eq!(index.kind(), ManifestKind::Index);
        assert_eq!(index.content_type(), OCI_IMAGE_INDEX_MEDIA_TYPE);
    }

    #[test]
    fn concrete_shape_rejects_other_kind() {
        let err = ImageManifest::from_slice(OCI_INDEX_WITHOUT_MEDIA_TYPE.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::UnexpectedKind {
                expected: ManifestKind::Image,
                actual: ManifestKind::Index
            }
        ));
        ImageIndex::from_slice(OCI_INDEX_WITHOUT_MEDIA_TYPE.as_bytes())
            .expect("an index parses as an index");
    }

    #[test]
    fn canonical_json_is_stable() {
        let manifest = ImageManifest::from_slice(DOCKER_MANIFEST.as_bytes()).unwrap();
        let first = to_canonical_json(&manifest).unwrap();
        let reparsed = ImageManifest::from_slice(&first).unwrap();
        assert_eq!(to_canonical_json(&reparsed).unwrap(), first);
        assert!(!first.contains(&b'\n'));
    }
}
