//! Values returned by registry operations
use crate::digest::ContentDigest;

/// A blob as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    /// The digest of the blob
    pub digest: ContentDigest,
    /// The size of the blob in bytes
    pub size: u64,
}

/// A pulled manifest and the digest of the exact bytes received
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestAndDigest<M> {
    /// The parsed manifest
    pub manifest: M,
    /// The digest of the manifest as received
    pub digest: ContentDigest,
}

/// The outcome of a blob push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushBlobOutcome {
    /// The registry already had the blob, or mounted it from the source
    /// repository; no content was sent
    Skipped,
    /// The content was uploaded and committed
    Pushed,
}

impl PushBlobOutcome {
    /// Whether no content was sent
    pub fn was_skipped(&self) -> bool {
        matches!(self, PushBlobOutcome::Skipped)
    }
}
