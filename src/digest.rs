//! Content digests and functions for validating them

use std::fmt;
use std::str::FromStr;

use http::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;

/// The header a registry uses to report the digest of a manifest or blob
pub const DOCKER_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Errors that can occur when parsing or validating digests
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Invalid digest header
    #[error("Invalid digest header: {0}")]
    InvalidHeader(#[from] http::header::ToStrError),
    /// Invalid digest algorithm found
    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Missing digest algorithm
    #[error("Missing digest algorithm")]
    MissingAlgorithm,
    /// The encoded part is not a lowercase hex string of the right length
    #[error("Invalid {algorithm} digest value: {encoded}")]
    InvalidEncoding {
        /// The digest algorithm
        algorithm: String,
        /// The rejected value
        encoded: String,
    },
    /// Digest verification failed
    #[error("Invalid digest. Expected {expected}, got {actual}")]
    VerificationError {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },
}

/// The hash algorithms a [`ContentDigest`] can be tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    #[allow(missing_docs)]
    Sha256,
    #[allow(missing_docs)]
    Sha384,
    #[allow(missing_docs)]
    Sha512,
}

impl DigestAlgorithm {
    /// The name used in the `<algorithm>:<hex>` notation
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha384 => 96,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// An algorithm-tagged content hash, the identity of a blob or manifest.
///
/// Two digests are equal when both the algorithm and the hash bytes are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    encoded: String,
}

impl ContentDigest {
    /// Computes the sha256 digest of `data`
    pub fn sha256_of(data: &[u8]) -> Self {
        ContentDigest {
            algorithm: DigestAlgorithm::Sha256,
            encoded: format!("{:x}", sha2::Sha256::digest(data)),
        }
    }

    /// Computes the digest of `data` using the given algorithm
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let encoded = match algorithm {
            DigestAlgorithm::Sha256 => format!("{:x}", sha2::Sha256::digest(data)),
            DigestAlgorithm::Sha384 => format!("{:x}", sha2::Sha384::digest(data)),
            DigestAlgorithm::Sha512 => format!("{:x}", sha2::Sha512::digest(data)),
        };
        ContentDigest { algorithm, encoded }
    }

    /// The algorithm this digest was computed with
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The lowercase hex encoding of the hash
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Checks that `data` hashes to this digest
    pub fn verify(&self, data: &[u8]) -> Result<(), DigestError> {
        let actual = ContentDigest::compute(self.algorithm, data);
        if &actual != self {
            return Err(DigestError::VerificationError {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl FromStr for ContentDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, encoded) = s.split_once(':').ok_or(DigestError::MissingAlgorithm)?;
        let algorithm: DigestAlgorithm = algorithm.parse()?;
        let valid = encoded.len() == algorithm.hex_len()
            && encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(DigestError::InvalidEncoding {
                algorithm: algorithm.as_str().to_string(),
                encoded: encoded.to_string(),
            });
        }
        Ok(ContentDigest {
            algorithm,
            encoded: encoded.to_string(),
        })
    }
}

impl TryFrom<&str> for ContentDigest {
    type Error = DigestError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.encoded)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Helper wrapper around various digest algorithms to make it easier to use them with our blob
/// utils. This has to be an enum because the digest algorithms aren't object safe so we can't box
/// dynner them
pub(crate) enum Digester {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Digester::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha384 => Digester::Sha384(sha2::Sha384::new()),
            DigestAlgorithm::Sha512 => Digester::Sha512(sha2::Sha512::new()),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        match self {
            Self::Sha256(d) => d.update(data),
            Self::Sha384(d) => d.update(data),
            Self::Sha512(d) => d.update(data),
        }
    }

    pub fn finalize(&mut self) -> ContentDigest {
        let (algorithm, encoded) = match self {
            Self::Sha256(d) => (DigestAlgorithm::Sha256, format!("{:x}", d.finalize_reset())),
            Self::Sha384(d) => (DigestAlgorithm::Sha384, format!("{:x}", d.finalize_reset())),
            Self::Sha512(d) => (DigestAlgorithm::Sha512, format!("{:x}", d.finalize_reset())),
        };
        ContentDigest { algorithm, encoded }
    }
}

/// Helper for extracting the `Docker-Content-Digest` header from a response.
pub fn digest_header_value(headers: &HeaderMap) -> Result<Option<String>, DigestError> {
    headers
        .get(DOCKER_DIGEST_HEADER)
        .map(|hv| hv.to_str().map(|s| s.to_string()))
        .transpose()
        .map_err(DigestError::from)
}

/// Returns the digest of `body`, computed over the exact bytes received.
///
/// When the registry reported a digest header, or the content was requested by
/// digest, the body must hash to those values too. A header using a different
/// algorithm than sha256 is validated with its own algorithm.
pub fn validate_digest(
    body: &[u8],
    digest_header: Option<&str>,
    reference_digest: Option<&ContentDigest>,
) -> Result<ContentDigest, DigestError> {
    if let Some(reference) = reference_digest {
        reference.verify(body)?;
    }
    if let Some(header) = digest_header {
        let header: ContentDigest = header.parse()?;
        header.verify(body)?;
    }
    let digest = match reference_digest {
        Some(reference) => reference.clone(),
        None => ContentDigest::sha256_of(body),
    };
    tracing::debug!(%digest, "Computed digest of payload");
    Ok(digest)
}
