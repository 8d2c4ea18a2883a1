//! The registry client facade
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::auth::RegistryAuthenticator;
use crate::blob::{ProgressCallback, PulledBlob, SizeCallback};
use crate::caller::{with_transport_fallback, EndpointCaller, Transport};
use crate::config::{ClientConfig, ClientConfigSource, EndpointConfig};
use crate::digest::ContentDigest;
use crate::endpoint::blob::{BlobChecker, BlobPuller};
use crate::endpoint::manifest::{ManifestPuller, ManifestPusher};
use crate::endpoint::probe::AuthProbe;
use crate::endpoint::upload::{UploadCommitter, UploadInitializer, UploadStart, UploadWriter};
use crate::endpoint::RegistryEndpoint;
use crate::errors::Result;
use crate::events::TimerScope;
use crate::manifest::{ManifestFormat, PushableManifest};
use crate::mount::can_attempt_blob_mount;
use crate::secrets::Authorization;
use crate::types::{BlobDescriptor, ManifestAndDigest, PushBlobOutcome};

/// A client for one repository of a Docker/OCI registry.
///
/// The client is immutable: credentials are fixed at construction, and
/// [`RegistryClient::with_authorization`] derives a new client sharing the
/// same connection pools. Clones are cheap and can be used concurrently.
///
/// Registries that require bearer tokens are handled in two steps: ask
/// [`RegistryClient::registry_authenticator`] for an authenticator, trade
/// credentials for an [`Authorization`], then use a client carrying it.
///
/// ```rust,no_run
/// # async fn run() -> jib_registry::errors::Result<()> {
/// use jib_registry::{ClientConfig, EndpointConfig, RegistryAuth, RegistryClient};
/// use oci_spec::image::ImageManifest;
///
/// let endpoint = EndpointConfig::new("registry-1.docker.io", "library/openjdk")?;
/// let client = RegistryClient::new(endpoint, ClientConfig::from_env())?;
/// let client = match client.registry_authenticator().await? {
///     Some(authenticator) => {
///         let authorization = authenticator.authenticate_pull(&RegistryAuth::Anonymous).await?;
///         client.with_authorization(Some(authorization))
///     }
///     None => client,
/// };
/// let pulled = client.pull_manifest::<ImageManifest>("latest").await?;
/// println!("{}", pulled.digest);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct RegistryClient {
    endpoint: Arc<EndpointConfig>,
    caller: EndpointCaller,
    cross_repository_blob_mounts: bool,
}

impl RegistryClient {
    /// Creates an anonymous client for the given endpoint
    pub fn new(endpoint: EndpointConfig, config: ClientConfig) -> Result<Self> {
        let caller = EndpointCaller::new(endpoint.server(), &config)?;
        Ok(RegistryClient {
            endpoint: Arc::new(endpoint),
            caller,
            cross_repository_blob_mounts: config.cross_repository_blob_mounts,
        })
    }

    /// Create a new client with the supplied config
    pub fn from_source(
        endpoint: EndpointConfig,
        config_source: &impl ClientConfigSource,
    ) -> Result<Self> {
        Self::new(endpoint, config_source.client_config())
    }

    /// A client sending `authorization` with every registry request
    pub fn with_authorization(&self, authorization: Option<Authorization>) -> Self {
        RegistryClient {
            endpoint: self.endpoint.clone(),
            caller: self.caller.with_authorization(authorization),
            cross_repository_blob_mounts: self.cross_repository_blob_mounts,
        }
    }

    /// The authorization sent with every request
    pub fn authorization(&self) -> Option<&Authorization> {
        self.caller.authorization()
    }

    /// The registry and repository this client talks to
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// The `User-Agent` sent with every request, empty when disabled
    pub fn user_agent(&self) -> &str {
        self.caller.user_agent()
    }

    /// Probes the registry for a bearer token challenge.
    ///
    /// Returns `None` when the registry needs no token: it either allows
    /// anonymous access or expects static credentials such as Basic auth.
    pub async fn registry_authenticator(&self) -> Result<Option<RegistryAuthenticator>> {
        let challenge = self.caller.with_authorization(None).call(&AuthProbe).await?;
        Ok(challenge.map(|challenge| {
            RegistryAuthenticator::new(
                challenge,
                &self.endpoint,
                self.caller.secure_client().clone(),
                self.caller.user_agent().to_string(),
            )
        }))
    }

    /// Pulls a manifest by tag or digest.
    ///
    /// `M` selects the accepted shape: [`oci_spec::image::ImageManifest`],
    /// [`oci_spec::image::ImageIndex`], or [`crate::manifest::Manifest`] for
    /// any of them. The digest is computed over the exact bytes received.
    pub async fn pull_manifest<M: ManifestFormat>(
        &self,
        reference: &str,
    ) -> Result<ManifestAndDigest<M>> {
        let endpoint = ManifestPuller::<M>::new(self.endpoint.image_name(), reference)?;
        self.caller.call(&endpoint).await
    }

    /// Pushes a manifest under `tag` (or a digest), returning its digest
    pub async fn push_manifest<M: PushableManifest>(
        &self,
        manifest: &M,
        tag: &str,
    ) -> Result<ContentDigest> {
        let endpoint = ManifestPusher::new(self.endpoint.image_name(), tag, manifest)?;
        self.caller.call(&endpoint).await
    }

    /// Checks whether the repository has a blob. A missing blob is `Ok(None)`.
    pub async fn check_blob(&self, digest: &ContentDigest) -> Result<Option<BlobDescriptor>> {
        let endpoint = BlobChecker::new(self.endpoint.image_name(), digest);
        self.caller.call(&endpoint).await
    }

    /// Pulls a blob. The request is sent when the returned stream is first polled.
    pub fn pull_blob(&self, digest: &ContentDigest) -> PulledBlob {
        self.pull_blob_with_progress(digest, None, None)
    }

    /// Pulls a blob, reporting its size once the download starts and the
    /// bytes received as the stream is drained
    pub fn pull_blob_with_progress(
        &self,
        digest: &ContentDigest,
        size_callback: Option<SizeCallback>,
        progress: Option<ProgressCallback>,
    ) -> PulledBlob {
        let caller = self.caller.clone();
        let endpoint = BlobPuller::new(self.endpoint.image_name(), digest);
        let events = caller.events();
        let description = endpoint.description();
        PulledBlob::lazy(
            async move { caller.send(&endpoint).await },
            digest.clone(),
            size_callback,
            progress,
            move || TimerScope::new(events, description),
        )
    }

    /// Pushes a blob unless the repository already has it.
    ///
    /// When the endpoint names a source repository, the registry is first asked
    /// to mount the blob from there. `progress` receives the bytes sent.
    pub async fn push_blob(
        &self,
        digest: &ContentDigest,
        content: impl Into<Bytes>,
        progress: Option<ProgressCallback>,
    ) -> Result<PushBlobOutcome> {
        let content = content.into();
        let mount_from = self.mount_source();
        let timer = TimerScope::new(self.caller.events(), "pushBlob");
        with_transport_fallback(self.caller.allow_insecure(), |transport| {
            self.push_blob_over(
                &timer,
                transport,
                digest,
                &content,
                mount_from,
                progress.as_ref(),
            )
        })
        .await
    }

    /// The repository to mount from, when a mount is worth attempting
    fn mount_source(&self) -> Option<&str> {
        let source = self.endpoint.source_image_name()?;
        if !self.cross_repository_blob_mounts {
            debug!("Cross-repository blob mounts are disabled");
            return None;
        }
        can_attempt_blob_mount(self.authorization(), source).then_some(source)
    }

    /// One complete upload transaction over a single transport
    async fn push_blob_over(
        &self,
        parent: &TimerScope,
        transport: Transport,
        digest: &ContentDigest,
        content: &Bytes,
        mount_from: Option<&str>,
        progress: Option<&ProgressCallback>,
    ) -> Result<PushBlobOutcome> {
        let image_name = self.endpoint.image_name();
        let mut timer = parent.sub_timer(format!("pushBlob POST {digest}"));

        let initializer = UploadInitializer::new(image_name, digest, mount_from);
        let session = match self.caller.call_at(&initializer, transport).await? {
            UploadStart::Exists => return Ok(PushBlobOutcome::Skipped),
            UploadStart::Session(session) => session,
        };

        timer.lap(format!("pushBlob PATCH {digest}"));
        let writer = UploadWriter::new(session, content.clone(), progress.cloned());
        let session = self.caller.call_at(&writer, transport).await?;

        timer.lap(format!("pushBlob PUT {digest}"));
        let committer = UploadCommitter::new(session, digest);
        self.caller.call_at(&committer, transport).await?;
        Ok(PushBlobOutcome::Pushed)
    }
}
