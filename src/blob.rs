//! Helpers for streaming blobs and verifying their content
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::digest::{ContentDigest, DigestError, Digester};
use crate::endpoint::CallSite;
use crate::errors::{RegistryError, Result};
use crate::events::TimerScope;

/// Receives byte counts as content is transferred.
///
/// Each call reports the bytes moved since the previous call.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Receives the total size of a blob when its download starts
pub type SizeCallback = Box<dyn FnOnce(u64) + Send>;

/// Size of the pieces an upload body is cut into for progress reporting
const UPLOAD_PIECE_SIZE: usize = 64 * 1024;

/// The content of a blob being pulled.
///
/// Nothing is requested from the registry until the stream is first polled.
/// The content is verified against the requested digest when the stream
/// ends; a mismatch is reported as the last item. Dropping the stream early
/// releases the connection.
pub struct PulledBlob {
    inner: BoxStream<'static, Result<Bytes>>,
}

impl PulledBlob {
    pub(crate) fn lazy<F, T>(
        open: F,
        digest: ContentDigest,
        size_callback: Option<SizeCallback>,
        progress: Option<ProgressCallback>,
        start_timer: T,
    ) -> Self
    where
        F: Future<Output = Result<(CallSite, reqwest::Response)>> + Send + 'static,
        T: FnOnce() -> TimerScope + Send + 'static,
    {
        let opened = async move {
            let timer = start_timer();
            let (site, response) = open.await?;
            if let (Some(callback), Some(size)) = (size_callback, response.content_length()) {
                callback(size);
            }
            let body_site = site.clone();
            let chunks = response
                .bytes_stream()
                .map_err(move |e| body_site.body_error(e))
                .boxed();
            let verified = VerifyingStream::new(chunks, digest, site).map(move |item| {
                // the timer finishes when the stream is dropped
                let _ = &timer;
                item
            });
            Ok::<_, RegistryError>(verified)
        };
        let inner = stream::once(opened)
            .try_flatten()
            .inspect_ok(move |chunk| {
                if let Some(progress) = &progress {
                    progress(chunk.len() as u64);
                }
            })
            .boxed();
        PulledBlob { inner }
    }

    /// Copies the whole blob into `out`, returning the number of bytes written
    pub async fn write_to<W: AsyncWrite + Unpin>(mut self, out: &mut W) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = self.inner.try_next().await? {
            out.write_all(&chunk).await.map_err(RegistryError::Output)?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(RegistryError::Output)?;
        Ok(written)
    }
}

impl Stream for PulledBlob {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

pub(crate) struct VerifyingStream {
    stream: BoxStream<'static, Result<Bytes>>,
    digester: Digester,
    expected_digest: ContentDigest,
    site: CallSite,
    done: bool,
}

impl VerifyingStream {
    pub fn new(
        stream: BoxStream<'static, Result<Bytes>>,
        expected_digest: ContentDigest,
        site: CallSite,
    ) -> Self {
        Self {
            stream,
            digester: Digester::new(expected_digest.algorithm()),
            expected_digest,
            site,
            done: false,
        }
    }
}

impl Stream for VerifyingStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match futures_util::ready!(this.stream.as_mut().poll_next(cx)) {
            Some(Ok(bytes)) => {
                this.digester.update(&bytes);
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => {
                this.done = true;
                // Now that we've reached the end of the stream, verify the digest
                let digest = this.digester.finalize();
                if digest == this.expected_digest {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(this.site.digest_error(
                        DigestError::VerificationError {
                            expected: this.expected_digest.to_string(),
                            actual: digest.to_string(),
                        },
                    ))))
                }
            }
        }
    }
}

/// Builds a request body over `content` that reports progress as the
/// transport consumes it
pub(crate) fn upload_body(content: Bytes, progress: Option<ProgressCallback>) -> reqwest::Body {
    let pieces: Vec<Bytes> = (0..content.len())
        .step_by(UPLOAD_PIECE_SIZE)
        .map(|start| content.slice(start..(start + UPLOAD_PIECE_SIZE).min(content.len())))
        .collect();
    let stream = stream::iter(pieces).map(move |piece| {
        if let Some(progress) = &progress {
            progress(piece.len() as u64);
        }
        Ok::<_, std::io::Error>(piece)
    });
    reqwest::Body::wrap_stream(stream)
}
