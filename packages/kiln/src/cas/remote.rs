//! Remote content peers.
//!
//! Every machine in a build cluster exposes its content store to its peers;
//! this module is the client side of that surface. Peers are consumed
//! through the [`RemoteStore`] trait so the engine never cares whether a
//! replica is an HTTP endpoint on another machine ([`HttpPeer`]) or another
//! store in the same process ([`InProcessPeer`], which is also what the
//! tests use to build multi-machine clusters without sockets).
//!
//! Blob bodies travel zstd-compressed; blobs live uncompressed at rest, so
//! compression is purely a wire concern.

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tokio::io::AsyncReadExt;
use tracing::{instrument, trace};
use url::Url;

use wire::{ContentHash, ContentType, dist::v1::MachineLocation};

use super::{StoreError, StoreErrorKind, local::LocalCas};

/// A peer that can answer for content by hash.
pub trait RemoteStore: Clone + Send + Sync + 'static {
    /// Where this peer lives.
    fn location(&self) -> MachineLocation;

    /// Whether the peer currently holds the content.
    fn exists(&self, hash: &ContentHash) -> impl Future<Output = Result<bool>> + Send;

    /// Fetch the content, or `None` if the peer no longer holds it.
    fn fetch(&self, hash: &ContentHash) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Push content to the peer. Returns `true` when the peer newly stored
    /// it.
    fn push(
        &self,
        hash: &ContentHash,
        content: &[u8],
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// Compress a blob for the wire.
pub async fn compress(content: &[u8]) -> Result<Vec<u8>> {
    let mut encoder =
        async_compression::tokio::bufread::ZstdEncoder::new(std::io::Cursor::new(content));
    let mut compressed = Vec::new();
    encoder
        .read_to_end(&mut compressed)
        .await
        .context("zstd compress")?;
    Ok(compressed)
}

/// Decompress a blob from the wire.
pub async fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder =
        async_compression::tokio::bufread::ZstdDecoder::new(std::io::Cursor::new(compressed));
    let mut content = Vec::new();
    decoder
        .read_to_end(&mut content)
        .await
        .context("zstd decompress")?;
    Ok(content)
}

/// A peer reached over HTTP.
///
/// The remote surface is three routes under `/api/v1/cas/{hash}`: `HEAD`
/// for existence, `GET` for content, `PUT` for ingestion (see
/// [`crate::dist::http`] for the serving side).
#[derive(Clone, Debug)]
pub struct HttpPeer {
    location: MachineLocation,
    base: Url,
    client: reqwest::Client,
}

impl HttpPeer {
    pub fn new(location: MachineLocation) -> Result<Self> {
        let base = Url::parse(location.as_str())
            .with_context(|| format!("parse peer location {location}"))?;
        Ok(Self {
            location,
            base,
            client: reqwest::Client::new(),
        })
    }

    fn blob_url(&self, hash: &ContentHash) -> Result<Url> {
        self.base
            .join(&format!("api/v1/cas/{hash}"))
            .context("join blob url")
    }

    fn transient(err: reqwest::Error) -> color_eyre::Report {
        eyre!(StoreError {
            kind: StoreErrorKind::RemoteTransient,
            message: err.to_string(),
        })
    }
}

impl RemoteStore for HttpPeer {
    fn location(&self) -> MachineLocation {
        self.location.clone()
    }

    #[instrument(skip(self), fields(peer = %self.location))]
    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        let response = self
            .client
            .head(self.blob_url(hash)?)
            .send()
            .await
            .map_err(Self::transient)?;
        Ok(response.status().is_success())
    }

    #[instrument(skip(self), fields(peer = %self.location))]
    async fn fetch(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.blob_url(hash)?)
            .header(ContentType::ACCEPT, ContentType::BytesZstd.value())
            .send()
            .await
            .map_err(Self::transient)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(eyre!(StoreError {
                kind: StoreErrorKind::RemoteTransient,
                message: format!("peer returned {}", response.status()),
            }));
        }

        let compressed = response
            .headers()
            .get(ContentType::HEADER)
            .is_some_and(|ct| ct == ContentType::BytesZstd);
        let body = response.bytes().await.map_err(Self::transient)?;
        let content = if compressed {
            decompress(&body).await?
        } else {
            body.to_vec()
        };

        // Never trust bytes off the wire.
        let actual = ContentHash::from_buffer(&content);
        if actual != *hash {
            return Err(eyre!(StoreError {
                kind: StoreErrorKind::ChecksumMismatch,
                message: format!("peer {} served {actual} for {hash}", self.location),
            }));
        }
        trace!(bytes = content.len(), "fetched blob from peer");
        Ok(Some(content))
    }

    #[instrument(skip(self, content), fields(peer = %self.location))]
    async fn push(&self, hash: &ContentHash, content: &[u8]) -> Result<bool> {
        let compressed = compress(content).await?;
        let response = self
            .client
            .put(self.blob_url(hash)?)
            .header(ContentType::HEADER, ContentType::BytesZstd.value())
            .body(compressed)
            .send()
            .await
            .map_err(Self::transient)?;

        match response.status() {
            reqwest::StatusCode::CREATED => Ok(true),
            status if status.is_success() => Ok(false),
            status => Err(eyre!(StoreError {
                kind: StoreErrorKind::RemoteTransient,
                message: format!("peer returned {status} on push"),
            })),
        }
    }
}

/// A peer in the same process: another machine's local store reached by
/// direct call. Tests build whole clusters out of these.
#[derive(Clone, Debug)]
pub struct InProcessPeer {
    location: MachineLocation,
    cas: LocalCas,
}

impl InProcessPeer {
    pub fn new(location: MachineLocation, cas: LocalCas) -> Self {
        Self { location, cas }
    }
}

impl RemoteStore for InProcessPeer {
    fn location(&self) -> MachineLocation {
        self.location.clone()
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.cas.contains(hash).await)
    }

    async fn fetch(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        self.cas.read_buffered(hash).await
    }

    async fn push(&self, hash: &ContentHash, content: &[u8]) -> Result<bool> {
        self.cas.write(hash, content).await
    }
}
