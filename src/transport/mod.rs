//! Transport adapters: marshal peer operations over Direct, HTTP and UDS.
//!
//! Every adapter is a strict wrapper over a peer; semantics live in the
//! peer core alone. The client side of each adapter yields [`ClientBlob`]
//! handles so bytes flow directly between client and storage.

mod direct;
mod http;
mod uds;
pub mod wire;

pub use direct::DirectTransport;
pub use http::{peer_router, HttpTransport};
pub use uds::{UdsServer, UdsTransport};

use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::blob::Blob;
use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::model::{BlobKind, LeaseId, ObjectSummary, PeerStats};
use crate::peer::{global_peer, CachePeer, PeerConfig};
use wire::AcquireRequest;

/// Result of a client-side `Acquire` over any transport.
#[derive(Debug)]
pub struct ClientAcquired {
    pub lease_id: LeaseId,
    pub object: ObjectSummary,
    pub blobs: Vec<ClientBlob>,
}

/// A blob handle as seen by a transport client.
#[derive(Debug)]
pub struct ClientBlob {
    pub kind: BlobKind,
    pub size: u64,
    source: BlobSource,
}

#[derive(Debug)]
enum BlobSource {
    /// Same-process blob (direct transport).
    Local(Arc<Blob>),
    /// Descriptor received over UDS via SCM_RIGHTS.
    Fd(File),
    /// Path-style handle (File and SharedFs backends).
    Path(PathBuf),
    /// Control-plane-only handle: the transport could not export bytes
    /// (e.g. a memory blob over HTTP).
    Opaque,
}

impl ClientBlob {
    pub fn local(blob: Arc<Blob>) -> Self {
        Self {
            kind: blob.kind(),
            size: blob.size(),
            source: BlobSource::Local(blob),
        }
    }

    pub fn from_fd(kind: BlobKind, size: u64, file: File) -> Self {
        Self {
            kind,
            size,
            source: BlobSource::Fd(file),
        }
    }

    pub fn from_path(kind: BlobKind, size: u64, path: PathBuf) -> Self {
        Self {
            kind,
            size,
            source: BlobSource::Path(path),
        }
    }

    pub fn opaque(kind: BlobKind, size: u64) -> Self {
        Self {
            kind,
            size,
            source: BlobSource::Opaque,
        }
    }

    /// Path of the data file for path-style sources.
    fn data_path(&self) -> CacheResult<PathBuf> {
        match &self.source {
            BlobSource::Path(path) => Ok(if self.kind == BlobKind::SharedFs {
                path.join("data")
            } else {
                path.clone()
            }),
            _ => Err(CacheError::with_message(
                ErrorKind::TransportError,
                "blob has no path-style handle",
            )),
        }
    }

    pub fn read_at(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        match &self.source {
            BlobSource::Local(blob) => blob.read_at(offset, len),
            BlobSource::Fd(file) => {
                let mut buf = vec![0u8; len as usize];
                file.read_exact_at(&mut buf, offset)?;
                Ok(Bytes::from(buf))
            }
            BlobSource::Path(_) => {
                let file = File::open(self.data_path()?)?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact_at(&mut buf, offset)?;
                Ok(Bytes::from(buf))
            }
            BlobSource::Opaque => Err(CacheError::with_message(
                ErrorKind::TransportError,
                "blob bytes are not reachable over this transport",
            )),
        }
    }

    pub fn read_all(&self) -> CacheResult<Bytes> {
        self.read_at(0, self.size)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> CacheResult<()> {
        match &self.source {
            BlobSource::Local(blob) => blob.write_at(offset, data),
            BlobSource::Fd(file) => {
                file.write_all_at(data, offset)?;
                Ok(())
            }
            BlobSource::Path(_) => {
                let file = OpenOptions::new().write(true).open(self.data_path()?)?;
                file.write_all_at(data, offset)?;
                Ok(())
            }
            BlobSource::Opaque => Err(CacheError::with_message(
                ErrorKind::TransportError,
                "blob bytes are not reachable over this transport",
            )),
        }
    }

    /// Memory-maps an fd-backed blob for zero-copy reads.
    pub fn map(&self) -> CacheResult<memmap2::Mmap> {
        match &self.source {
            BlobSource::Fd(file) => unsafe { memmap2::Mmap::map(file) }
                .map_err(|e| CacheError::internal(format!("mmap: {}", e))),
            _ => Err(CacheError::with_message(
                ErrorKind::TransportError,
                "only fd-backed blobs can be mapped",
            )),
        }
    }
}

/// Client side of the adapter protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn acquire(&self, request: AcquireRequest) -> CacheResult<ClientAcquired>;
    async fn seal(&self, lease_id: LeaseId) -> CacheResult<()>;
    async fn discard(&self, lease_id: LeaseId) -> CacheResult<()>;
    async fn release(&self, lease_id: LeaseId) -> CacheResult<()>;
    async fn stats(&self) -> CacheResult<PeerStats>;
}

/// Opens a transport for a connection URI.
///
/// - `""`: a private in-process peer.
/// - `memory://<name>`: the process-global peer registry.
/// - `http://` / `https://`: the HTTP adapter.
/// - a path ending in `.sock` (or an existing socket node): the UDS adapter.
/// - `direct://`: rejected here; use [`DirectTransport::new`] with a peer.
pub async fn connect(uri: &str) -> CacheResult<Box<dyn Transport>> {
    if uri.is_empty() {
        let data_dir = tempfile::tempdir()
            .map_err(|e| CacheError::internal(format!("scratch dir: {}", e)))?
            .into_path();
        let peer = CachePeer::new(PeerConfig::in_dir(data_dir));
        return Ok(Box::new(DirectTransport::new(peer)));
    }

    if let Some(name) = uri.strip_prefix("memory://") {
        return Ok(Box::new(DirectTransport::new(global_peer(name))));
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Box::new(HttpTransport::new(uri)?));
    }

    if uri.starts_with("direct://") {
        return Err(CacheError::with_message(
            ErrorKind::Validation,
            "direct:// requires an in-process peer; use DirectTransport::new",
        ));
    }

    let path = std::path::Path::new(uri);
    let looks_like_socket = uri.ends_with(".sock")
        || std::fs::metadata(path)
            .map(|m| {
                use std::os::unix::fs::FileTypeExt;
                m.file_type().is_socket()
            })
            .unwrap_or(false);
    if looks_like_socket {
        return Ok(Box::new(UdsTransport::connect(path).await?));
    }

    Err(CacheError::with_message(
        ErrorKind::Validation,
        format!("unrecognized connection uri {:?}", uri),
    ))
}
