//! Fetch-on-miss: pull a sealed object from a candidate holder into the
//! local peer. The same copy protocol moves objects between tiers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::model::{AccessFlags, AcquireMeta, BlobKind, BlobSpec, ObjectId, PeerEndpoint};
use crate::peer::{Acquired, Peer};
use crate::resolver::Resolver;
use crate::transport::{connect, wire::AcquireRequest, ClientBlob, Transport};

/// TTL of the short-lived remote READ lease taken during a copy.
pub const FETCH_LEASE_TTL: Duration = Duration::from_secs(30);

/// Copy granularity.
const COPY_CHUNK: u64 = 64 * 1024;

/// Copies a sealed object from `src` into `local` and seals it there.
///
/// On success the returned lease is the local READ lease (the CREATE lease
/// converted by the seal). On failure the local CREATING copy is discarded
/// and the remote lease released, leaving both peers as they were.
pub async fn copy_into_local(
    local: &dyn Peer,
    src: &dyn Transport,
    objid: ObjectId,
    kind_override: Option<BlobKind>,
) -> CacheResult<Acquired> {
    let remote = src
        .acquire(AcquireRequest::read(&objid, Some(FETCH_LEASE_TTL)))
        .await?;

    let meta = AcquireMeta {
        blob_specs: remote
            .blobs
            .iter()
            .map(|b| BlobSpec {
                kind: kind_override.unwrap_or(b.kind),
                size: b.size,
            })
            .collect(),
        user_meta: remote.object.user_meta.clone(),
        prev_objid: remote.object.prev_objid.clone(),
    };

    let mut acquired = match local
        .acquire(objid.clone(), AccessFlags::CREATE, Some(meta), None)
        .await
    {
        Ok(acquired) => acquired,
        Err(err) => {
            let _ = src.release(remote.lease_id).await;
            return Err(err);
        }
    };

    let copied = copy_blob_bytes(&remote.blobs, &acquired).await;
    let sealed = match copied {
        Ok(()) => local.seal(acquired.lease.id).await,
        Err(err) => Err(err),
    };
    if let Err(err) = sealed {
        let _ = local.discard(acquired.lease.id).await;
        let _ = src.release(remote.lease_id).await;
        return Err(err);
    }

    if let Err(err) = src.release(remote.lease_id).await {
        debug!("release of remote copy lease failed: {}", err);
    }

    // The seal converted the local lease to READ.
    acquired.lease.flags = AccessFlags::READ;
    Ok(acquired)
}

async fn copy_blob_bytes(src: &[ClientBlob], dst: &Acquired) -> CacheResult<()> {
    if src.len() != dst.blobs.len() {
        return Err(CacheError::with_message(
            ErrorKind::Internal,
            "blob count mismatch during copy",
        ));
    }
    for (src_blob, dst_blob) in src.iter().zip(dst.blobs.iter()) {
        let mut offset = 0u64;
        while offset < src_blob.size {
            let len = COPY_CHUNK.min(src_blob.size - offset);
            let chunk = src_blob.read_at(offset, len)?;
            dst_blob.write_at(offset, &chunk)?;
            offset += len;
        }
    }
    Ok(())
}

/// A local peer plus a resolver: read-through access with fetch-on-miss.
pub struct FetchClient {
    local: Arc<dyn Peer>,
    resolver: Arc<dyn Resolver>,
    local_endpoint: PeerEndpoint,
    cursor: AtomicUsize,
}

impl FetchClient {
    /// `local_endpoint` is what gets advertised to the resolver after a
    /// successful fetch.
    pub fn new(
        local: Arc<dyn Peer>,
        resolver: Arc<dyn Resolver>,
        local_endpoint: PeerEndpoint,
    ) -> Self {
        Self {
            local,
            resolver,
            local_endpoint,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn local(&self) -> &Arc<dyn Peer> {
        &self.local
    }

    /// Acquires `objid` for reading, copying it from a candidate holder if
    /// the local peer misses.
    ///
    /// Candidates are tried in rotating order. A candidate that misses or
    /// cannot be reached is skipped; one that answers `Gone` is also pruned
    /// from the resolver. Any other failure aborts the fetch.
    pub async fn acquire_read(
        &self,
        objid: ObjectId,
        ttl: Option<Duration>,
    ) -> CacheResult<Acquired> {
        match self
            .local
            .acquire(objid.clone(), AccessFlags::READ, None, ttl)
            .await
        {
            Err(err) if err.kind == ErrorKind::NotFound => {}
            other => return other,
        }

        let candidates = self.resolver.lookup(&objid).await;
        if candidates.is_empty() {
            return Err(CacheError::new(ErrorKind::NotFound));
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        for i in 0..candidates.len() {
            let endpoint = &candidates[(start + i) % candidates.len()];
            let transport = match connect(endpoint).await {
                Ok(transport) => transport,
                Err(err) => {
                    debug!("candidate {} unreachable: {}", endpoint, err);
                    continue;
                }
            };

            match copy_into_local(self.local.as_ref(), transport.as_ref(), objid.clone(), None)
                .await
            {
                Ok(acquired) => {
                    self.resolver.register(&objid, &self.local_endpoint).await;
                    return Ok(acquired);
                }
                Err(err) => match err.kind {
                    ErrorKind::NotFound | ErrorKind::TransportError => {
                        debug!("candidate {} missed {}: {}", endpoint, objid, err);
                        continue;
                    }
                    ErrorKind::Gone => {
                        self.resolver.unregister(&objid, endpoint).await;
                        continue;
                    }
                    _ => return Err(err),
                },
            }
        }

        Err(CacheError::new(ErrorKind::NotFound))
    }
}
