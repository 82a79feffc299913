//! In-process transport: native records, no serialization, blob handles
//! shared by reference.

use async_trait::async_trait;
use std::sync::Arc;

use super::wire::AcquireRequest;
use super::{ClientAcquired, ClientBlob, Transport};
use crate::error::CacheResult;
use crate::model::{LeaseId, PeerStats};
use crate::peer::Peer;

/// Zero-copy adapter over an in-process peer. Semantics are exactly those
/// of calling the peer directly.
pub struct DirectTransport {
    peer: Arc<dyn Peer>,
}

impl DirectTransport {
    pub fn new(peer: Arc<dyn Peer>) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn acquire(&self, request: AcquireRequest) -> CacheResult<ClientAcquired> {
        let (objid, flags, meta, ttl) = request.into_parts()?;
        let acquired = self.peer.acquire(objid, flags, meta, ttl).await?;
        Ok(ClientAcquired {
            lease_id: acquired.lease.id,
            object: acquired.object,
            blobs: acquired.blobs.into_iter().map(ClientBlob::local).collect(),
        })
    }

    async fn seal(&self, lease_id: LeaseId) -> CacheResult<()> {
        self.peer.seal(lease_id).await
    }

    async fn discard(&self, lease_id: LeaseId) -> CacheResult<()> {
        self.peer.discard(lease_id).await
    }

    async fn release(&self, lease_id: LeaseId) -> CacheResult<()> {
        self.peer.release(lease_id).await
    }

    async fn stats(&self) -> CacheResult<PeerStats> {
        Ok(self.peer.stats().await)
    }
}
