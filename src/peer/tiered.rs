//! Composite tiered peer: a hot peer layered over a cold peer.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::core::CachePeer;
use super::{Acquired, Peer};
use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::fetch::copy_into_local;
use crate::model::{AccessFlags, AcquireMeta, BlobKind, LeaseId, ObjectId, PeerStats};
use crate::transport::DirectTransport;

/// Tier movement policy.
#[derive(Debug, Clone)]
pub struct TieredConfig {
    /// How many demote-then-retry rounds a hot CREATE gets before `Full`.
    pub demote_retries: u32,
    /// Promote cold objects toward the hot tier on read.
    pub promote_on_read: bool,
    /// Only objects at or below this size are promoted.
    pub promote_threshold: u64,
    /// Backend kind used when an object moves into the hot tier.
    pub hot_kind: BlobKind,
    /// Backend kind used when an object moves into the cold tier.
    pub cold_kind: BlobKind,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            demote_retries: 3,
            promote_on_read: true,
            promote_threshold: 1024 * 1024,
            hot_kind: BlobKind::Mem,
            cold_kind: BlobKind::File,
        }
    }
}

/// A peer that serves hot objects from one tier and spills to another,
/// preserving the single-peer contract.
///
/// Every ObjectId lives in at most one tier, except transiently while a
/// copy is in flight; the destination side of a copy is CREATING and so
/// invisible to outside readers.
pub struct TieredPeer {
    hot: Arc<CachePeer>,
    cold: Arc<CachePeer>,
    config: TieredConfig,
    promoting: Arc<DashSet<ObjectId>>,
}

impl TieredPeer {
    /// Composes `hot` over `cold`. The hot tier's evict-on-full policy is
    /// expected to be disabled so that `Full` reaches the demotion path
    /// instead of silently destroying objects.
    pub fn new(hot: Arc<CachePeer>, cold: Arc<CachePeer>, config: TieredConfig) -> Arc<Self> {
        Arc::new(Self {
            hot,
            cold,
            config,
            promoting: Arc::new(DashSet::new()),
        })
    }

    pub fn hot(&self) -> &Arc<CachePeer> {
        &self.hot
    }

    pub fn cold(&self) -> &Arc<CachePeer> {
        &self.cold
    }

    /// Moves the LRU-eligible sealed hot object down to the cold tier.
    async fn demote_one(&self) -> CacheResult<()> {
        let objid = self
            .hot
            .lru_sealed_candidate()
            .ok_or_else(|| CacheError::new(ErrorKind::Full))?;
        debug!("demoting {} to cold tier", objid);

        let src = DirectTransport::new(self.hot.clone());
        match copy_into_local(
            self.cold.as_ref(),
            &src,
            objid.clone(),
            Some(self.config.cold_kind),
        )
        .await
        {
            Ok(copied) => {
                // The copy lease only existed to move bytes.
                self.cold.release(copied.lease.id).await?;
            }
            // A stale cold copy (left behind by a held promotion) already
            // carries the bytes; dropping the hot copy is all that is left.
            Err(err) if err.kind == ErrorKind::Exists => {}
            Err(err) => return Err(err),
        }
        if let Err(err) = self.hot.remove_object(&objid) {
            // A reader slipped in mid-demotion; the next retry picks
            // another candidate.
            debug!("hot copy of {} retained after demotion: {}", objid, err);
        }
        Ok(())
    }

    /// Copies a cold object up to the hot tier in the background. Never
    /// blocks the reader that triggered it.
    fn spawn_promotion(&self, objid: ObjectId, total_bytes: u64) {
        if !self.config.promote_on_read
            || total_bytes > self.config.promote_threshold
            || !self.hot.can_admit(total_bytes, 1)
            || !self.promoting.insert(objid.clone())
        {
            return;
        }

        let hot = self.hot.clone();
        let cold = self.cold.clone();
        let hot_kind = self.config.hot_kind;
        let promoting = self.promoting.clone();
        tokio::spawn(async move {
            let src = DirectTransport::new(cold.clone());
            match copy_into_local(hot.as_ref(), &src, objid.clone(), Some(hot_kind)).await {
                Ok(copied) => {
                    if let Err(err) = hot.release(copied.lease.id).await {
                        debug!("promotion lease release failed: {}", err);
                    }
                    // Readers may still hold the cold copy; if so it stays
                    // behind and ages out, while new reads hit hot first.
                    if let Err(err) = cold.remove_object(&objid) {
                        debug!("cold copy of {} retained: {}", objid, err);
                    }
                }
                Err(err) => warn!("promotion of {} failed: {}", objid, err),
            }
            promoting.remove(&objid);
        });
    }
}

#[async_trait]
impl Peer for TieredPeer {
    async fn acquire(
        &self,
        objid: ObjectId,
        flags: AccessFlags,
        meta: Option<AcquireMeta>,
        ttl: Option<Duration>,
    ) -> CacheResult<Acquired> {
        let flags = flags.normalized()?;

        if flags.create {
            let mut attempt = 0;
            loop {
                match self
                    .hot
                    .acquire(objid.clone(), flags, meta.clone(), ttl)
                    .await
                {
                    Err(err) if err.kind == ErrorKind::Full && attempt < self.config.demote_retries => {
                        attempt += 1;
                        self.demote_one().await?;
                    }
                    other => return other,
                }
            }
        } else {
            match self.hot.acquire(objid.clone(), flags, None, ttl).await {
                Err(err) if err.kind == ErrorKind::NotFound => {
                    let acquired = self.cold.acquire(objid.clone(), flags, None, ttl).await?;
                    let total: u64 = acquired.blobs.iter().map(|b| b.size()).sum();
                    self.spawn_promotion(objid, total);
                    Ok(acquired)
                }
                other => other,
            }
        }
    }

    async fn seal(&self, lease_id: LeaseId) -> CacheResult<()> {
        match self.hot.seal(lease_id).await {
            Err(err) if err.kind == ErrorKind::InvalidLease => self.cold.seal(lease_id).await,
            other => other,
        }
    }

    async fn discard(&self, lease_id: LeaseId) -> CacheResult<()> {
        match self.hot.discard(lease_id).await {
            Err(err) if err.kind == ErrorKind::InvalidLease => self.cold.discard(lease_id).await,
            other => other,
        }
    }

    async fn release(&self, lease_id: LeaseId) -> CacheResult<()> {
        match self.hot.release(lease_id).await {
            Err(err) if err.kind == ErrorKind::InvalidLease => self.cold.release(lease_id).await,
            other => other,
        }
    }

    async fn sweep_expired(&self) -> u64 {
        self.hot.sweep_expired().await + self.cold.sweep_expired().await
    }

    async fn stats(&self) -> PeerStats {
        let hot = self.hot.stats().await;
        let cold = self.cold.stats().await;
        PeerStats {
            objects: hot.objects + cold.objects,
            sealed_objects: hot.sealed_objects + cold.sealed_objects,
            bytes_in_use: hot.bytes_in_use + cold.bytes_in_use,
            live_leases: hot.live_leases + cold.live_leases,
            evictions: hot.evictions + cold.evictions,
            expired_leases: hot.expired_leases + cold.expired_leases,
        }
    }
}
