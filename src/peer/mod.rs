//! Peers: the control plane for objects and leases.

mod core;
mod registry;
mod sweeper;
mod tiered;

pub use self::core::{CachePeer, PeerConfig};
pub use registry::{global_peer, named_peer};
pub use sweeper::{LeaseSweeper, DEFAULT_SWEEP_INTERVAL};
pub use tiered::{TieredConfig, TieredPeer};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::blob::Blob;
use crate::error::CacheResult;
use crate::model::{AccessFlags, AcquireMeta, LeaseId, LeaseInfo, ObjectId, ObjectSummary, PeerStats};

/// Result of a successful `Acquire`: the lease, an object snapshot, and the
/// blob handles for direct data-plane I/O.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub lease: LeaseInfo,
    pub object: ObjectSummary,
    pub blobs: Vec<Arc<Blob>>,
}

/// The single-peer contract. Implemented by [`CachePeer`] and preserved by
/// composite peers such as [`TieredPeer`].
#[async_trait]
pub trait Peer: Send + Sync {
    /// Obtains a lease (and blob handles) for an object.
    ///
    /// With CREATE the object must not exist and `meta.blob_specs` describes
    /// the blobs to allocate. With READ the object must exist and be sealed.
    /// A `ttl` of `None` means the lease lives until explicit release.
    async fn acquire(
        &self,
        objid: ObjectId,
        flags: AccessFlags,
        meta: Option<AcquireMeta>,
        ttl: Option<Duration>,
    ) -> CacheResult<Acquired>;

    /// Freezes the object: flushes blobs, transitions CREATING → SEALED and
    /// converts the sealing lease to READ. Idempotent on the sealing lease.
    async fn seal(&self, lease_id: LeaseId) -> CacheResult<()>;

    /// Destroys an unsealed object and releases its lease.
    async fn discard(&self, lease_id: LeaseId) -> CacheResult<()>;

    /// Relinquishes a lease, decrementing the object's hold count.
    async fn release(&self, lease_id: LeaseId) -> CacheResult<()>;

    /// Drains expired leases through the release path. Returns how many
    /// leases were reaped.
    async fn sweep_expired(&self) -> u64;

    /// Point-in-time counters.
    async fn stats(&self) -> PeerStats;
}
