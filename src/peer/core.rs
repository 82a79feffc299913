//! The peer core: object/lease state machine with LRU eviction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Acquired, Peer};
use crate::blob::Blob;
use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::lease::{LeaseStore, MemoryLeaseStore};
use crate::model::{
    AccessFlags, AcquireMeta, LeaseId, ObjectId, ObjectState, ObjectSummary, PeerStats, UserMeta,
};

/// Peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Backing directory for File and SharedFs blobs.
    pub data_dir: PathBuf,
    /// Maximum number of resident objects; 0 means unlimited.
    pub max_objects: usize,
    /// Maximum resident bytes; 0 means unlimited.
    pub max_bytes: u64,
    /// Evict sealed LRU objects when capacity is exceeded. Composite peers
    /// disable this on the hot tier so that demotion replaces eviction.
    pub evict_on_full: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::temp_dir().join("packice"),
            max_objects: 0,
            max_bytes: 0,
            evict_on_full: true,
        }
    }
}

impl PeerConfig {
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

struct ObjectInner {
    state: ObjectState,
    blobs: Vec<Arc<Blob>>,
    total_bytes: u64,
    user_meta: UserMeta,
    prev_objid: Option<ObjectId>,
    created_at: DateTime<Utc>,
    sealed_at: Option<DateTime<Utc>>,
    sealed_by: Option<LeaseId>,
    hold_count: u32,
    last_acquired: Instant,
    gone: bool,
}

struct ObjectEntry {
    objid: ObjectId,
    inner: Mutex<ObjectInner>,
}

impl ObjectEntry {
    fn summary(inner: &ObjectInner, objid: &ObjectId) -> ObjectSummary {
        ObjectSummary {
            objid: objid.clone(),
            state: inner.state,
            created_at: inner.created_at,
            sealed_at: inner.sealed_at,
            user_meta: inner.user_meta.clone(),
            prev_objid: inner.prev_objid.clone(),
        }
    }
}

/// A single peer: coordinates object lifecycles and leases on one node.
pub struct CachePeer {
    config: PeerConfig,
    objects: DashMap<ObjectId, Arc<ObjectEntry>>,
    leases: Arc<dyn LeaseStore>,
    bytes_in_use: AtomicU64,
    evictions: AtomicU64,
    expired_leases: AtomicU64,
    degraded: AtomicBool,
}

impl CachePeer {
    pub fn new(config: PeerConfig) -> Arc<Self> {
        Self::with_lease_store(config, Arc::new(MemoryLeaseStore::new()))
    }

    pub fn with_lease_store(config: PeerConfig, leases: Arc<dyn LeaseStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            objects: DashMap::new(),
            leases,
            bytes_in_use: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_leases: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// True once a fatal backend error has been observed. A degraded peer
    /// rejects new `Acquire` calls until restart.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn check_degraded(&self) -> CacheResult<()> {
        if self.is_degraded() {
            return Err(CacheError::with_message(
                ErrorKind::Internal,
                "peer is degraded; restart required",
            ));
        }
        Ok(())
    }

    /// Filesystem-safe name for an object's blob artifacts. Long ids are
    /// truncated and disambiguated by a hash so names stay under NAME_MAX.
    fn blob_name(objid: &ObjectId, index: usize) -> String {
        let mut encoded = utf8_percent_encode(objid.as_str(), NON_ALPHANUMERIC).to_string();
        if encoded.len() > 120 {
            let hash = objid
                .as_str()
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            encoded.truncate(96);
            encoded = format!("{}-{:016x}", encoded, hash);
        }
        if index == 0 {
            encoded
        } else {
            format!("{}-{}", encoded, index)
        }
    }

    /// Whether `add_bytes`/`add_objects` fit without any eviction.
    pub(crate) fn can_admit(&self, add_bytes: u64, add_objects: usize) -> bool {
        let fits_objects = self.config.max_objects == 0
            || self.objects.len() + add_objects <= self.config.max_objects;
        let fits_bytes = self.config.max_bytes == 0
            || self.bytes_in_use.load(Ordering::SeqCst) + add_bytes <= self.config.max_bytes;
        fits_objects && fits_bytes
    }

    /// Makes room for an allocation, evicting sealed LRU objects if the
    /// policy allows. Fails with `Full` when no candidate exists.
    fn ensure_capacity(&self, add_bytes: u64, add_objects: usize) -> CacheResult<()> {
        loop {
            if self.can_admit(add_bytes, add_objects) {
                return Ok(());
            }
            if !self.config.evict_on_full || !self.evict_one() {
                return Err(CacheError::new(ErrorKind::Full));
            }
        }
    }

    /// Sealed, unheld object with the oldest last-acquire time; ties broken
    /// by the lexicographically smaller objid.
    pub(crate) fn lru_sealed_candidate(&self) -> Option<ObjectId> {
        let mut best: Option<(Instant, ObjectId)> = None;
        for entry in self.objects.iter() {
            let inner = entry.inner.lock();
            if inner.state != ObjectState::Sealed || inner.hold_count > 0 || inner.gone {
                continue;
            }
            let key = (inner.last_acquired, entry.objid.clone());
            drop(inner);
            match &best {
                Some(current) if *current <= key => {}
                _ => best = Some(key),
            }
        }
        best.map(|(_, objid)| objid)
    }

    fn evict_one(&self) -> bool {
        let Some(objid) = self.lru_sealed_candidate() else {
            return false;
        };
        match self.remove_object(&objid) {
            Ok(()) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("evicted object {}", objid);
                true
            }
            Err(_) => false,
        }
    }

    /// Removes a sealed, unheld object and destroys its blobs. Used by the
    /// eviction policy and by tier movement.
    pub(crate) fn remove_object(&self, objid: &ObjectId) -> CacheResult<()> {
        let entry = self
            .objects
            .get(objid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CacheError::new(ErrorKind::NotFound))?;

        let (blobs, total_bytes) = {
            let mut inner = entry.inner.lock();
            if inner.state != ObjectState::Sealed {
                return Err(CacheError::new(ErrorKind::NotReady));
            }
            if inner.hold_count > 0 || inner.gone {
                return Err(CacheError::with_message(
                    ErrorKind::Forbidden,
                    "object is held",
                ));
            }
            inner.gone = true;
            (std::mem::take(&mut inner.blobs), inner.total_bytes)
        };

        self.objects.remove(objid);
        for blob in &blobs {
            blob.destroy();
        }
        self.bytes_in_use.fetch_sub(total_bytes, Ordering::SeqCst);
        Ok(())
    }

    /// The object's current state, if resident.
    pub fn state_of(&self, objid: &ObjectId) -> Option<ObjectState> {
        self.objects.get(objid).map(|e| e.inner.lock().state)
    }

    async fn acquire_create(
        &self,
        objid: ObjectId,
        flags: AccessFlags,
        meta: AcquireMeta,
        ttl: Option<Duration>,
    ) -> CacheResult<Acquired> {
        if meta.blob_specs.is_empty() {
            return Err(CacheError::with_message(
                ErrorKind::Validation,
                "CREATE requires at least one blob spec",
            ));
        }
        let total_bytes: u64 = meta.blob_specs.iter().map(|s| s.size).sum();

        self.ensure_capacity(total_bytes, 1)?;

        // Reserve the objid. The entry guard serializes CREATE per objid;
        // concurrent creates see Exists, concurrent reads see NotReady.
        let entry = Arc::new(ObjectEntry {
            objid: objid.clone(),
            inner: Mutex::new(ObjectInner {
                state: ObjectState::Creating,
                blobs: Vec::new(),
                total_bytes,
                user_meta: meta.user_meta.clone(),
                prev_objid: meta.prev_objid.clone(),
                created_at: Utc::now(),
                sealed_at: None,
                sealed_by: None,
                hold_count: 1,
                last_acquired: Instant::now(),
                gone: false,
            }),
        });
        match self.objects.entry(objid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CacheError::new(ErrorKind::Exists));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        // Blob allocation happens outside any lock; roll the reservation
        // back if it fails.
        let mut blobs = Vec::with_capacity(meta.blob_specs.len());
        for (index, spec) in meta.blob_specs.iter().enumerate() {
            let name = Self::blob_name(&objid, index);
            match Blob::allocate(*spec, &self.config.data_dir, &name) {
                Ok(blob) => blobs.push(Arc::new(blob)),
                Err(err) => {
                    self.objects.remove(&objid);
                    for blob in &blobs {
                        blob.destroy();
                    }
                    if err.kind == ErrorKind::Internal {
                        warn!("blob allocation failed, marking peer degraded: {}", err);
                        self.degraded.store(true, Ordering::SeqCst);
                    }
                    return Err(err);
                }
            }
        }

        let record = match self.leases.issue(objid.clone(), flags, ttl).await {
            Ok(record) => record,
            Err(err) => {
                self.objects.remove(&objid);
                for blob in &blobs {
                    blob.destroy();
                }
                return Err(err);
            }
        };

        let summary = {
            let mut inner = entry.inner.lock();
            inner.blobs = blobs.clone();
            ObjectEntry::summary(&inner, &objid)
        };
        self.bytes_in_use.fetch_add(total_bytes, Ordering::SeqCst);

        Ok(Acquired {
            lease: record.info(),
            object: summary,
            blobs,
        })
    }

    async fn acquire_read(
        &self,
        objid: ObjectId,
        flags: AccessFlags,
        ttl: Option<Duration>,
    ) -> CacheResult<Acquired> {
        let entry = self
            .objects
            .get(&objid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CacheError::new(ErrorKind::NotFound))?;

        let (summary, blobs) = {
            let mut inner = entry.inner.lock();
            if inner.gone {
                return Err(CacheError::new(ErrorKind::Gone));
            }
            if inner.state == ObjectState::Creating {
                return Err(CacheError::new(ErrorKind::NotReady));
            }
            inner.hold_count += 1;
            inner.last_acquired = Instant::now();
            (ObjectEntry::summary(&inner, &objid), inner.blobs.clone())
        };

        match self.leases.issue(objid, flags, ttl).await {
            Ok(record) => Ok(Acquired {
                lease: record.info(),
                object: summary,
                blobs,
            }),
            Err(err) => {
                entry.inner.lock().hold_count -= 1;
                Err(err)
            }
        }
    }

    /// Releases a lease record that has already been removed from the store.
    fn settle_released(&self, objid: &ObjectId, flags: AccessFlags) {
        let Some(entry) = self.objects.get(objid).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let destroy = {
            let mut inner = entry.inner.lock();
            inner.hold_count = inner.hold_count.saturating_sub(1);
            // An unsealed object whose creating lease goes away dies with it.
            inner.state == ObjectState::Creating && flags.create && !inner.gone
        };

        if destroy {
            let (blobs, total_bytes) = {
                let mut inner = entry.inner.lock();
                inner.gone = true;
                (std::mem::take(&mut inner.blobs), inner.total_bytes)
            };
            self.objects.remove(objid);
            for blob in &blobs {
                blob.destroy();
            }
            self.bytes_in_use.fetch_sub(total_bytes, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Peer for CachePeer {
    async fn acquire(
        &self,
        objid: ObjectId,
        flags: AccessFlags,
        meta: Option<AcquireMeta>,
        ttl: Option<Duration>,
    ) -> CacheResult<Acquired> {
        self.check_degraded()?;
        let flags = flags.normalized()?;

        if flags.create {
            let meta = meta.ok_or_else(|| {
                CacheError::with_message(ErrorKind::Validation, "CREATE requires blob specs")
            })?;
            self.acquire_create(objid, flags, meta, ttl).await
        } else if flags.read {
            self.acquire_read(objid, flags, ttl).await
        } else {
            Err(CacheError::with_message(
                ErrorKind::Validation,
                "acquire requires CREATE or READ",
            ))
        }
    }

    async fn seal(&self, lease_id: LeaseId) -> CacheResult<()> {
        let record = self.leases.lookup(lease_id).await?;
        let entry = self
            .objects
            .get(&record.objid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CacheError::new(ErrorKind::Gone))?;

        let seal_ts = Utc::now();
        let blobs = {
            let mut inner = entry.inner.lock();
            if inner.gone {
                return Err(CacheError::new(ErrorKind::Gone));
            }
            if inner.state == ObjectState::Sealed {
                // Repeating the call on the sealing lease is a no-op.
                if inner.sealed_by == Some(lease_id) {
                    return Ok(());
                }
                return Err(CacheError::new(ErrorKind::SealViolation));
            }
            if !record.flags.write {
                return Err(CacheError::new(ErrorKind::Forbidden));
            }
            inner.sealed_by = Some(lease_id);
            inner.sealed_at = Some(seal_ts);
            inner.blobs.clone()
        };

        // Flush and freeze the blobs without holding the object lock.
        for blob in &blobs {
            blob.seal(seal_ts)?;
        }

        entry.inner.lock().state = ObjectState::Sealed;

        // The sealer keeps reading on the same lease, now without WRITE.
        self.leases.convert_to_read(lease_id).await?;
        Ok(())
    }

    async fn discard(&self, lease_id: LeaseId) -> CacheResult<()> {
        let record = self.leases.lookup(lease_id).await?;
        if !record.flags.create && !record.flags.write {
            return Err(CacheError::new(ErrorKind::Forbidden));
        }

        let entry = self
            .objects
            .get(&record.objid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CacheError::new(ErrorKind::Gone))?;

        let (blobs, total_bytes) = {
            let mut inner = entry.inner.lock();
            if inner.state != ObjectState::Creating {
                return Err(CacheError::with_message(
                    ErrorKind::Forbidden,
                    "only CREATING objects can be discarded",
                ));
            }
            if inner.gone {
                return Err(CacheError::new(ErrorKind::Gone));
            }
            inner.gone = true;
            (std::mem::take(&mut inner.blobs), inner.total_bytes)
        };

        self.objects.remove(&record.objid);
        for blob in &blobs {
            blob.destroy();
        }
        self.bytes_in_use.fetch_sub(total_bytes, Ordering::SeqCst);
        self.leases.release(lease_id).await?;
        Ok(())
    }

    async fn release(&self, lease_id: LeaseId) -> CacheResult<()> {
        let record = self.leases.release(lease_id).await?;
        self.settle_released(&record.objid, record.flags);
        Ok(())
    }

    async fn sweep_expired(&self) -> u64 {
        let expired = self.leases.sweep_expired(Instant::now()).await;
        let mut reaped = 0u64;
        for lease_id in expired {
            match self.release(lease_id).await {
                Ok(()) => reaped += 1,
                // Raced with an explicit release; nothing to do.
                Err(err) if err.kind == ErrorKind::InvalidLease => {}
                Err(err) => debug!("sweep release of {} failed: {}", lease_id, err),
            }
        }
        if reaped > 0 {
            self.expired_leases.fetch_add(reaped, Ordering::Relaxed);
            debug!("swept {} expired leases", reaped);
        }
        reaped
    }

    async fn stats(&self) -> PeerStats {
        let mut sealed = 0u64;
        for entry in self.objects.iter() {
            if entry.inner.lock().state == ObjectState::Sealed {
                sealed += 1;
            }
        }
        PeerStats {
            objects: self.objects.len() as u64,
            sealed_objects: sealed,
            bytes_in_use: self.bytes_in_use.load(Ordering::SeqCst),
            live_leases: self.leases.live_count().await,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_leases: self.expired_leases.load(Ordering::Relaxed),
        }
    }
}
