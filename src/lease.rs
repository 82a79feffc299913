//! Lease store: the sole source of truth for lease validity.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::model::{AccessFlags, LeaseId, LeaseInfo, ObjectId};

/// Lower bound for lease TTLs.
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(1);

/// A lease record as held by the store.
///
/// TTL comparisons use the monotonic `deadline`; the wall-clock
/// `expires_at` exists only for observability.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub id: LeaseId,
    pub objid: ObjectId,
    pub flags: AccessFlags,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deadline: Option<Instant>,
}

impl LeaseRecord {
    pub fn expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    pub fn info(&self) -> LeaseInfo {
        LeaseInfo {
            id: self.id,
            objid: self.objid.clone(),
            flags: self.flags,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }
}

/// Persistence and TTL enforcement for leases.
///
/// Implementations may be process-local or backed by an external store
/// (e.g. Redis) for distributed lease state.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Mints a new lease. A `ttl` of `None` means explicit-release-only.
    async fn issue(
        &self,
        objid: ObjectId,
        flags: AccessFlags,
        ttl: Option<Duration>,
    ) -> CacheResult<LeaseRecord>;

    /// Returns the lease if it exists and has not expired.
    async fn lookup(&self, id: LeaseId) -> CacheResult<LeaseRecord>;

    /// Removes the lease and returns its final record. Works on expired
    /// leases too, so the sweeper can drain them through the release path.
    async fn release(&self, id: LeaseId) -> CacheResult<LeaseRecord>;

    /// Rewrites a lease's flags to READ-only, keeping its expiry.
    async fn convert_to_read(&self, id: LeaseId) -> CacheResult<()>;

    /// Lists leases whose deadline has passed as of `now`.
    async fn sweep_expired(&self, now: Instant) -> Vec<LeaseId>;

    /// Number of live (unexpired) leases.
    async fn live_count(&self) -> u64;
}

/// In-memory lease store.
pub struct MemoryLeaseStore {
    leases: DashMap<LeaseId, LeaseRecord>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            leases: DashMap::new(),
        }
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn issue(
        &self,
        objid: ObjectId,
        flags: AccessFlags,
        ttl: Option<Duration>,
    ) -> CacheResult<LeaseRecord> {
        if let Some(ttl) = ttl {
            if ttl < MIN_LEASE_TTL {
                return Err(CacheError::with_message(
                    ErrorKind::Validation,
                    format!("ttl below minimum of {:?}", MIN_LEASE_TTL),
                ));
            }
        }

        let now_wall = Utc::now();
        let record = LeaseRecord {
            id: LeaseId::mint(),
            objid,
            flags,
            issued_at: now_wall,
            expires_at: ttl.and_then(|t| {
                ChronoDuration::from_std(t)
                    .ok()
                    .map(|d| now_wall + d)
            }),
            deadline: ttl.map(|t| Instant::now() + t),
        };
        self.leases.insert(record.id, record.clone());
        Ok(record)
    }

    async fn lookup(&self, id: LeaseId) -> CacheResult<LeaseRecord> {
        let record = self
            .leases
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| CacheError::new(ErrorKind::InvalidLease))?;
        if record.expired(Instant::now()) {
            return Err(CacheError::new(ErrorKind::InvalidLease));
        }
        Ok(record)
    }

    async fn release(&self, id: LeaseId) -> CacheResult<LeaseRecord> {
        self.leases
            .remove(&id)
            .map(|(_, record)| record)
            .ok_or_else(|| CacheError::new(ErrorKind::InvalidLease))
    }

    async fn convert_to_read(&self, id: LeaseId) -> CacheResult<()> {
        let mut record = self
            .leases
            .get_mut(&id)
            .ok_or_else(|| CacheError::new(ErrorKind::InvalidLease))?;
        record.flags = AccessFlags::READ;
        Ok(())
    }

    async fn sweep_expired(&self, now: Instant) -> Vec<LeaseId> {
        self.leases
            .iter()
            .filter(|entry| entry.expired(now))
            .map(|entry| entry.id)
            .collect()
    }

    async fn live_count(&self) -> u64 {
        let now = Instant::now();
        self.leases.iter().filter(|e| !e.expired(now)).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objid(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    #[tokio::test]
    async fn issue_and_lookup() {
        let store = MemoryLeaseStore::new();
        let record = store
            .issue(objid("a"), AccessFlags::READ, None)
            .await
            .unwrap();
        let found = store.lookup(record.id).await.unwrap();
        assert_eq!(found.objid, objid("a"));
        assert!(found.expires_at.is_none());
    }

    #[tokio::test]
    async fn ttl_below_floor_is_rejected() {
        let store = MemoryLeaseStore::new();
        let err = store
            .issue(objid("a"), AccessFlags::READ, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn expired_lease_fails_lookup_but_sweeps() {
        let store = MemoryLeaseStore::new();
        let record = store
            .issue(objid("a"), AccessFlags::READ, Some(Duration::from_secs(1)))
            .await
            .unwrap();

        // Simulate the deadline passing.
        let later = Instant::now() + Duration::from_secs(2);
        assert!(record.expired(later));
        let swept = store.sweep_expired(later).await;
        assert_eq!(swept, vec![record.id]);

        // Release drains it through the normal path.
        store.release(record.id).await.unwrap();
        assert!(store.release(record.id).await.is_err());
    }

    #[tokio::test]
    async fn convert_to_read_drops_write() {
        let store = MemoryLeaseStore::new();
        let record = store
            .issue(objid("a"), AccessFlags::CREATE, None)
            .await
            .unwrap();
        store.convert_to_read(record.id).await.unwrap();
        let found = store.lookup(record.id).await.unwrap();
        assert!(found.flags.read && !found.flags.write && !found.flags.create);
    }
}
