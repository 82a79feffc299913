//! Soft-state directory of candidate object holders.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{ObjectId, PeerEndpoint};

/// Maps ObjectIds to peers believed to hold them. Entries are advisory:
/// any of them may be stale, and callers must tolerate misses.
///
/// The shipped implementation is process-local; a deployment-scale
/// resolver (e.g. a Redis set per object) plugs in behind this trait.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Candidate holders for `objid`, best first. May be empty.
    async fn lookup(&self, objid: &ObjectId) -> Vec<PeerEndpoint>;

    /// Advertises `endpoint` as a holder of `objid`.
    async fn register(&self, objid: &ObjectId, endpoint: &PeerEndpoint);

    /// Withdraws a stale advertisement.
    async fn unregister(&self, objid: &ObjectId, endpoint: &PeerEndpoint);
}

/// In-memory resolver.
pub struct MemoryResolver {
    entries: DashMap<ObjectId, Vec<PeerEndpoint>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for MemoryResolver {
    async fn lookup(&self, objid: &ObjectId) -> Vec<PeerEndpoint> {
        self.entries
            .get(objid)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    async fn register(&self, objid: &ObjectId, endpoint: &PeerEndpoint) {
        let mut entry = self.entries.entry(objid.clone()).or_default();
        if !entry.contains(endpoint) {
            entry.push(endpoint.clone());
        }
    }

    async fn unregister(&self, objid: &ObjectId, endpoint: &PeerEndpoint) {
        if let Some(mut entry) = self.entries.get_mut(objid) {
            entry.retain(|e| e != endpoint);
        }
        self.entries.remove_if(objid, |_, v| v.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objid(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let resolver = MemoryResolver::new();
        let id = objid("x");
        resolver.register(&id, &"memory://p1".to_string()).await;
        resolver.register(&id, &"memory://p2".to_string()).await;
        resolver.register(&id, &"memory://p1".to_string()).await;

        assert_eq!(
            resolver.lookup(&id).await,
            vec!["memory://p1".to_string(), "memory://p2".to_string()]
        );

        resolver.unregister(&id, &"memory://p1".to_string()).await;
        assert_eq!(resolver.lookup(&id).await, vec!["memory://p2".to_string()]);
    }

    #[tokio::test]
    async fn lookup_of_unknown_object_is_empty() {
        let resolver = MemoryResolver::new();
        assert!(resolver.lookup(&objid("nope")).await.is_empty());
    }
}
