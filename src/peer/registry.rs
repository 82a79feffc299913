//! Process-global peer registry backing `memory://<name>` URIs.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

use super::core::{CachePeer, PeerConfig};
use super::Peer;

static REGISTRY: OnceLock<DashMap<String, Arc<dyn Peer>>> = OnceLock::new();

fn registry() -> &'static DashMap<String, Arc<dyn Peer>> {
    REGISTRY.get_or_init(DashMap::new)
}

/// Returns the peer registered under `name`, creating it on first access.
///
/// Peers created here use a per-name scratch directory under the system
/// temp dir and unlimited capacity; a server that wants limits (or a
/// tiered composite) registers its own peer via [`named_peer`], which is
/// what `PeerServer` does when it is given a registry name.
pub fn global_peer(name: &str) -> Arc<dyn Peer> {
    let entry = registry().entry(name.to_string()).or_insert_with(|| {
        let data_dir = std::env::temp_dir().join("packice").join(name);
        CachePeer::new(PeerConfig::in_dir(data_dir))
    });
    Arc::clone(entry.value())
}

/// Registers `peer` under `name`, replacing any previous registration, and
/// returns the peer that is now registered.
pub fn named_peer(name: &str, peer: Arc<dyn Peer>) -> Arc<dyn Peer> {
    registry().insert(name.to_string(), peer.clone());
    peer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_yields_same_peer() {
        let a = global_peer("registry-test-a");
        let b = global_peer("registry-test-a");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_names_yield_distinct_peers() {
        let a = global_peer("registry-test-b");
        let b = global_peer("registry-test-c");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn named_peer_overrides_default_construction() {
        let dir = tempfile::tempdir().unwrap();
        let bounded = CachePeer::new(PeerConfig {
            max_objects: 1,
            ..PeerConfig::in_dir(dir.path())
        });
        let registered = named_peer("registry-test-d", bounded);
        let resolved = global_peer("registry-test-d");
        assert!(Arc::ptr_eq(&registered, &resolved));
    }
}
