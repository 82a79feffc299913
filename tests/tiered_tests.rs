//! Tiered peer tests: demotion under pressure, promotion on read.

mod common;

use std::sync::Arc;
use std::time::Duration;

use packice_rs::model::{AccessFlags, AcquireMeta, BlobKind, BlobSpec, ObjectId, ObjectState};
use packice_rs::{CachePeer, ErrorKind, Peer, PeerConfig, TieredConfig, TieredPeer};

fn objid(s: &str) -> ObjectId {
    ObjectId::new(s).unwrap()
}

fn mem_meta(size: u64) -> AcquireMeta {
    AcquireMeta {
        blob_specs: vec![BlobSpec {
            kind: BlobKind::Mem,
            size,
        }],
        ..Default::default()
    }
}

struct Tiers {
    tiered: Arc<TieredPeer>,
    hot: Arc<CachePeer>,
    cold: Arc<CachePeer>,
    _dir: tempfile::TempDir,
}

fn tiered_peer(hot_max_objects: usize, config: TieredConfig) -> Tiers {
    let dir = tempfile::tempdir().unwrap();
    let hot = CachePeer::new(PeerConfig {
        data_dir: dir.path().join("hot"),
        max_objects: hot_max_objects,
        max_bytes: 0,
        evict_on_full: false,
    });
    let cold = CachePeer::new(PeerConfig::in_dir(dir.path().join("cold")));
    let tiered = TieredPeer::new(hot.clone(), cold.clone(), config);
    Tiers {
        tiered,
        hot,
        cold,
        _dir: dir,
    }
}

async fn create_sealed(peer: &dyn Peer, id: &ObjectId, payload: &[u8]) {
    let created = peer
        .acquire(
            id.clone(),
            AccessFlags::CREATE,
            Some(mem_meta(payload.len() as u64)),
            None,
        )
        .await
        .unwrap();
    created.blobs[0].write_at(0, payload).unwrap();
    peer.seal(created.lease.id).await.unwrap();
    peer.release(created.lease.id).await.unwrap();
}

#[tokio::test]
async fn hot_pressure_demotes_lru_object_to_cold() {
    let tiers = tiered_peer(
        1,
        TieredConfig {
            promote_on_read: false,
            ..TieredConfig::default()
        },
    );

    create_sealed(tiers.tiered.as_ref(), &objid("a"), b"alpha").await;
    // Hot is full; creating "b" must push "a" down instead of failing.
    create_sealed(tiers.tiered.as_ref(), &objid("b"), b"bravo").await;

    assert_eq!(tiers.hot.state_of(&objid("b")), Some(ObjectState::Sealed));
    assert_eq!(tiers.cold.state_of(&objid("a")), Some(ObjectState::Sealed));
    assert_eq!(tiers.hot.state_of(&objid("a")), None);

    // Both objects stay readable through the composite.
    let a = tiers
        .tiered
        .acquire(objid("a"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert_eq!(a.blobs[0].read_all().unwrap().as_ref(), b"alpha");
    let b = tiers
        .tiered
        .acquire(objid("b"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert_eq!(b.blobs[0].read_all().unwrap().as_ref(), b"bravo");
}

#[tokio::test]
async fn demoted_object_keeps_metadata() {
    let tiers = tiered_peer(
        1,
        TieredConfig {
            promote_on_read: false,
            ..TieredConfig::default()
        },
    );

    let mut meta = mem_meta(3);
    meta.user_meta.insert("tag".to_string(), b"kept".to_vec());
    meta.prev_objid = Some(objid("parent"));
    let created = tiers
        .tiered
        .acquire(objid("m"), AccessFlags::CREATE, Some(meta), None)
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"mmm").unwrap();
    tiers.tiered.seal(created.lease.id).await.unwrap();
    tiers.tiered.release(created.lease.id).await.unwrap();

    create_sealed(tiers.tiered.as_ref(), &objid("n"), b"nnn").await;

    let read = tiers
        .tiered
        .acquire(objid("m"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert_eq!(read.object.user_meta.get("tag").unwrap(), b"kept");
    assert_eq!(read.object.prev_objid, Some(objid("parent")));
}

#[tokio::test]
async fn read_promotes_cold_object_into_hot() {
    let tiers = tiered_peer(4, TieredConfig::default());

    // Seed the cold tier directly.
    let created = tiers
        .cold
        .acquire(
            objid("c"),
            AccessFlags::CREATE,
            Some(AcquireMeta {
                blob_specs: vec![BlobSpec {
                    kind: BlobKind::File,
                    size: 4,
                }],
                ..Default::default()
            }),
            None,
        )
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"cold").unwrap();
    tiers.cold.seal(created.lease.id).await.unwrap();
    tiers.cold.release(created.lease.id).await.unwrap();

    // The read is served from cold and promotion runs behind it.
    let read = tiers
        .tiered
        .acquire(objid("c"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"cold");
    tiers.tiered.release(read.lease.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tiers.hot.state_of(&objid("c")), Some(ObjectState::Sealed));

    let again = tiers
        .tiered
        .acquire(objid("c"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert_eq!(again.blobs[0].read_all().unwrap().as_ref(), b"cold");
}

#[tokio::test]
async fn oversized_objects_are_not_promoted() {
    let tiers = tiered_peer(
        4,
        TieredConfig {
            promote_threshold: 2,
            ..TieredConfig::default()
        },
    );

    let created = tiers
        .cold
        .acquire(
            objid("big"),
            AccessFlags::CREATE,
            Some(AcquireMeta {
                blob_specs: vec![BlobSpec {
                    kind: BlobKind::File,
                    size: 8,
                }],
                ..Default::default()
            }),
            None,
        )
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"too-long").unwrap();
    tiers.cold.seal(created.lease.id).await.unwrap();
    tiers.cold.release(created.lease.id).await.unwrap();

    let read = tiers
        .tiered
        .acquire(objid("big"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    tiers.tiered.release(read.lease.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tiers.hot.state_of(&objid("big")), None);
}

#[tokio::test]
async fn discard_on_tiered_restores_hot_capacity() {
    let tiers = tiered_peer(
        1,
        TieredConfig {
            promote_on_read: false,
            ..TieredConfig::default()
        },
    );

    let created = tiers
        .tiered
        .acquire(objid("d"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"pa").unwrap();
    tiers.tiered.discard(created.lease.id).await.unwrap();

    let err = tiers
        .tiered
        .acquire(objid("d"), AccessFlags::READ, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    // No demotion should be needed for the next create.
    create_sealed(tiers.tiered.as_ref(), &objid("e"), b"ee").await;
    assert_eq!(tiers.cold.stats().await.objects, 0);
}

#[tokio::test]
async fn hot_full_of_held_objects_fails_with_full() {
    let tiers = tiered_peer(
        1,
        TieredConfig {
            promote_on_read: false,
            ..TieredConfig::default()
        },
    );

    // Keep the creating lease so "a" stays held and cannot demote.
    let held = tiers
        .tiered
        .acquire(objid("a"), AccessFlags::CREATE, Some(mem_meta(2)), None)
        .await
        .unwrap();
    held.blobs[0].write_at(0, b"aa").unwrap();
    tiers.tiered.seal(held.lease.id).await.unwrap();

    let err = tiers
        .tiered
        .acquire(objid("b"), AccessFlags::CREATE, Some(mem_meta(2)), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Full);
}
