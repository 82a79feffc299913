//! Peer state machine tests over the in-process API.

mod common;

use std::time::Duration;

use common::{bounded_peer, scratch_peer};
use packice_rs::model::{AccessFlags, AcquireMeta, BlobKind, BlobSpec, ObjectId};
use packice_rs::transport::wire::AcquireRequest;
use packice_rs::{connect, ErrorKind, Peer, PeerServerBuilder};

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

#[tokio::test]
async fn write_seal_read_round_trip_in_process() {
    let transport = connect("").await.unwrap();

    let meta = mem_meta(11);
    let created = transport
        .acquire(AcquireRequest::create(&objid("k1"), &meta, None))
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"hello world").unwrap();
    transport.seal(created.lease_id).await.unwrap();

    let read = transport
        .acquire(AcquireRequest::read(&objid("k1"), None))
        .await
        .unwrap();
    assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"hello world");
}

#[tokio::test]
async fn create_on_known_objid_is_exists() {
    let (peer, _dir) = scratch_peer();
    peer.acquire(objid("dup"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    let err = peer
        .acquire(objid("dup"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Exists);
}

#[tokio::test]
async fn read_before_seal_is_not_ready() {
    let (peer, _dir) = scratch_peer();
    peer.acquire(objid("wip"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    let err = peer
        .acquire(objid("wip"), AccessFlags::READ, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotReady);
}

#[tokio::test]
async fn read_of_unknown_objid_is_not_found() {
    let (peer, _dir) = scratch_peer();
    let err = peer
        .acquire(objid("ghost"), AccessFlags::READ, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn seal_is_idempotent_on_the_sealing_lease() {
    let (peer, _dir) = scratch_peer();
    let created = peer
        .acquire(objid("twice"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"data").unwrap();
    peer.seal(created.lease.id).await.unwrap();
    peer.seal(created.lease.id).await.unwrap();

    // The sealer keeps reading on the converted lease.
    assert_eq!(created.blobs[0].read_all().unwrap().as_ref(), b"data");
}

#[tokio::test]
async fn sealer_lease_loses_write() {
    let (peer, _dir) = scratch_peer();
    let created = peer
        .acquire(objid("frozen"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    peer.seal(created.lease.id).await.unwrap();
    let err = created.blobs[0].write_at(0, b"nope").unwrap_err();
    assert_eq!(err.kind, ErrorKind::SealViolation);
}

#[tokio::test]
async fn release_twice_is_invalid_lease() {
    let (peer, _dir) = scratch_peer();
    let created = peer
        .acquire(objid("rel"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    peer.seal(created.lease.id).await.unwrap();
    peer.release(created.lease.id).await.unwrap();
    let err = peer.release(created.lease.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidLease);
}

#[tokio::test]
async fn releasing_sole_create_lease_destroys_unsealed_object() {
    let (peer, _dir) = scratch_peer();
    let created = peer
        .acquire(objid("doomed"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    peer.release(created.lease.id).await.unwrap();

    let err = peer
        .acquire(objid("doomed"), AccessFlags::READ, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn discard_rolls_back_creation() {
    let (peer, _dir) = bounded_peer(1);
    let created = peer
        .acquire(objid("d"), AccessFlags::CREATE, Some(mem_meta(8)), None)
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"part").unwrap();
    peer.discard(created.lease.id).await.unwrap();

    let err = peer
        .acquire(objid("d"), AccessFlags::READ, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    // Capacity is back to the pre-create state.
    let replacement = peer
        .acquire(objid("d2"), AccessFlags::CREATE, Some(mem_meta(8)), None)
        .await
        .unwrap();
    assert_eq!(replacement.object.objid, objid("d2"));
}

#[tokio::test]
async fn discard_of_sealed_object_is_forbidden() {
    let (peer, _dir) = scratch_peer();
    let created = peer
        .acquire(objid("sealed"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    peer.seal(created.lease.id).await.unwrap();
    let err = peer.discard(created.lease.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Forbidden);
}

#[tokio::test]
async fn eviction_never_touches_held_objects() {
    let (peer, _dir) = bounded_peer(1);
    let held = peer
        .acquire(objid("a"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    peer.seal(held.lease.id).await.unwrap();

    // "a" is sealed but still held; there is no eviction candidate.
    let err = peer
        .acquire(objid("b"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Full);

    // Dropping the hold opens the slot.
    peer.release(held.lease.id).await.unwrap();
    peer.acquire(objid("b"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    let err = peer
        .acquire(objid("a"), AccessFlags::READ, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn expired_lease_is_swept_and_hold_released() {
    let (peer, _dir) = scratch_peer();
    let created = peer
        .acquire(objid("ttl"), AccessFlags::CREATE, Some(mem_meta(4)), None)
        .await
        .unwrap();
    peer.seal(created.lease.id).await.unwrap();
    peer.release(created.lease.id).await.unwrap();

    let read = peer
        .acquire(
            objid("ttl"),
            AccessFlags::READ,
            None,
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(peer.stats().await.live_leases, 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let reaped = peer.sweep_expired().await;
    assert_eq!(reaped, 1);
    assert_eq!(peer.stats().await.live_leases, 0);

    let err = peer.release(read.lease.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidLease);
}

#[tokio::test]
async fn zero_size_blob_round_trips_empty() {
    let (peer, _dir) = scratch_peer();
    let created = peer
        .acquire(objid("empty"), AccessFlags::CREATE, Some(mem_meta(0)), None)
        .await
        .unwrap();
    peer.seal(created.lease.id).await.unwrap();

    let read = peer
        .acquire(objid("empty"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert!(read.blobs[0].read_all().unwrap().is_empty());
}

#[tokio::test]
async fn shared_fs_blob_round_trips_through_peer() {
    let (peer, _dir) = scratch_peer();
    let meta = AcquireMeta {
        blob_specs: vec![BlobSpec {
            kind: BlobKind::SharedFs,
            size: 5,
        }],
        ..Default::default()
    };
    let created = peer
        .acquire(objid("shared"), AccessFlags::CREATE, Some(meta), None)
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"bytes").unwrap();
    peer.seal(created.lease.id).await.unwrap();

    let read = peer
        .acquire(objid("shared"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"bytes");
}

#[tokio::test]
async fn concurrent_distinct_objects_do_not_interfere() {
    let (peer, _dir) = scratch_peer();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let peer = peer.clone();
        tasks.push(tokio::spawn(async move {
            let id = ObjectId::new(format!("obj-{}", i)).unwrap();
            let payload = format!("payload-{}", i);
            let created = peer
                .acquire(
                    id.clone(),
                    AccessFlags::CREATE,
                    Some(AcquireMeta {
                        blob_specs: vec![BlobSpec {
                            kind: BlobKind::Mem,
                            size: payload.len() as u64,
                        }],
                        ..Default::default()
                    }),
                    None,
                )
                .await
                .unwrap();
            created.blobs[0].write_at(0, payload.as_bytes()).unwrap();
            peer.seal(created.lease.id).await.unwrap();
            peer.release(created.lease.id).await.unwrap();

            let read = peer
                .acquire(id, AccessFlags::READ, None, None)
                .await
                .unwrap();
            assert_eq!(read.blobs[0].read_all().unwrap(), payload.as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(peer.stats().await.objects, 16);
}

#[tokio::test]
async fn named_server_peer_is_reachable_via_memory_uri() {
    let (peer, _dir) = bounded_peer(1);
    let _server = PeerServerBuilder::new()
        .name("limited-svc")
        .peer(peer.clone())
        .build();

    // memory:// attaches to the registered peer, capacity limits included.
    let transport = connect("memory://limited-svc").await.unwrap();
    let created = transport
        .acquire(AcquireRequest::create(&objid("m1"), &mem_meta(2), None))
        .await
        .unwrap();
    created.blobs[0].write_at(0, b"m1").unwrap();
    transport.seal(created.lease_id).await.unwrap();

    // The creator still holds its lease, so the single slot is pinned.
    let err = transport
        .acquire(AcquireRequest::create(&objid("m2"), &mem_meta(2), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Full);

    assert_eq!(peer.stats().await.objects, 1);
}

#[tokio::test]
async fn user_metadata_survives_seal() {
    let (peer, _dir) = scratch_peer();
    let mut meta = mem_meta(4);
    meta.user_meta
        .insert("codec".to_string(), b"raw".to_vec());
    meta.prev_objid = Some(objid("ancestor"));

    let created = peer
        .acquire(objid("tagged"), AccessFlags::CREATE, Some(meta), None)
        .await
        .unwrap();
    peer.seal(created.lease.id).await.unwrap();

    let read = peer
        .acquire(objid("tagged"), AccessFlags::READ, None, None)
        .await
        .unwrap();
    assert_eq!(read.object.user_meta.get("codec").unwrap(), b"raw");
    assert_eq!(read.object.prev_objid, Some(objid("ancestor")));
}
