//! HTTP adapter tests: wire format, status mapping, idempotency keys.

mod common;

use common::TestServer;
use serde_json::{json, Value};

use packice_rs::model::{AcquireMeta, BlobKind, BlobSpec, ObjectId};
use packice_rs::transport::wire::AcquireRequest;
use packice_rs::{HttpTransport, Transport};

fn file_meta(size: u64) -> AcquireMeta {
    AcquireMeta {
        blob_specs: vec![BlobSpec {
            kind: BlobKind::File,
            size,
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn create_write_seal_read_over_http() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.base_url).unwrap();
    let objid = ObjectId::new("h1").unwrap();

    let created = transport
        .acquire(AcquireRequest::create(&objid, &file_meta(11), None))
        .await
        .unwrap();
    // HTTP hands out path-style handles; the test shares the filesystem
    // with the server, so data-plane writes go straight to the path.
    created.blobs[0].write_at(0, b"hello world").unwrap();
    transport.seal(created.lease_id).await.unwrap();

    let reader = HttpTransport::new(&server.base_url).unwrap();
    let read = reader
        .acquire(AcquireRequest::read(&objid, None))
        .await
        .unwrap();
    assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"hello world");
}

#[tokio::test]
async fn acquire_response_shape_matches_wire_format() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/acquire", server.base_url))
        .json(&json!({
            "objid": "wire-1",
            "flags": ["CREATE"],
            "blob_specs": [{"kind": "File", "size": 4}],
            "meta": {"user": {"k": "dg=="}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert!(body["lease_id"].is_string());
    assert_eq!(body["object"]["objid"], "wire-1");
    assert_eq!(body["object"]["state"], "CREATING");
    assert_eq!(body["blobs"][0]["kind"], "File");
    assert_eq!(body["blobs"][0]["size"], 4);
    assert!(body["blobs"][0]["handle"].is_string());
}

#[tokio::test]
async fn error_kinds_map_to_statuses() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    // NotFound → 404
    let response = client
        .post(format!("{}/acquire", server.base_url))
        .json(&json!({"objid": "missing", "flags": ["READ"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "NotFound");

    // Exists → 409, NotReady → 423
    let create = json!({
        "objid": "taken",
        "flags": ["CREATE"],
        "blob_specs": [{"kind": "File", "size": 1}]
    });
    client
        .post(format!("{}/acquire", server.base_url))
        .json(&create)
        .send()
        .await
        .unwrap();
    let response = client
        .post(format!("{}/acquire", server.base_url))
        .json(&create)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let response = client
        .post(format!("{}/acquire", server.base_url))
        .json(&json!({"objid": "taken", "flags": ["READ"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 423);

    // Validation → 400
    let response = client
        .post(format!("{}/acquire", server.base_url))
        .json(&json!({"objid": "", "flags": ["READ"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn release_deduplicates_on_idempotency_key() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.base_url).unwrap();
    let objid = ObjectId::new("idem").unwrap();

    let created = transport
        .acquire(AcquireRequest::create(&objid, &file_meta(1), None))
        .await
        .unwrap();
    transport.seal(created.lease_id).await.unwrap();

    let client = reqwest::Client::new();
    let body = json!({"lease_id": created.lease_id.to_string()});

    let first = client
        .post(format!("{}/release", server.base_url))
        .header("idempotency-key", "key-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    // Same key replays the original success even though the lease is gone.
    let replay = client
        .post(format!("{}/release", server.base_url))
        .header("idempotency-key", "key-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 200);

    // A fresh key sees the real state of the world.
    let fresh = client
        .post(format!("{}/release", server.base_url))
        .header("idempotency-key", "key-2")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(fresh.status(), 404);
}

#[tokio::test]
async fn stats_endpoint_reports_objects() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.base_url).unwrap();
    let objid = ObjectId::new("stat-1").unwrap();

    let created = transport
        .acquire(AcquireRequest::create(&objid, &file_meta(2), None))
        .await
        .unwrap();
    transport.seal(created.lease_id).await.unwrap();

    let stats = transport.stats().await.unwrap();
    assert_eq!(stats.objects, 1);
    assert_eq!(stats.sealed_objects, 1);
    assert_eq!(stats.live_leases, 1);
}

#[tokio::test]
async fn mem_blob_over_http_has_no_handle() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/acquire", server.base_url))
        .json(&json!({
            "objid": "mem-http",
            "flags": ["CREATE"],
            "blob_specs": [{"kind": "Mem", "size": 4}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["blobs"][0]["handle"].is_null());
    assert!(body["blobs"][0]["fd_index"].is_null());
}
