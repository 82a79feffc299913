//! packice-rs: a peer-to-peer object cache.
//!
//! Control-plane coordination (leases, object lifecycles, liveness) is
//! decoupled from data-plane I/O: clients acquire a lease from a peer,
//! receive blob handles, and move bytes directly against the backing
//! store. Sealed objects are immutable and safe to read concurrently.
//!
//! # Example
//!
//! ```no_run
//! use packice_rs::{connect, transport::wire::AcquireRequest};
//! use packice_rs::model::{AcquireMeta, BlobKind, BlobSpec, ObjectId};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = connect("").await.unwrap();
//!     let objid = ObjectId::new("k1").unwrap();
//!     let meta = AcquireMeta {
//!         blob_specs: vec![BlobSpec { kind: BlobKind::Mem, size: 11 }],
//!         ..Default::default()
//!     };
//!     let acquired = transport
//!         .acquire(AcquireRequest::create(&objid, &meta, None))
//!         .await
//!         .unwrap();
//!     acquired.blobs[0].write_at(0, b"hello world").unwrap();
//!     transport.seal(acquired.lease_id).await.unwrap();
//! }
//! ```

pub mod blob;
pub mod config;
pub mod error;
pub mod fetch;
pub mod lease;
pub mod model;
pub mod peer;
pub mod resolver;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use config::{Args, Config, DEFAULT_HTTP_PORT, DEFAULT_SWEEP_INTERVAL_MS};
pub use error::{CacheError, CacheResult, ErrorKind};
pub use fetch::{copy_into_local, FetchClient};
pub use model::{AccessFlags, BlobKind, BlobSpec, LeaseId, ObjectId, ObjectState, PeerStats};
pub use peer::{
    global_peer, named_peer, Acquired, CachePeer, LeaseSweeper, Peer, PeerConfig, TieredConfig,
    TieredPeer,
};
pub use resolver::{MemoryResolver, Resolver};
pub use server::{build_peer, PeerServer, PeerServerBuilder};
pub use transport::{
    connect, ClientAcquired, ClientBlob, DirectTransport, HttpTransport, Transport, UdsServer,
    UdsTransport,
};
