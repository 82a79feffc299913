//! Common test utilities.

use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

use packice_rs::{
    CachePeer, Config, Peer, PeerConfig, PeerServerBuilder,
};

/// Test server wrapper: one peer behind the HTTP adapter on a random port.
pub struct TestServer {
    pub base_url: String,
    pub peer: Arc<dyn Peer>,
    // Held so the blob directory outlives the test.
    _data_dir: Option<TempDir>,
}

impl TestServer {
    /// Starts a file-capable peer with scratch storage on a random port.
    pub async fn start() -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let peer: Arc<dyn Peer> = CachePeer::new(PeerConfig::in_dir(data_dir.path()));
        Self::start_with(peer, Some(data_dir)).await
    }

    /// Starts the given peer on a random port.
    pub async fn start_with(peer: Arc<dyn Peer>, data_dir: Option<TempDir>) -> Self {
        // Find an available port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = PeerServerBuilder::new()
            .config(Config {
                host: "127.0.0.1".to_string(),
                port,
                ..Config::default()
            })
            .peer(peer.clone())
            .build();
        let base_url = server.base_url();

        tokio::spawn(async move {
            server.run().await.unwrap();
        });

        // Wait for the listener to come up.
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            base_url,
            peer,
            _data_dir: data_dir,
        }
    }
}

/// A standalone peer with scratch storage, for direct (in-process) tests.
pub fn scratch_peer() -> (Arc<CachePeer>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let peer = CachePeer::new(PeerConfig::in_dir(dir.path()));
    (peer, dir)
}

/// A peer limited to `max_objects` resident objects.
pub fn bounded_peer(max_objects: usize) -> (Arc<CachePeer>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let peer = CachePeer::new(PeerConfig {
        max_objects,
        ..PeerConfig::in_dir(dir.path())
    });
    (peer, dir)
}
