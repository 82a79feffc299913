//! HTTP (and optional UDS) server for a peer.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::peer::{named_peer, CachePeer, LeaseSweeper, Peer, PeerConfig, TieredConfig, TieredPeer};
use crate::transport::{peer_router, UdsServer};

/// Builds the peer described by a config: a single cache peer, or a
/// memory-over-file tiered composite.
pub fn build_peer(config: &Config) -> Arc<dyn Peer> {
    if config.tiered {
        let hot = CachePeer::new(PeerConfig {
            data_dir: config.data_dir.join("hot"),
            max_objects: config.hot_max_objects,
            max_bytes: config.hot_max_bytes,
            evict_on_full: false,
        });
        let cold = CachePeer::new(PeerConfig {
            data_dir: config.data_dir.join("cold"),
            max_objects: config.max_objects,
            max_bytes: config.max_bytes,
            evict_on_full: true,
        });
        TieredPeer::new(hot, cold, TieredConfig::default())
    } else {
        CachePeer::new(PeerConfig {
            data_dir: config.data_dir.clone(),
            max_objects: config.max_objects,
            max_bytes: config.max_bytes,
            evict_on_full: true,
        })
    }
}

/// Peer server: wires a peer to its transports and background sweeper.
pub struct PeerServer {
    config: Arc<Config>,
    peer: Arc<dyn Peer>,
}

impl PeerServer {
    pub fn new(config: Config) -> Self {
        let peer = build_peer(&config);
        Self::with_peer(config, peer)
    }

    pub fn with_peer(config: Config, peer: Arc<dyn Peer>) -> Self {
        // A named peer is also reachable in-process via memory://<name>,
        // with whatever capacity and tiering this config gave it.
        let peer = match &config.name {
            Some(name) => named_peer(name, peer),
            None => peer,
        };
        Self {
            config: Arc::new(config),
            peer,
        }
    }

    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    /// Runs until ctrl-c.
    pub async fn run(self) -> CacheResult<()> {
        let addr: SocketAddr = self
            .config
            .http_bind_address()
            .parse()
            .map_err(|e| CacheError::internal(format!("bad bind address: {}", e)))?;

        LeaseSweeper::new(self.peer.clone(), self.config.sweep_interval).spawn();

        if let Some(socket) = &self.config.socket {
            let uds = UdsServer::bind(self.peer.clone(), socket.clone()).await?;
            uds.spawn();
        }

        let app = peer_router(self.peer.clone());
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CacheError::internal(format!("bind {}: {}", addr, e)))?;
        info!("packice peer is listening at http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|e| CacheError::internal(format!("http serve: {}", e)))
    }

    /// Returns the bind address.
    pub fn bind_address(&self) -> String {
        self.config.http_bind_address()
    }

    /// Returns the base URL for the HTTP adapter.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.bind_address())
    }
}

/// Builder for creating a peer server.
pub struct PeerServerBuilder {
    config: Config,
    peer: Option<Arc<dyn Peer>>,
}

impl PeerServerBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            peer: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn socket(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.socket = Some(path.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn peer(mut self, peer: Arc<dyn Peer>) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn build(self) -> PeerServer {
        match self.peer {
            Some(peer) => PeerServer::with_peer(self.config, peer),
            None => PeerServer::new(self.config),
        }
    }
}

impl Default for PeerServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
