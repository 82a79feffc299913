//! Server configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Default HTTP port for the peer service.
pub const DEFAULT_HTTP_PORT: u16 = 10700;

/// Default interval between expired-lease sweeps, in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Command-line arguments for the peer server.
#[derive(Parser, Debug, Clone)]
#[command(name = "packice-rs")]
#[command(about = "Peer-to-peer object cache peer")]
#[command(version)]
pub struct Args {
    /// Host address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the HTTP adapter.
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// Location for blob data. Defaults to a scratch dir under the system
    /// temp directory.
    #[arg(long, short = 'l')]
    pub location: Option<PathBuf>,

    /// Also serve the peer on this Unix socket path.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Register the peer in the process-global registry under this name,
    /// making it reachable in-process via `memory://<name>`.
    #[arg(long)]
    pub name: Option<String>,

    /// Maximum resident objects (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub max_objects: usize,

    /// Maximum resident bytes (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub max_bytes: u64,

    /// Compose a memory hot tier over a file cold tier.
    #[arg(long)]
    pub tiered: bool,

    /// Hot-tier byte capacity when --tiered is set (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub hot_max_bytes: u64,

    /// Hot-tier object capacity when --tiered is set (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub hot_max_objects: usize,

    /// Interval between expired-lease sweeps, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_MS)]
    pub sweep_interval_ms: u64,

    /// Enable debug logging.
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Enable silent mode (minimal logging).
    #[arg(long, short = 's')]
    pub silent: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_HTTP_PORT,
            location: None,
            socket: None,
            name: None,
            max_objects: 0,
            max_bytes: 0,
            tiered: false,
            hot_max_bytes: 0,
            hot_max_objects: 0,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            debug: false,
            silent: false,
        }
    }
}

/// Server configuration derived from command-line arguments.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub socket: Option<PathBuf>,
    pub name: Option<String>,
    pub max_objects: usize,
    pub max_bytes: u64,
    pub tiered: bool,
    pub hot_max_bytes: u64,
    pub hot_max_objects: usize,
    pub sweep_interval: Duration,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Args::default().into()
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            data_dir: args
                .location
                .unwrap_or_else(|| std::env::temp_dir().join("packice")),
            socket: args.socket,
            name: args.name,
            max_objects: args.max_objects,
            max_bytes: args.max_bytes,
            tiered: args.tiered,
            hot_max_bytes: args.hot_max_bytes,
            hot_max_objects: args.hot_max_objects,
            sweep_interval: Duration::from_millis(args.sweep_interval_ms),
            debug: args.debug,
        }
    }
}

impl Config {
    /// Returns the bind address for the HTTP adapter.
    pub fn http_bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
