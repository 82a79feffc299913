//! Background reaper for expired leases.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::debug;

use super::Peer;

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically drains expired leases through the peer's release path.
/// Expiry is silent: it shows up in stats, never as a caller-visible error.
pub struct LeaseSweeper {
    peer: Arc<dyn Peer>,
    interval: Duration,
}

impl LeaseSweeper {
    pub fn new(peer: Arc<dyn Peer>, interval: Duration) -> Self {
        Self { peer, interval }
    }

    /// Runs the sweep loop until the task is dropped.
    pub async fn run(self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = self.peer.sweep_expired().await;
            if reaped > 0 {
                debug!("lease sweep reaped {} leases", reaped);
            }
        }
    }

    /// Spawns the sweep loop on the current runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
