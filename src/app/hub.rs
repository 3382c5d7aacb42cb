//! Hub - accept loop and relay registry
//!
//! The hub owns the single listener, constructs one relay per accepted
//! connection and tracks the live set. Shutdown broadcasts to every relay
//! and waits for the set to drain, bounded by the shutdown deadline.
//! Configuration hot-reload installs a fresh snapshot; in-flight relays
//! keep the snapshot they were built with.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::common::{Address, Result};
use crate::config::CoreConfig;
use crate::error::Error;
use crate::transport::Inbound;

use super::relay::Relay;

/// Bound on the relay drain at shutdown
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Process-level accept loop and relay registry
pub struct Hub {
    cfg: RwLock<Arc<CoreConfig>>,
    shutdown: broadcast::Sender<()>,
    local_addr: RwLock<Option<Address>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(cfg: CoreConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            cfg: RwLock::new(Arc::new(cfg)),
            shutdown,
            local_addr: RwLock::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Current configuration snapshot; each relay captures one at accept
    pub fn snapshot(&self) -> Arc<CoreConfig> {
        self.cfg.read().clone()
    }

    /// Install a new validated snapshot. Existing relays are untouched;
    /// relays accepted from now on use the new configuration.
    pub fn install_config(&self, cfg: CoreConfig) {
        *self.cfg.write() = Arc::new(cfg);
        info!("configuration updated; in-flight relays keep their snapshot");
    }

    /// The bound listener address, available once `run` has bound
    pub fn local_addr(&self) -> Option<Address> {
        self.local_addr.read().clone()
    }

    /// Stop accepting and trigger Closing on all relays
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }

    /// Bind the listener and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let cfg = self.snapshot();
        let listener = Inbound::bind(&cfg.bind).await?;
        let bound = listener.local_addr()?;
        info!(role = cfg.role.as_str(), addr = %bound, "listening");
        *self.local_addr.write() = Some(bound);

        let mut relays: JoinSet<u64> = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                            let relay = Relay::new(id, self.snapshot(), self.shutdown.clone());
                            debug!(id, %peer, "connection accepted");
                            relays.spawn(async move {
                                if let Err(e) = relay.run(stream, peer).await {
                                    match e {
                                        Error::Timeout => debug!(id, "relay timed out"),
                                        e => info!(id, error = %e, "relay closed with error"),
                                    }
                                }
                                id
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                // reap finished relays from the same task that spawns them
                Some(finished) = relays.join_next(), if !relays.is_empty() => {
                    if let Ok(id) = finished {
                        debug!(id, active = relays.len(), "relay reaped");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(active = relays.len(), "shutting down");
        let drained = timeout(SHUTDOWN_DEADLINE, async {
            while relays.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown deadline exceeded; aborting remaining relays");
            relays.shutdown().await;
        }

        Ok(())
    }
}
