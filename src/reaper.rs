use crate::config::ReaperConfig;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically evicts sessions nobody has used for longer than the timeout.
pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(registry: Arc<SessionRegistry>, config: ReaperConfig) -> Self {
        Self { registry, config }
    }

    /// One pass. Returns how many sessions were scheduled for teardown.
    pub async fn sweep(&self) -> usize {
        let count = self.registry.reap_expired(self.config.timeout).await;
        if count > 0 {
            info!(count, "reaping idle sessions");
        }
        count
    }

    /// Sweeps every `interval` until `cancel` fires. The first sweep happens
    /// one full interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
        debug!("idle reaper stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
