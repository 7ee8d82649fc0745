//! Background expiry task.
//!
//! Re-arms on a fixed interval regardless of whether the previous sweep
//! succeeded. Shutdown is cooperative: the task finishes an in-flight sweep
//! before exiting, and `shutdown()` waits for it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::cache::TrialCache;

pub struct Sweeper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Start sweeping `cache` every `interval`, removing entries idle longer
    /// than `expiration`.
    pub fn spawn(cache: Arc<TrialCache>, interval: Duration, expiration: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first sweep should not
            ticker.tick().await;
            debug!(
                target: "ctgovservice",
                interval_ms = interval.as_millis() as u64,
                expiration_ms = expiration.as_millis() as u64,
                "expiry sweeper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep_once(expiration).await;
                        if removed > 0 {
                            debug!(target: "ctgovservice", removed, "expiry sweep complete");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!(target: "ctgovservice", "expiry sweeper stopped");
        });
        Self { stop, handle }
    }

    /// Stop the task, waiting for any sweep already underway.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper").finish_non_exhaustive()
    }
}
