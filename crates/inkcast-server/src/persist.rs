//! Periodic persistence.

use crate::store::SessionStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Flush sessions whose autosave interval has elapsed, every `period`.
pub fn spawn_autosave(store: Arc<SessionStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let saved = store.persist_due(Instant::now()).await;
            if saved > 0 {
                debug!("Autosaved {} sessions", saved);
            }
        }
    })
}
