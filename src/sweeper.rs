use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::registry::RoomRegistry;

/// Periodically evicts rooms older than the registry's TTL.
pub fn spawn(registry: Arc<RoomRegistry>, every: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
      ticker.tick().await;
      let evicted = registry.sweep();
      if evicted.is_empty() {
        debug!("sweep: nothing expired");
      } else {
        info!(count = evicted.len(), rooms = ?evicted, "sweep: evicted expired rooms");
      }
    }
  })
}
