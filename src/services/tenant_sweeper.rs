use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::backend::Backend;
use crate::db::error::DbError;
use crate::db::manager::ConnectionManager;

/// Spawn a background task that periodically closes cached connections of
/// tenants that were deactivated or removed from the registry.
/// The task ends once the manager has been closed.
pub fn start<B: Backend>(manager: Arc<ConnectionManager<B>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match manager.sweep_inactive().await {
                Ok(evicted) if evicted.is_empty() => {}
                Ok(evicted) => info!("Tenant sweep: closed {} connection(s): {:?}", evicted.len(), evicted),
                Err(DbError::Closed) => {
                    info!("Tenant sweep: connection manager closed, stopping");
                    break;
                }
                Err(e) => warn!("Tenant sweep failed: {e}"),
            }
        }
    })
}
