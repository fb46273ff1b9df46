//! Periodic world snapshot broadcast.

use std::sync::Arc;
use std::time::Duration;

use relay_core::World;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{BroadcastEnvelope, HubHandle};

/// Broadcast the world's `cubes` snapshot to every member each `period`,
/// skipping ticks while the world is empty.
///
/// Stops when `shutdown` fires or the hub stops. Returns the number of
/// snapshots published.
pub async fn run_snapshot_publisher(
    world: Arc<World>,
    hub: HubHandle,
    period: Duration,
    shutdown: CancellationToken,
) -> u64 {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut published = 0;
    info!(
        period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        "snapshot publisher started"
    );

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if world.is_empty() {
                    continue;
                }
                let json = match world.snapshot_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode snapshot");
                        continue;
                    }
                };
                if hub.broadcast(BroadcastEnvelope::to_everyone(json)).await.is_err() {
                    debug!("hub stopped, snapshot publisher exiting");
                    break;
                }
                published += 1;
            }
        }
    }
    published
}
