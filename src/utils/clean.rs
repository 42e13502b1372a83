use std::sync::Arc;

use tokio::time;
use crate::{hub::BroadcastHub, player::SessionRegistry};

pub const SWEEP_EVERY: time::Duration = time::Duration::from_secs(30);

/// 房間清道夫：沒 session、沒佇列、沒人聽的房間就收掉
pub async fn task(registry: Arc<SessionRegistry>, hub: Arc<BroadcastHub>) {
    let mut tick = time::interval(SWEEP_EVERY);
    loop {
        tick.tick().await;
        sweep(&registry, &hub).await;
    }
}

pub async fn sweep(registry: &SessionRegistry, hub: &BroadcastHub) -> usize {
    let listening = hub.active_rooms().await;
    let gone = registry.reap(&listening).await;
    if gone > 0 {
        let left = registry.room_count().await;
        tracing::debug!(gone, left, "reaped idle rooms");
    }
    gone
}
