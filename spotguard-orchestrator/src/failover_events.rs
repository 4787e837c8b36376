use anyhow::Context;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use spotguard_common::bus::{FailoverEventEnvelope, CHANNEL_FAILOVER_EVENTS};
use spotguard_common::FailoverEvent;

/// In-process fan-out of failover/failback transitions.
/// Publishers never block; slow subscribers lag and skip.
#[derive(Clone)]
pub struct FailoverBus {
    tx: broadcast::Sender<FailoverEvent>,
}

impl FailoverBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, evt: FailoverEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(evt);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.tx.subscribe()
    }
}

impl Default for FailoverBus {
    fn default() -> Self {
        Self::new(64)
    }
}

pub async fn publish_failover_event(
    redis_client: &redis::Client,
    evt: &FailoverEventEnvelope,
) -> anyhow::Result<()> {
    let mut conn = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis (publisher)")?;
    let payload = serde_json::to_string(evt)?;

    let _: () = conn.publish(CHANNEL_FAILOVER_EVENTS, payload).await?;
    Ok(())
}

/// Mirror every bus event onto the Redis `failover_events` channel.
pub fn spawn_redis_forwarder(
    bus: &FailoverBus,
    redis_client: redis::Client,
    source: &'static str,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(evt) => {
                    let env = FailoverEventEnvelope::from_event(&evt, source);
                    if let Err(e) = publish_failover_event(&redis_client, &env).await {
                        tracing::error!("❌ [failover-events] publish failed: {:?}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("⚠️  [failover-events] forwarder lagged, {} event(s) dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotguard_common::FailoverReason;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = FailoverBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(FailoverEvent::new("gpu", "cpu", FailoverReason::GpuFailure));
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.to, "cpu");
        assert_eq!(evt.reason, FailoverReason::GpuFailure);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = FailoverBus::default();
        bus.publish(FailoverEvent::new("a", "b", FailoverReason::Manual));
    }
}
