use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use redis::AsyncCommands;
use uuid::Uuid;

use instancer_common::bus::{LifecycleEvent, LifecycleEventEnvelope, CHANNEL_INSTANCE_LIFECYCLE};

/// Sink for lifecycle events. `publish` returns once the bus acknowledged the message.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, evt: &LifecycleEventEnvelope) -> anyhow::Result<()>;
}

pub struct RedisEventPublisher {
    client: redis::Client,
}

impl RedisEventPublisher {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, evt: &LifecycleEventEnvelope) -> anyhow::Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis (publisher)")?;
        let payload = serde_json::to_string(evt)?;

        // PUBLISH replies with the number of subscribers that received it.
        let receivers: i64 = conn
            .publish(CHANNEL_INSTANCE_LIFECYCLE, payload)
            .await
            .context("Failed to publish lifecycle event")?;
        tracing::debug!(
            instance_id = %evt.instance_id,
            event = evt.event.as_str(),
            receivers,
            "lifecycle event published"
        );
        Ok(())
    }
}

/// Keeps every published envelope in memory. Used by tests and dev runs without Redis.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<LifecycleEventEnvelope>>,
    fail: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEventEnvelope> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn events_for(&self, instance_id: Uuid) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| e.event)
            .collect()
    }

    /// Makes subsequent publishes fail without recording anything.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, evt: &LifecycleEventEnvelope) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap_or_else(|p| p.into_inner()) {
            anyhow::bail!("bus unavailable");
        }
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(evt.clone());
        Ok(())
    }
}

/// Build and publish one lifecycle event. Failures are logged, not propagated:
/// the store stays the source of truth and consumers reconcile from it.
pub async fn emit(
    publisher: &dyn EventPublisher,
    instance_id: Uuid,
    event: LifecycleEvent,
    source: &str,
) -> bool {
    let evt = LifecycleEventEnvelope::new(instance_id, event, source);
    match publisher.publish(&evt).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                %instance_id,
                event = evt.event.as_str(),
                error = %e,
                "failed to publish lifecycle event"
            );
            false
        }
    }
}
