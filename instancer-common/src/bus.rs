use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{InstanceConfig, Resources};

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_INSTANCE_LIFECYCLE: &str = "instance_lifecycle";

// -----------------------------------------------------------------------------
// Lifecycle events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CreationFailureReason {
    #[serde(rename = "PROVIDER_FAILED")]
    ProviderFailed,
    #[serde(rename = "HEALTH_CHECK_TIMEOUT")]
    HealthCheckTimeout,
}

impl CreationFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationFailureReason::ProviderFailed => "PROVIDER_FAILED",
            CreationFailureReason::HealthCheckTimeout => "HEALTH_CHECK_TIMEOUT",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    /// Explicit request, instance found and deleted on the provider.
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
    /// Provider no longer had the instance.
    #[serde(rename = "TERMINATED")]
    Terminated,
}

impl DeletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionReason::Shutdown => "SHUTDOWN",
            DeletionReason::Terminated => "TERMINATED",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    #[serde(rename = "EVT:INSTANCE_CREATED")]
    Created {
        config: InstanceConfig,
        resources: Resources,
        hostname: String,
    },
    #[serde(rename = "EVT:INSTANCE_CREATION_FAILED")]
    CreationFailed { reason: CreationFailureReason },
    #[serde(rename = "EVT:INSTANCE_DELETED")]
    Deleted { reason: DeletionReason },
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Created { .. } => "EVT:INSTANCE_CREATED",
            LifecycleEvent::CreationFailed { .. } => "EVT:INSTANCE_CREATION_FAILED",
            LifecycleEvent::Deleted { .. } => "EVT:INSTANCE_DELETED",
        }
    }
}

/// One message on the lifecycle channel. `instance_id` is the partition key
/// consumers group on, and the correlation key with the synchronous response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LifecycleEventEnvelope {
    pub event_id: Uuid,
    pub instance_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub event: LifecycleEvent,
}

impl LifecycleEventEnvelope {
    pub fn new(instance_id: Uuid, event: LifecycleEvent, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            instance_id,
            occurred_at: Utc::now(),
            source: source.to_string(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_is_tagged() {
        let evt = LifecycleEventEnvelope::new(
            Uuid::new_v4(),
            LifecycleEvent::Deleted {
                reason: DeletionReason::Terminated,
            },
            "test",
        );
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["event"]["type"], "EVT:INSTANCE_DELETED");
        assert_eq!(json["event"]["reason"], "TERMINATED");
        assert_eq!(json["instance_id"], evt.instance_id.to_string());
    }
}
