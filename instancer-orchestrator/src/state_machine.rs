//! Lifecycle transitions of instance records.
//!
//! Every transition is idempotent: it returns `Ok(false)` when the record is
//! not in the source status (already moved on, deleted concurrently, or
//! unknown). Callers serialize per instance with `InstanceLocks`.

use chrono::Utc;
use uuid::Uuid;

use crate::store::{InstanceStore, StoreError};

/// REQUESTED -> BOOTING, once the provider reports the instance booted.
pub async fn requested_to_booting(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    hostname: &str,
    cpu_platform: Option<&str>,
) -> Result<bool, StoreError> {
    let moved = store
        .mark_booting(instance_id, hostname, cpu_platform, Utc::now())
        .await?;
    if moved {
        tracing::info!(%instance_id, hostname, "instance booting");
    } else {
        tracing::info!(%instance_id, "requested_to_booting: no-op (record not in requested)");
    }
    Ok(moved)
}

/// BOOTING -> RUNNING, once the health check reports SERVING.
pub async fn booting_to_running(
    store: &dyn InstanceStore,
    instance_id: Uuid,
) -> Result<bool, StoreError> {
    let moved = store.mark_running(instance_id, Utc::now()).await?;
    if moved {
        tracing::info!(%instance_id, "instance running");
    } else {
        tracing::info!(%instance_id, "booting_to_running: no-op (record not in booting)");
    }
    Ok(moved)
}

/// Any live status -> DELETED.
pub async fn mark_deleted(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, StoreError> {
    let moved = store.mark_deleted(instance_id, Utc::now(), reason).await?;
    if moved {
        tracing::info!(%instance_id, reason, "instance marked deleted");
    }
    Ok(moved)
}

/// The provider side of a deleted record is confirmed gone.
pub async fn mark_deletion_triaged(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, StoreError> {
    let moved = store.mark_deletion_triaged(instance_id, reason).await?;
    if moved {
        tracing::info!(%instance_id, reason, "deletion triaged");
    }
    Ok(moved)
}
