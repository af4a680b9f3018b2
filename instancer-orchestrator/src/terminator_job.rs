use instancer_common::bus::{CreationFailureReason, DeletionReason, LifecycleEvent};
use instancer_common::Instance;
use instancer_providers::inventory::InstanceRef;

use crate::lifecycle_events;
use crate::services::{ServiceContext, EVENT_SOURCE};
use crate::state_machine;

/// Why an instance is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// Explicit caller request; the record was already marked deleted.
    Requested,
    /// Compensation for a creation that failed after the record was persisted.
    CreationFailed(CreationFailureReason),
}

/// Shutdown supervision: mark deleted (creation failures only), delete on the
/// provider, mark triaged, publish the outcome. Bounded by the shutdown
/// deadline; anything left undone is picked up by the garbage collector.
pub async fn await_shutdown(ctx: ServiceContext, instance: Instance, trigger: ShutdownTrigger) {
    let instance_id = instance.id;
    let deadline = ctx.timeouts.shutdown;
    if tokio::time::timeout(deadline, shutdown(&ctx, &instance, trigger))
        .await
        .is_err()
    {
        tracing::warn!(%instance_id, ?trigger, "shutdown deadline exceeded; leaving to garbage collector");
    }
}

async fn shutdown(ctx: &ServiceContext, instance: &Instance, trigger: ShutdownTrigger) {
    let instance_id = instance.id;
    let Some(provider) = ctx.providers.get(&instance.provider) else {
        tracing::error!(%instance_id, provider = %instance.provider, "provider not configured; cannot delete");
        return;
    };

    let outcome = {
        let _guard = ctx.locks.lock(instance_id).await;

        // 1) Creation failures were never marked deleted.
        if let ShutdownTrigger::CreationFailed(reason) = trigger {
            match state_machine::mark_deleted(ctx.store.as_ref(), instance_id, reason.as_str()).await
            {
                Ok(true) => {}
                Ok(false) => {
                    // An explicit shutdown or the garbage collector got there first and owns it.
                    tracing::info!(%instance_id, "creation failure: record already deleted");
                    return;
                }
                Err(e) => {
                    tracing::error!(%instance_id, error = %e, "failed to mark deleted; leaving to garbage collector");
                    return;
                }
            }
        }

        // 2) Provider delete. NotFound means it is already gone.
        let reference = InstanceRef::new(instance_id, instance.zone.clone());
        let outcome = match provider.instances().delete(&reference).await {
            Ok(()) => DeletionReason::Shutdown,
            Err(e) if e.is_not_found() => DeletionReason::Terminated,
            Err(e) => {
                tracing::warn!(%instance_id, error = %e, "provider delete failed; leaving to garbage collector");
                return;
            }
        };

        if let Err(e) =
            state_machine::mark_deletion_triaged(ctx.store.as_ref(), instance_id, outcome.as_str())
                .await
        {
            tracing::warn!(%instance_id, error = %e, "failed to mark deletion triaged");
        }
        outcome
    };

    // 3) Publish
    let event = match trigger {
        ShutdownTrigger::CreationFailed(reason) => LifecycleEvent::CreationFailed { reason },
        ShutdownTrigger::Requested => LifecycleEvent::Deleted { reason: outcome },
    };
    lifecycle_events::emit(ctx.publisher.as_ref(), instance_id, event, EVENT_SOURCE).await;
}
