use tokio::time::Instant;

use instancer_common::bus::{CreationFailureReason, LifecycleEvent};
use instancer_common::{Instance, InstanceConfig, Resources};
use instancer_providers::InstancePromise;

use crate::health_check::{self, Backoff};
use crate::lifecycle_events;
use crate::services::{ServiceContext, EVENT_SOURCE};
use crate::state_machine;
use crate::terminator_job::{self, ShutdownTrigger};

/// Creation supervision: provider boot -> BOOTING -> health check -> RUNNING -> `Created` event.
///
/// Runs detached from the request that created the record, bounded by the
/// creation deadline. Any failure before RUNNING hands the instance to the
/// shutdown workflow with a `CreationFailed` trigger. Store errors abort the
/// task silently: the garbage collector purges stale REQUESTED/BOOTING records.
pub async fn await_creation(
    ctx: ServiceContext,
    instance: Instance,
    promise: Box<dyn InstancePromise>,
    config: InstanceConfig,
    resources: Resources,
) {
    let instance_id = instance.id;
    let deadline = Instant::now() + ctx.timeouts.creation;

    // a) Provider boot
    let booted = match tokio::time::timeout_at(deadline, promise.wait()).await {
        Ok(Ok(booted)) => booted,
        Ok(Err(e)) => {
            tracing::warn!(%instance_id, error = %e, "provider failed to boot instance");
            fail_creation(ctx, instance, CreationFailureReason::ProviderFailed).await;
            return;
        }
        Err(_) => {
            tracing::warn!(%instance_id, "instance did not boot before the creation deadline");
            fail_creation(ctx, instance, CreationFailureReason::ProviderFailed).await;
            return;
        }
    };

    // b) REQUESTED -> BOOTING
    {
        let _guard = ctx.locks.lock(instance_id).await;
        match state_machine::requested_to_booting(
            ctx.store.as_ref(),
            instance_id,
            &booted.hostname,
            booted.cpu_platform.as_deref(),
        )
        .await
        {
            Ok(true) => {}
            // Shut down (or collected) while booting; that path owns the instance now.
            Ok(false) => return,
            Err(e) => {
                tracing::error!(%instance_id, error = %e, "failed to record boot; leaving to garbage collector");
                return;
            }
        }
    }

    // c) Health check until SERVING or deadline
    let backoff = Backoff::new(
        ctx.timeouts.health_initial_interval,
        ctx.timeouts.health_max_interval,
    );
    let serving =
        health_check::wait_until_serving(ctx.probe.as_ref(), &booted.hostname, backoff, deadline)
            .await;
    if !serving {
        tracing::warn!(%instance_id, hostname = %booted.hostname, "health check timed out");
        fail_creation(ctx, instance, CreationFailureReason::HealthCheckTimeout).await;
        return;
    }

    // d) BOOTING -> RUNNING
    {
        let _guard = ctx.locks.lock(instance_id).await;
        match state_machine::booting_to_running(ctx.store.as_ref(), instance_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::error!(%instance_id, error = %e, "failed to record running; leaving to garbage collector");
                return;
            }
        }
    }

    lifecycle_events::emit(
        ctx.publisher.as_ref(),
        instance_id,
        LifecycleEvent::Created {
            config,
            resources,
            hostname: booted.hostname,
        },
        EVENT_SOURCE,
    )
    .await;
}

async fn fail_creation(ctx: ServiceContext, instance: Instance, reason: CreationFailureReason) {
    terminator_job::await_shutdown(ctx, instance, ShutdownTrigger::CreationFailed(reason)).await;
}
