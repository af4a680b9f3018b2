use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use instancer_common::{Instance, InstanceStatus};
use instancer_providers::inventory::InstanceRef;
use instancer_providers::{CloudProvider, ProviderError};

use crate::locks::InstanceLocks;
use crate::state_machine;
use crate::store::{InstanceFilter, InstanceStore, StoreError};
use crate::supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    StaleRequested,
    StaleBooting,
    OrphanedRunning,
    UntriagedDeleted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::StaleRequested => "stale_requested",
            Phase::StaleBooting => "stale_booting",
            Phase::OrphanedRunning => "orphaned_running",
            Phase::UntriagedDeleted => "untriaged_deleted",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("listing provider instances: {0}")]
    GroundTruth(#[source] ProviderError),
    #[error("{phase}: {source}")]
    Store { phase: Phase, source: StoreError },
    #[error("{phase}: deleting {instance_id} on provider: {source}")]
    ProviderDelete {
        phase: Phase,
        instance_id: Uuid,
        source: ProviderError,
    },
}

/// Records changed by one pass, per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub stale_requested: usize,
    pub stale_booting: usize,
    pub orphaned_running: usize,
    pub triaged_deleted: usize,
}

impl ReconcileSummary {
    pub fn total(&self) -> usize {
        self.stale_requested + self.stale_booting + self.orphaned_running + self.triaged_deleted
    }
}

/// Repairs divergence between the records of one provider and what that
/// provider actually runs. Every mutation is guarded, so passes can be re-run
/// after a partial failure and converge.
#[derive(Clone)]
pub struct GarbageCollector {
    store: Arc<dyn InstanceStore>,
    provider: Arc<dyn CloudProvider>,
    locks: InstanceLocks,
    stale_after: chrono::Duration,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        provider: Arc<dyn CloudProvider>,
        locks: InstanceLocks,
        stale_after: Duration,
    ) -> Self {
        let stale_after =
            chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::weeks(52));
        Self {
            store,
            provider,
            locks,
            stale_after,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// One pass. The first error aborts the pass; work already committed stays.
    pub async fn run_once(&self) -> Result<ReconcileSummary, ReconcileError> {
        // 1) Ground truth
        let snapshot_at = Utc::now();
        let ground_truth: HashSet<Uuid> = self
            .provider
            .instances()
            .list()
            .await
            .map_err(ReconcileError::GroundTruth)?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let cutoff = snapshot_at - self.stale_after;

        let mut summary = ReconcileSummary::default();
        // 2) + 3) Creations that never finished
        summary.stale_requested = self
            .purge_stale(Phase::StaleRequested, InstanceStatus::Requested, cutoff)
            .await?;
        summary.stale_booting = self
            .purge_stale(Phase::StaleBooting, InstanceStatus::Booting, cutoff)
            .await?;
        // 4) Gone behind our back. Only records running before the snapshot can be judged by it.
        summary.orphaned_running = self.collect_orphans(&ground_truth, snapshot_at).await?;
        // 5) Deletions never confirmed
        summary.triaged_deleted = self.triage_deleted(&ground_truth, cutoff).await?;

        if summary.total() > 0 {
            tracing::info!(provider = self.provider.name(), ?summary, "garbage collection pass");
        }
        Ok(summary)
    }

    fn candidates(&self, status: InstanceStatus, entered_before: DateTime<Utc>) -> InstanceFilter {
        InstanceFilter::status(status)
            .provider(self.provider.name())
            .entered_before(entered_before)
    }

    async fn purge_stale(
        &self,
        phase: Phase,
        status: InstanceStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, ReconcileError> {
        let store_err = |source| ReconcileError::Store { phase, source };
        let stale = self
            .store
            .list(&self.candidates(status, cutoff))
            .await
            .map_err(store_err)?;

        let mut purged = 0;
        for instance in stale {
            let _guard = self.locks.lock(instance.id).await;
            let reason = phase.to_string();
            let deleted = state_machine::mark_deleted(self.store.as_ref(), instance.id, &reason)
                .await
                .map_err(store_err)?;
            self.delete_on_provider(phase, &instance).await?;
            state_machine::mark_deletion_triaged(self.store.as_ref(), instance.id, &reason)
                .await
                .map_err(store_err)?;
            if deleted {
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn collect_orphans(
        &self,
        ground_truth: &HashSet<Uuid>,
        snapshot_at: DateTime<Utc>,
    ) -> Result<usize, ReconcileError> {
        let phase = Phase::OrphanedRunning;
        let store_err = |source| ReconcileError::Store { phase, source };
        let running = self
            .store
            .list(&self.candidates(InstanceStatus::Running, snapshot_at))
            .await
            .map_err(store_err)?;

        let mut collected = 0;
        for instance in running.iter().filter(|i| !ground_truth.contains(&i.id)) {
            let _guard = self.locks.lock(instance.id).await;
            tracing::warn!(instance_id = %instance.id, provider = self.provider.name(), "running instance missing on provider");
            let deleted =
                state_machine::mark_deleted(self.store.as_ref(), instance.id, "provider_missing")
                    .await
                    .map_err(store_err)?;
            state_machine::mark_deletion_triaged(self.store.as_ref(), instance.id, "provider_missing")
                .await
                .map_err(store_err)?;
            if deleted {
                collected += 1;
            }
        }
        Ok(collected)
    }

    async fn triage_deleted(
        &self,
        ground_truth: &HashSet<Uuid>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, ReconcileError> {
        let phase = Phase::UntriagedDeleted;
        let store_err = |source| ReconcileError::Store { phase, source };
        let untriaged = self
            .store
            .list(&self.candidates(InstanceStatus::Deleted, cutoff).triaged(false))
            .await
            .map_err(store_err)?;

        let mut triaged = 0;
        for instance in untriaged {
            let _guard = self.locks.lock(instance.id).await;
            if ground_truth.contains(&instance.id) {
                self.delete_on_provider(phase, &instance).await?;
            }
            if state_machine::mark_deletion_triaged(self.store.as_ref(), instance.id, "gc_confirmed")
                .await
                .map_err(store_err)?
            {
                triaged += 1;
            }
        }
        Ok(triaged)
    }

    /// Deletes the instance on the provider. Already gone counts as success.
    async fn delete_on_provider(&self, phase: Phase, instance: &Instance) -> Result<(), ReconcileError> {
        let reference = InstanceRef::new(instance.id, instance.zone.clone());
        match self.provider.instances().delete(&reference).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(ReconcileError::ProviderDelete {
                phase,
                instance_id: instance.id,
                source,
            }),
        }
    }
}

/// Runs one pass of every collector concurrently, returning each outcome by provider.
pub async fn run_all(
    collectors: &[GarbageCollector],
) -> Vec<(String, Result<ReconcileSummary, ReconcileError>)> {
    let passes = collectors.iter().map(|gc| async move {
        (gc.provider_name().to_string(), gc.run_once().await)
    });
    futures_util::future::join_all(passes).await
}

/// job-garbage-collector: periodic passes until shutdown.
pub async fn run(
    collectors: Arc<Vec<GarbageCollector>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    tracing::info!(providers = collectors.len(), every_secs = every.as_secs(), "job-garbage-collector started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = supervisor::stopped(&mut shutdown) => {
                tracing::info!("job-garbage-collector stopped");
                return;
            }
        }

        for (provider, outcome) in run_all(&collectors).await {
            match outcome {
                Ok(_) => {}
                // Retried on the next tick.
                Err(e) => tracing::error!(provider = %provider, error = %e, "garbage collection pass failed"),
            }
        }
    }
}
