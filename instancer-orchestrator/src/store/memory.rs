use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instancer_common::{Instance, InstanceStatus};
use uuid::Uuid;

use super::{InstanceFilter, InstanceStore, StoreError};

/// Process-local store with the same guards as the Postgres one. Used by the
/// test suites and by single-node dev runs.
#[derive(Default)]
pub struct MemoryInstanceStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<Uuid, Instance>,
    history: Vec<Transition>,
    fail_insert: bool,
}

/// One row of the transition history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub instance_id: Uuid,
    pub from_status: InstanceStatus,
    pub to_status: InstanceStatus,
    pub reason: String,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes a record as-is, bypassing validation. Lets tests stage records
    /// in any status with arbitrary timestamps.
    pub fn put(&self, instance: Instance) {
        self.lock().records.insert(instance.id, instance);
    }

    /// Makes subsequent inserts fail as if the database were unreachable.
    pub fn fail_inserts(&self, fail: bool) {
        self.lock().fail_insert = fail;
    }

    pub fn history(&self, id: Uuid) -> Vec<Transition> {
        self.lock()
            .history
            .iter()
            .filter(|t| t.instance_id == id)
            .cloned()
            .collect()
    }
}

impl Inner {
    /// Applies `update` when `guard` holds and records the transition.
    fn transition(
        &mut self,
        id: Uuid,
        guard: impl Fn(&Instance) -> bool,
        update: impl FnOnce(&mut Instance),
        reason: &str,
    ) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if !guard(record) {
            return false;
        }
        let from_status = record.status();
        update(record);
        let to_status = record.status();
        if from_status != to_status {
            self.history.push(Transition {
                instance_id: id,
                from_status,
                to_status,
                reason: reason.to_string(),
            });
        }
        true
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn insert(&self, instance: &Instance) -> Result<(), StoreError> {
        instance.validate_new()?;
        let mut inner = self.lock();
        if inner.fail_insert {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        if inner.records.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists { id: instance.id });
        }
        inner.records.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        Ok(self.lock().records.get(&id).cloned())
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        let mut out: Vec<Instance> = self
            .lock()
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn mark_booting(
        &self,
        id: Uuid,
        hostname: &str,
        cpu_platform: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().transition(
            id,
            |r| r.deleted_at.is_none() && r.booted_at.is_none(),
            |r| {
                r.booted_at = Some(at.max(r.created_at));
                r.hostname = Some(hostname.to_string());
                r.cpu_platform = cpu_platform.map(str::to_string);
            },
            "provider_booted",
        ))
    }

    async fn mark_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.lock().transition(
            id,
            |r| r.deleted_at.is_none() && r.booted_at.is_some() && r.started_at.is_none(),
            |r| {
                let floor = r.booted_at.unwrap_or(r.created_at);
                r.started_at = Some(at.max(floor));
            },
            "health_check_passed",
        ))
    }

    async fn mark_deleted(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().transition(
            id,
            |r| r.deleted_at.is_none(),
            |r| r.deleted_at = Some(at.max(r.created_at)),
            reason,
        ))
    }

    async fn mark_deletion_triaged(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
        Ok(self.lock().transition(
            id,
            |r| r.deleted_at.is_some() && !r.is_deletion_triaged,
            |r| r.is_deletion_triaged = true,
            reason,
        ))
    }

    async fn count_by_status(&self) -> Result<BTreeMap<InstanceStatus, i64>, StoreError> {
        let mut counts: BTreeMap<InstanceStatus, i64> =
            InstanceStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in self.lock().records.values() {
            *counts.entry(record.status()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use instancer_common::ValidationError;

    fn record() -> Instance {
        Instance {
            id: Uuid::new_v4(),
            provider: "mock".into(),
            zone: "mock-z1".into(),
            owner: "alice".into(),
            instance_type: "standard-1".into(),
            is_spot: false,
            cpu_count_requested: 1,
            memory_requested_mib: 2048,
            memory_reserved_mib: 256,
            gpu_kind: None,
            gpu_count: None,
            boot_image: "img".into(),
            boot_disk_gib: 10,
            local_ssd_gib: 0,
            persistent_ssd_gib: 0,
            persistent_hdd_gib: 0,
            hostname: None,
            cpu_platform: None,
            created_at: Utc::now(),
            booted_at: None,
            started_at: None,
            deleted_at: None,
            is_deletion_triaged: false,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates_and_invalid_records() {
        let store = MemoryInstanceStore::new();
        let inst = record();
        store.insert(&inst).await.unwrap();
        assert!(matches!(
            store.insert(&inst).await,
            Err(StoreError::AlreadyExists { id }) if id == inst.id
        ));

        let mut bad = record();
        bad.hostname = Some("early".into());
        assert!(matches!(
            store.insert(&bad).await,
            Err(StoreError::Validation(ValidationError::OutputOnlyField("hostname")))
        ));
        assert!(store.get(bad.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_guarded() {
        let store = MemoryInstanceStore::new();
        let inst = record();
        store.insert(&inst).await.unwrap();
        let now = Utc::now();

        // Cannot skip Booting.
        assert!(!store.mark_running(inst.id, now).await.unwrap());
        assert!(store.mark_booting(inst.id, "h1", Some("cpu"), now).await.unwrap());
        assert!(!store.mark_booting(inst.id, "h2", None, now).await.unwrap());
        assert!(store.mark_running(inst.id, now).await.unwrap());
        assert!(!store.mark_running(inst.id, now).await.unwrap());

        // Triage needs a deletion first.
        assert!(!store.mark_deletion_triaged(inst.id, "x").await.unwrap());
        assert!(store.mark_deleted(inst.id, now, "shutdown").await.unwrap());
        assert!(!store.mark_deleted(inst.id, now, "again").await.unwrap());
        assert!(store.mark_deletion_triaged(inst.id, "x").await.unwrap());
        assert!(!store.mark_deletion_triaged(inst.id, "x").await.unwrap());

        let got = store.get(inst.id).await.unwrap().unwrap();
        assert_eq!(got.status(), InstanceStatus::Deleted);
        assert_eq!(got.hostname.as_deref(), Some("h1"));
        assert!(got.is_deletion_triaged);

        let path: Vec<_> = store
            .history(inst.id)
            .into_iter()
            .map(|t| (t.from_status, t.to_status))
            .collect();
        assert_eq!(
            path,
            vec![
                (InstanceStatus::Requested, InstanceStatus::Booting),
                (InstanceStatus::Booting, InstanceStatus::Running),
                (InstanceStatus::Running, InstanceStatus::Deleted),
            ]
        );
    }

    #[tokio::test]
    async fn deleted_records_never_resurrect() {
        let store = MemoryInstanceStore::new();
        let inst = record();
        store.insert(&inst).await.unwrap();
        let now = Utc::now();
        assert!(store.mark_deleted(inst.id, now, "shutdown").await.unwrap());
        assert!(!store.mark_booting(inst.id, "h", None, now).await.unwrap());
        assert!(!store.mark_running(inst.id, now).await.unwrap());
        assert_eq!(
            store.get(inst.id).await.unwrap().unwrap().status(),
            InstanceStatus::Deleted
        );
    }

    #[tokio::test]
    async fn timestamps_never_precede_creation() {
        let store = MemoryInstanceStore::new();
        let inst = record();
        store.insert(&inst).await.unwrap();
        let past = inst.created_at - Duration::hours(1);
        store.mark_booting(inst.id, "h", None, past).await.unwrap();
        store.mark_running(inst.id, past).await.unwrap();
        let got = store.get(inst.id).await.unwrap().unwrap();
        assert!(got.created_at <= got.booted_at.unwrap());
        assert!(got.booted_at.unwrap() <= got.started_at.unwrap());
    }

    #[tokio::test]
    async fn list_orders_by_creation_and_counts_by_status() {
        let store = MemoryInstanceStore::new();
        let mut older = record();
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = record();
        store.insert(&newer).await.unwrap();
        store.insert(&older).await.unwrap();
        store
            .mark_deleted(newer.id, Utc::now(), "shutdown")
            .await
            .unwrap();

        let all = store.list(&InstanceFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|i| i.id).collect::<Vec<_>>(), vec![older.id, newer.id]);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts[&InstanceStatus::Requested], 1);
        assert_eq!(counts[&InstanceStatus::Deleted], 1);
        assert_eq!(counts[&InstanceStatus::Running], 0);
    }
}
