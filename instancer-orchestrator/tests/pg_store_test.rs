// Postgres-backed store tests. Skipped unless TEST_DATABASE_URL is set.

mod common;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::{get_test_db_pool, staged_record};
use instancer_common::{Instance, InstanceStatus};
use instancer_orchestrator::store::{InstanceFilter, InstanceStore, PgInstanceStore, StoreError};

async fn store() -> Option<PgInstanceStore> {
    match get_test_db_pool().await {
        Some(pool) => Some(PgInstanceStore::new(pool)),
        None => {
            eprintln!("TEST_DATABASE_URL not set; skipping");
            None
        }
    }
}

/// A record with an owner no other test uses, so filters stay isolated.
fn isolated_record() -> Instance {
    let mut record = staged_record(Utc::now() - Duration::minutes(1));
    record.owner = format!("owner-{}", Uuid::new_v4());
    record
}

#[tokio::test]
async fn test_insert_get_and_duplicate() {
    let Some(store) = store().await else { return };
    let record = isolated_record();

    store.insert(&record).await.unwrap();
    let fetched = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, record.id);
    assert_eq!(fetched.owner, record.owner);
    assert_eq!(fetched.persistent_ssd_gib, 50);
    assert_eq!(fetched.status(), InstanceStatus::Requested);

    let err = store.insert(&record).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { id } if id == record.id));
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_record_is_rejected() {
    let Some(store) = store().await else { return };
    let mut record = isolated_record();
    record.cpu_count_requested = 0;
    assert!(matches!(
        store.insert(&record).await,
        Err(StoreError::Validation(_))
    ));
}

#[tokio::test]
async fn test_guarded_transitions() {
    let Some(store) = store().await else { return };
    let record = isolated_record();
    store.insert(&record).await.unwrap();

    // Not booting yet.
    assert!(!store.mark_running(record.id, Utc::now()).await.unwrap());
    assert!(store
        .mark_booting(record.id, "h1.internal", Some("cpu-x"), Utc::now())
        .await
        .unwrap());
    assert!(!store
        .mark_booting(record.id, "h2.internal", None, Utc::now())
        .await
        .unwrap());
    assert!(store.mark_running(record.id, Utc::now()).await.unwrap());

    let running = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(running.status(), InstanceStatus::Running);
    assert_eq!(running.hostname.as_deref(), Some("h1.internal"));
    assert_eq!(running.cpu_platform.as_deref(), Some("cpu-x"));

    // Triage requires DELETED.
    assert!(!store.mark_deletion_triaged(record.id, "test").await.unwrap());
    assert!(store.mark_deleted(record.id, Utc::now(), "test").await.unwrap());
    assert!(!store.mark_deleted(record.id, Utc::now(), "test").await.unwrap());
    assert!(store.mark_deletion_triaged(record.id, "test").await.unwrap());
    assert!(!store.mark_deletion_triaged(record.id, "test").await.unwrap());

    let deleted = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(deleted.status(), InstanceStatus::Deleted);
    assert!(deleted.is_deletion_triaged);
    assert!(deleted.started_at.is_some());
    assert!(deleted.deleted_at.unwrap() >= deleted.started_at.unwrap());
}

#[tokio::test]
async fn test_list_filters_by_derived_status() {
    let Some(store) = store().await else { return };
    let owner = format!("owner-{}", Uuid::new_v4());

    let mut old = staged_record(Utc::now() - Duration::minutes(30));
    old.owner = owner.clone();
    let mut fresh = staged_record(Utc::now() - Duration::minutes(1));
    fresh.owner = owner.clone();
    let mut booting = staged_record(Utc::now() - Duration::minutes(30));
    booting.owner = owner.clone();
    for r in [&old, &fresh, &booting] {
        store.insert(r).await.unwrap();
    }
    store
        .mark_booting(booting.id, "b.internal", None, Utc::now())
        .await
        .unwrap();

    let cutoff = Utc::now() - Duration::minutes(15);
    let requested = store
        .list(&InstanceFilter::status(InstanceStatus::Requested).owner(owner.clone()))
        .await
        .unwrap();
    // Oldest first.
    assert_eq!(
        requested.iter().map(|i| i.id).collect::<Vec<_>>(),
        vec![old.id, fresh.id]
    );

    let stale = store
        .list(
            &InstanceFilter::status(InstanceStatus::Requested)
                .owner(owner.clone())
                .entered_before(cutoff),
        )
        .await
        .unwrap();
    assert_eq!(stale.iter().map(|i| i.id).collect::<Vec<_>>(), vec![old.id]);

    // Booted just now: its creation time no longer counts.
    let stale_booting = store
        .list(
            &InstanceFilter::status(InstanceStatus::Booting)
                .owner(owner.clone())
                .entered_before(cutoff),
        )
        .await
        .unwrap();
    assert!(stale_booting.is_empty());

    let counts = store.count_by_status().await.unwrap();
    assert!(counts.get(&InstanceStatus::Requested).copied().unwrap_or(0) >= 2);
    assert!(counts.get(&InstanceStatus::Booting).copied().unwrap_or(0) >= 1);
}
