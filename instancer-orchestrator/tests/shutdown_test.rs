// Integration tests for the shutdown workflow

mod common;

use std::time::Duration;

use common::{create_request, Harness};
use instancer_common::bus::{DeletionReason, LifecycleEvent};
use instancer_common::InstanceStatus;
use instancer_orchestrator::OrchestratorError;
use instancer_providers::ProviderError;
use uuid::Uuid;

async fn running_instance(h: &Harness) -> Uuid {
    let req = create_request(1, 2048);
    let id = req.id;
    h.orchestrator.create_instance(req).await.unwrap();
    h.settle().await;
    assert_eq!(h.record(id).await.status(), InstanceStatus::Running);
    id
}

fn deletion_events(h: &Harness, id: Uuid) -> Vec<LifecycleEvent> {
    h.publisher
        .events_for(id)
        .into_iter()
        .filter(|e| !matches!(e, LifecycleEvent::Created { .. }))
        .collect()
}

#[tokio::test]
async fn test_shutdown_marks_deleted_before_ack_then_deletes() {
    let h = Harness::new();
    let id = running_instance(&h).await;

    h.orchestrator.shutdown_instance(id).await.unwrap();
    // Marked synchronously.
    assert_eq!(h.record(id).await.status(), InstanceStatus::Deleted);

    h.settle().await;
    let record = h.record(id).await;
    assert!(record.is_deletion_triaged);
    assert!(record.started_at.is_some());
    assert!(!h.provider.has_instance(id));
    assert_eq!(
        deletion_events(&h, id),
        vec![LifecycleEvent::Deleted {
            reason: DeletionReason::Shutdown
        }]
    );
}

#[tokio::test]
async fn test_shutdown_of_vanished_instance_reports_terminated() {
    let h = Harness::new();
    let id = running_instance(&h).await;
    assert!(h.provider.remove_instance(id));

    h.orchestrator.shutdown_instance(id).await.unwrap();
    h.settle().await;

    assert!(h.record(id).await.is_deletion_triaged);
    assert_eq!(
        deletion_events(&h, id),
        vec![LifecycleEvent::Deleted {
            reason: DeletionReason::Terminated
        }]
    );
}

#[tokio::test]
async fn test_shutdown_unknown_instance_is_not_found() {
    let h = Harness::new();
    let id = Uuid::new_v4();
    assert_eq!(
        h.orchestrator.shutdown_instance(id).await,
        Err(OrchestratorError::NotFound(id))
    );
}

#[tokio::test]
async fn test_provider_delete_failure_leaves_record_for_collector() {
    let h = Harness::new();
    let id = running_instance(&h).await;
    h.provider
        .fail_deletes(Some(ProviderError::Api("throttled".to_string())));

    h.orchestrator.shutdown_instance(id).await.unwrap();
    h.settle().await;

    let record = h.record(id).await;
    assert_eq!(record.status(), InstanceStatus::Deleted);
    assert!(!record.is_deletion_triaged);
    assert!(h.provider.has_instance(id));
    assert!(deletion_events(&h, id).is_empty());
}

#[tokio::test]
async fn test_repeated_shutdown_after_triage_is_a_no_op() {
    let h = Harness::new();
    let id = running_instance(&h).await;

    h.orchestrator.shutdown_instance(id).await.unwrap();
    h.settle().await;
    h.orchestrator.shutdown_instance(id).await.unwrap();
    h.settle().await;

    assert_eq!(h.provider.delete_calls(), 1);
    assert_eq!(deletion_events(&h, id).len(), 1);
}

#[tokio::test]
async fn test_shutdown_while_booting_wins_over_creation() {
    let h = Harness::new();
    h.provider.set_boot_delay(Duration::from_millis(100));
    let req = create_request(1, 2048);
    let id = req.id;

    h.orchestrator.create_instance(req).await.unwrap();
    h.orchestrator.shutdown_instance(id).await.unwrap();
    h.settle().await;

    let record = h.record(id).await;
    assert_eq!(record.status(), InstanceStatus::Deleted);
    assert!(record.is_deletion_triaged);
    // Never resurrected by the creation task.
    assert!(record.booted_at.is_none());
    assert!(!h.provider.has_instance(id));
    assert_eq!(
        h.publisher.events_for(id),
        vec![LifecycleEvent::Deleted {
            reason: DeletionReason::Shutdown
        }]
    );
}

#[tokio::test]
async fn test_concurrent_shutdowns_delete_once() {
    let h = Harness::new();
    let id = running_instance(&h).await;

    let (a, b) = tokio::join!(
        h.orchestrator.shutdown_instance(id),
        h.orchestrator.shutdown_instance(id)
    );
    a.unwrap();
    b.unwrap();
    h.settle().await;

    let record = h.record(id).await;
    assert!(record.is_deletion_triaged);
    assert!(!h.provider.has_instance(id));
    // The second task finds the instance already gone.
    let events = deletion_events(&h, id);
    assert!(!events.is_empty() && events.len() <= 2);
    assert!(events.contains(&LifecycleEvent::Deleted {
        reason: DeletionReason::Shutdown
    }));
}
